//! Per-run report artifacts: health JSON, markdown brief and a parquet snapshot
//! of the scored master venue data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pdpe_core::{CanonicalVenue, MasterDataStatus, PsychographicScore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::resolver::{ProviderCategory, ReviewCandidate};

/// A canonical venue together with the outcome of the scoring phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredVenue {
    pub venue: CanonicalVenue,
    pub score: PsychographicScore,
    pub profile_completeness: f64,
    pub provider_category: ProviderCategory,
    pub event_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunArtifacts {
    pub run_dir: PathBuf,
    pub health_report: PathBuf,
    pub daily_brief: PathBuf,
    pub manifest: PathBuf,
}

/// Writes `<reports_root>/<run_id>/...` for one completed run.
pub async fn write_run_reports(
    reports_root: &Path,
    status: &MasterDataStatus,
    scored: &[ScoredVenue],
    review: &[ReviewCandidate],
) -> Result<RunArtifacts> {
    let run_dir = reports_root.join(status.run_id.to_string());
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let health_report = run_dir.join("health_report.json");
    let health_json = serde_json::to_vec_pretty(&serde_json::json!({
        "status": status,
        "review_candidates": review,
    }))
    .context("serializing health report")?;
    fs::write(&health_report, health_json)
        .await
        .with_context(|| format!("writing {}", health_report.display()))?;

    let daily_brief = run_dir.join("daily_brief.md");
    fs::write(&daily_brief, daily_brief_markdown(status, scored, review))
        .await
        .with_context(|| format!("writing {}", daily_brief.display()))?;

    let owned = scored.to_vec();
    let snapshot = tokio::task::spawn_blocking(move || encode_master_venue_parquet(&owned))
        .await
        .context("joining parquet encoder")??;
    let parquet_path = snapshot_dir.join("master_venue_data.parquet");
    fs::write(&parquet_path, &snapshot)
        .await
        .with_context(|| format!("writing {}", parquet_path.display()))?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![manifest_entry(
            "master_venue_data",
            "snapshots/master_venue_data.parquet",
            &snapshot,
        )],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(RunArtifacts {
        run_dir,
        health_report,
        daily_brief,
        manifest: manifest_path,
    })
}

pub fn daily_brief_markdown(status: &MasterDataStatus, scored: &[ScoredVenue], review: &[ReviewCandidate]) -> String {
    let mut lines = vec![
        "# PDPE Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", status.run_id),
        format!("- Refreshed: {}", status.last_refresh),
        format!("- Venues: {}", status.total_venues),
        format!("- Events: {}", status.total_events),
        format!("- Data completeness: {:.2}", status.data_completeness),
        format!("- Health score: {:.2}", status.health_score),
        String::new(),
        "## Sources".to_string(),
    ];
    for result in &status.collection_results {
        let outcome = if result.success {
            match result.quality_score {
                Some(q) => format!("ok, {} records, quality {q:.2}", result.records_collected),
                None => format!("ok, {} records", result.records_collected),
            }
        } else {
            format!("failed: {}", result.error_message.as_deref().unwrap_or("unknown error"))
        };
        lines.push(format!("- {}: {outcome}", result.source_name));
    }

    let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
    for item in scored {
        *by_category.entry(item.provider_category.as_str()).or_default() += 1;
    }
    if !by_category.is_empty() {
        lines.push(String::new());
        lines.push("## Venues by provider category".to_string());
        lines.extend(by_category.iter().map(|(k, v)| format!("- {k}: {v}")));
    }

    let mut top: Vec<&ScoredVenue> = scored.iter().collect();
    top.sort_by(|a, b| b.score.contextual_score.total_cmp(&a.score.contextual_score));
    if !top.is_empty() {
        lines.push(String::new());
        lines.push("## Top venues".to_string());
        for item in top.into_iter().take(10) {
            lines.push(format!(
                "- {} ({:.3}, profile {:.0}%)",
                item.venue.name,
                item.score.contextual_score,
                item.profile_completeness * 100.0
            ));
        }
    }

    if !review.is_empty() {
        lines.push(String::new());
        lines.push("## Possible duplicates".to_string());
        for candidate in review {
            lines.push(format!(
                "- {} ~ {} ({:.2})",
                candidate.venue_name, candidate.similar_venue_name, candidate.confidence
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Encodes the scored venues as a single-row-group parquet file held in memory.
fn encode_master_venue_parquet(scored: &[ScoredVenue]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("venue_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("provider", DataType::Utf8, false),
        ArrowField::new("provider_category", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("lat", DataType::Float64, true),
        ArrowField::new("lng", DataType::Float64, true),
        ArrowField::new("base_score", DataType::Float64, false),
        ArrowField::new("contextual_score", DataType::Float64, false),
        ArrowField::new("confidence_lower", DataType::Float64, true),
        ArrowField::new("confidence_upper", DataType::Float64, true),
        ArrowField::new("profile_completeness", DataType::Float64, false),
        ArrowField::new("event_count", DataType::UInt32, false),
    ]));

    let venue_ids: Vec<String> = scored.iter().map(|s| s.venue.venue_id.to_string()).collect();
    let columns: Vec<Arc<dyn arrow_array::Array>> = vec![
        Arc::new(StringArray::from(venue_ids)),
        Arc::new(StringArray::from(
            scored.iter().map(|s| s.venue.name.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            scored.iter().map(|s| s.venue.provider.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            scored.iter().map(|s| s.provider_category.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            scored.iter().map(|s| s.venue.category.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(scored.iter().map(|s| s.venue.lat).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(scored.iter().map(|s| s.venue.lng).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(
            scored.iter().map(|s| s.score.base_score).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            scored.iter().map(|s| s.score.contextual_score).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            scored.iter().map(|s| s.score.confidence_lower).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            scored.iter().map(|s| s.score.confidence_upper).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            scored.iter().map(|s| s.profile_completeness).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            scored.iter().map(|s| s.event_count as u32).collect::<Vec<_>>(),
        )),
    ];

    let batch = RecordBatch::try_new(schema, columns).context("building master venue record batch")?;
    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), None).context("opening master venue parquet writer")?;
    writer.write(&batch).context("writing master venue record batch")?;
    writer.close().context("closing master venue parquet writer")?;
    Ok(buf)
}

/// Describes one snapshot file by its path relative to the run directory.
pub fn manifest_entry(name: &str, rel_path: &str, contents: &[u8]) -> ManifestEntry {
    ManifestEntry {
        name: name.to_string(),
        path: rel_path.to_string(),
        sha256: hex::encode(Sha256::digest(contents)),
        bytes: contents.len() as u64,
    }
}
