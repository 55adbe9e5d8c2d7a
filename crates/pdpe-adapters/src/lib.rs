//! Source collector contracts + fixture-first collector implementations.
//!
//! A collector hands the pipeline already-parsed records; page scraping and
//! browser automation stay outside this workspace.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pdpe_core::{CollectionError, ContextReading, GeoBounds, RawEvent, RawRecord};
use pdpe_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pdpe-adapters";

pub const DEFAULT_TIME_PERIOD_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Venues,
    Events,
    Weather,
    Traffic,
    SocialSentiment,
    FootTraffic,
    Demographics,
    Economic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionPhase {
    Priority,
    Secondary,
}

impl SourceKind {
    pub fn phase(&self) -> CollectionPhase {
        match self {
            SourceKind::Venues | SourceKind::Events => CollectionPhase::Priority,
            _ => CollectionPhase::Secondary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Venues => "venues",
            SourceKind::Events => "events",
            SourceKind::Weather => "weather",
            SourceKind::Traffic => "traffic",
            SourceKind::SocialSentiment => "social_sentiment",
            SourceKind::FootTraffic => "foot_traffic",
            SourceKind::Demographics => "demographics",
            SourceKind::Economic => "economic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Fixture,
    Http,
}

/// Parameters shared by every collector in one run.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectContext {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
    pub area_bounds: GeoBounds,
    pub time_period: Duration,
}

impl CollectContext {
    pub fn new(run_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            now,
            area_bounds: GeoBounds::default(),
            time_period: Duration::days(DEFAULT_TIME_PERIOD_DAYS),
        }
    }

    pub fn with_area(mut self, area_bounds: Option<GeoBounds>, time_period: Option<Duration>) -> Self {
        if let Some(bounds) = area_bounds {
            self.area_bounds = bounds;
        }
        if let Some(period) = time_period {
            self.time_period = period;
        }
        self
    }

    /// Latest event start time still inside the collection window.
    pub fn horizon(&self) -> DateTime<Utc> {
        self.now + self.time_period
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectorOutput {
    #[serde(default)]
    pub venues: Vec<RawRecord>,
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub context: Vec<ContextReading>,
}

impl CollectorOutput {
    pub fn item_count(&self) -> usize {
        self.venues.len() + self.events.len() + self.context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    /// Drop venues and weather outside the area, and events starting past the horizon.
    /// Records without coordinates or start time are kept.
    pub fn within(mut self, ctx: &CollectContext) -> Self {
        let bounds = ctx.area_bounds;
        let horizon = ctx.horizon();
        self.venues
            .retain(|v| v.location().map_or(true, |p| bounds.contains(&p)));
        self.events
            .retain(|e| e.start_time.map_or(true, |start| start <= horizon));
        self.context.retain(|reading| match reading {
            ContextReading::Weather(w) => bounds.contains(&w.location()),
            _ => true,
        });
        self
    }
}

#[async_trait]
pub trait SourceCollector: Send + Sync {
    fn source_name(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn collect(&self, ctx: &CollectContext) -> Result<CollectorOutput, CollectionError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_name: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub captured_from: Option<String>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub output: CollectorOutput,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays a checked-in bundle as if it had just been collected.
#[derive(Debug, Clone)]
pub struct FixtureCollector {
    source_name: String,
    kind: SourceKind,
    path: PathBuf,
}

impl FixtureCollector {
    pub fn new(source_name: impl Into<String>, kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_name: source_name.into(),
            kind,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceCollector for FixtureCollector {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn collect(&self, ctx: &CollectContext) -> Result<CollectorOutput, CollectionError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            CollectionError::Validation(format!("reading fixture {}: {err}", self.path.display()))
        })?;
        let bundle: FixtureBundle = serde_json::from_str(&text).map_err(|err| {
            CollectionError::Validation(format!("parsing fixture {}: {err}", self.path.display()))
        })?;
        if bundle.source_name != self.source_name {
            return Err(CollectionError::Validation(format!(
                "bundle source_name={} does not match collector source_name={}",
                bundle.source_name, self.source_name
            )));
        }
        if bundle.kind != self.kind {
            return Err(CollectionError::Validation(format!(
                "bundle kind={} does not match collector kind={}",
                bundle.kind.as_str(),
                self.kind.as_str()
            )));
        }
        debug!(
            source_name = %self.source_name,
            items = bundle.output.item_count(),
            "fixture bundle loaded"
        );
        Ok(bundle.output.within(ctx))
    }
}

/// Pulls a JSON document shaped like [`CollectorOutput`] from an upstream feed.
#[derive(Debug, Clone)]
pub struct HttpFeedCollector {
    source_name: String,
    kind: SourceKind,
    url: String,
    http: Arc<HttpFetcher>,
}

impl HttpFeedCollector {
    pub fn new(source_name: impl Into<String>, kind: SourceKind, url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_name: source_name.into(),
            kind,
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl SourceCollector for HttpFeedCollector {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn collect(&self, ctx: &CollectContext) -> Result<CollectorOutput, CollectionError> {
        let output: CollectorOutput = self.http.fetch_json(&self.source_name, &self.url).await?;
        Ok(output.within(ctx))
    }
}

/// Collector over records already held in memory.
#[derive(Debug, Clone)]
pub struct StaticCollector {
    source_name: String,
    kind: SourceKind,
    output: CollectorOutput,
}

impl StaticCollector {
    pub fn new(source_name: impl Into<String>, kind: SourceKind, output: CollectorOutput) -> Self {
        Self {
            source_name: source_name.into(),
            kind,
            output,
        }
    }
}

#[async_trait]
impl SourceCollector for StaticCollector {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn collect(&self, ctx: &CollectContext) -> Result<CollectorOutput, CollectionError> {
        Ok(self.output.clone().within(ctx))
    }
}

/// One `sources.yaml` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_name: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    pub mode: SourceMode,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("source {source_name} is missing `{field}`")]
    MissingField { source_name: String, field: &'static str },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub fn bundle_path_for(workspace_root: &Path, source: &SourceConfig) -> PathBuf {
    match &source.path {
        Some(path) => workspace_root.join(path),
        None => workspace_root
            .join("fixtures")
            .join(&source.source_name)
            .join("bundle.json"),
    }
}

pub fn collector_for_source(
    source: &SourceConfig,
    workspace_root: &Path,
    http: Option<Arc<HttpFetcher>>,
) -> Result<Box<dyn SourceCollector>, AdapterError> {
    match source.mode {
        SourceMode::Fixture => Ok(Box::new(FixtureCollector::new(
            source.source_name.clone(),
            source.kind,
            bundle_path_for(workspace_root, source),
        ))),
        SourceMode::Http => {
            let url = source.url.clone().ok_or_else(|| AdapterError::MissingField {
                source_name: source.source_name.clone(),
                field: "url",
            })?;
            let http = http.ok_or_else(|| {
                AdapterError::Message(format!(
                    "source {} needs an HTTP client but none was configured",
                    source.source_name
                ))
            })?;
            Ok(Box::new(HttpFeedCollector::new(
                source.source_name.clone(),
                source.kind,
                url,
                http,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pdpe_core::WeatherReading;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).single().unwrap()
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn raw(name: &str, lat: Option<f64>, lng: Option<f64>) -> RawRecord {
        RawRecord {
            external_id: name.to_lowercase(),
            provider: "google_places".into(),
            name: name.into(),
            category: None,
            subcategory: None,
            lat,
            lng,
            address: None,
            psychographic_relevance: None,
            timestamp: now(),
        }
    }

    #[test]
    fn phases_split_priority_from_secondary() {
        assert_eq!(SourceKind::Venues.phase(), CollectionPhase::Priority);
        assert_eq!(SourceKind::Events.phase(), CollectionPhase::Priority);
        assert_eq!(SourceKind::FootTraffic.phase(), CollectionPhase::Secondary);
        assert!(SourceKind::Venues < SourceKind::Events);
    }

    #[test]
    fn output_filter_keeps_unlocated_records() {
        let ctx = CollectContext::new(Uuid::new_v4(), now());
        let output = CollectorOutput {
            venues: vec![
                raw("Power & Light", Some(39.0997), Some(-94.5786)),
                raw("St. Louis Arch", Some(38.6247), Some(-90.1848)),
                raw("Somewhere Downtown", None, None),
            ],
            events: vec![],
            context: vec![ContextReading::Weather(WeatherReading {
                lat: 41.88,
                lng: -87.63,
                ts: now(),
                temperature_f: 31.0,
                feels_like_f: None,
                humidity: None,
                condition: None,
                wind_speed_mph: None,
                rain_probability: None,
            })],
        }
        .within(&ctx);

        let names: Vec<&str> = output.venues.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["Power & Light", "Somewhere Downtown"]);
        assert!(output.context.is_empty());
    }

    #[test]
    fn narrower_window_moves_horizon() {
        let ctx = CollectContext::new(Uuid::new_v4(), now()).with_area(None, Some(Duration::days(7)));
        assert_eq!(ctx.horizon(), now() + Duration::days(7));
        assert_eq!(ctx.area_bounds, GeoBounds::default());
    }

    #[test]
    fn http_source_without_url_is_rejected() {
        let source = SourceConfig {
            source_name: "predicthq".into(),
            display_name: "PredictHQ".into(),
            enabled: true,
            kind: SourceKind::Events,
            mode: SourceMode::Http,
            path: None,
            url: None,
            notes: None,
        };
        let err = collector_for_source(&source, &workspace_root(), None)
            .err()
            .expect("missing url must fail");
        assert!(matches!(err, AdapterError::MissingField { field: "url", .. }));
    }

    #[test]
    fn fixture_sources_default_to_bundle_path() {
        let source = SourceConfig {
            source_name: "tmobile_center".into(),
            display_name: "T-Mobile Center".into(),
            enabled: true,
            kind: SourceKind::Venues,
            mode: SourceMode::Fixture,
            path: None,
            url: None,
            notes: None,
        };
        let path = bundle_path_for(Path::new("/srv/pdpe"), &source);
        assert_eq!(path, PathBuf::from("/srv/pdpe/fixtures/tmobile_center/bundle.json"));

        let collector = collector_for_source(&source, Path::new("/srv/pdpe"), None).unwrap();
        assert_eq!(collector.source_name(), "tmobile_center");
        assert_eq!(collector.kind(), SourceKind::Venues);
    }

    #[tokio::test]
    async fn mismatched_bundle_is_a_validation_failure() {
        let collector = FixtureCollector::new(
            "not_tmobile",
            SourceKind::Venues,
            workspace_root().join("fixtures/tmobile_center/bundle.json"),
        );
        let err = collector
            .collect(&CollectContext::new(Uuid::new_v4(), now()))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::Validation(msg) if msg.contains("does not match")));
    }

    #[tokio::test]
    async fn missing_bundle_is_a_validation_failure() {
        let collector = FixtureCollector::new("ghost", SourceKind::Weather, workspace_root().join("fixtures/ghost/bundle.json"));
        let err = collector
            .collect(&CollectContext::new(Uuid::new_v4(), now()))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::Validation(_)));
    }
}
