//! Collection orchestrator: runs registered collectors in priority phases,
//! folds their output through identity resolution into the store, scores the
//! canonical venues and aggregates everything into a run report.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pdpe_adapters::{
    CollectContext, CollectionPhase, CollectorOutput, SourceCollector, DEFAULT_TIME_PERIOD_DAYS,
};
use pdpe_core::{
    CanonicalVenue, CollectionError, CollectionResult, ContextSnapshot, GeoBounds, HealthMetrics,
    MasterDataStatus, PsychographicScore, QualityReport, RunReport, ScoringSummary,
    SocialSentimentReading,
};
use pdpe_storage::{CollectionStatusRow, EntityKind, MasterDataStore, ScoreRecord, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::enrichment::{EnrichmentConfig, EnrichmentService};
use crate::prediction::{PredictionError, Predictor};
use crate::quality::{check_batch, log_quality_metrics, ProfileChecklist, Validate};
use crate::reports::{write_run_reports, ScoredVenue};
use crate::resolver::{categorize_provider, IdentityResolver, ResolverConfig};
use crate::scoring::{ScoringConfig, ScoringEngine};

pub const UNIFIED_VENUES_SOURCE: &str = "unified_venues";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    PriorityPhase,
    SecondaryPhase,
    ScoringPhase,
    Done,
}

struct RunState {
    run_id: Uuid,
    phase: RunPhase,
}

impl RunState {
    fn new(run_id: Uuid) -> Self {
        info!(%run_id, phase = ?RunPhase::Init, "run started");
        Self {
            run_id,
            phase: RunPhase::Init,
        }
    }

    fn advance(&mut self, next: RunPhase) {
        debug_assert!(next > self.phase);
        info!(run_id = %self.run_id, from = ?self.phase, to = ?next, "run phase");
        self.phase = next;
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub collector_timeout: Duration,
    pub default_bounds: GeoBounds,
    pub time_period: chrono::Duration,
    pub resolver: ResolverConfig,
    pub enrichment: EnrichmentConfig,
    pub scoring: ScoringConfig,
    pub reports_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            collector_timeout: Duration::from_secs(120),
            default_bounds: GeoBounds::default(),
            time_period: chrono::Duration::days(DEFAULT_TIME_PERIOD_DAYS),
            resolver: ResolverConfig::default(),
            enrichment: EnrichmentConfig::default(),
            scoring: ScoringConfig::default(),
            reports_dir: None,
        }
    }
}

/// Which registered collectors a run invokes.
#[derive(Debug, Clone)]
enum RunScope {
    All,
    Priority,
    Named(Vec<String>),
}

impl RunScope {
    fn includes(&self, collector: &dyn SourceCollector) -> bool {
        match self {
            RunScope::All => true,
            RunScope::Priority => collector.kind().phase() == CollectionPhase::Priority,
            RunScope::Named(names) => names.iter().any(|n| n == collector.source_name()),
        }
    }

    fn scores(&self) -> bool {
        !matches!(self, RunScope::Named(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueHealth {
    pub total_venues: usize,
    pub geocoded_venues: usize,
    pub venues_with_psychographic: usize,
    pub total_events: usize,
    pub geocoding_completeness: f64,
    pub psychographic_completeness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venues: Option<VenueHealth>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_sources: Vec<CollectionStatusRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_health_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources_collected_last_24h: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    fn failed(generated_at: DateTime<Utc>, err: &StoreError) -> Self {
        Self {
            generated_at,
            venues: None,
            data_sources: Vec::new(),
            overall_health_score: None,
            sources_collected_last_24h: None,
            error: Some(err.to_string()),
        }
    }
}

/// Fold several venue collector results into one.
pub fn consolidate_results(source_name: &str, results: &[CollectionResult]) -> CollectionResult {
    let duration: f64 = results.iter().map(|r| r.duration_seconds).sum();
    let successful: Vec<&CollectionResult> = results.iter().filter(|r| r.success).collect();
    let errors: Vec<&str> = results
        .iter()
        .filter_map(|r| r.error_message.as_deref())
        .collect();

    if successful.is_empty() {
        let message = if errors.is_empty() {
            "no venue collectors registered".to_string()
        } else {
            errors.join("; ")
        };
        return CollectionResult {
            source_name: source_name.to_string(),
            success: false,
            records_collected: 0,
            duration_seconds: duration,
            quality_score: None,
            error_message: Some(message),
        };
    }

    let qualities: Vec<f64> = successful.iter().filter_map(|r| r.quality_score).collect();
    let quality = (!qualities.is_empty()).then(|| qualities.iter().sum::<f64>() / qualities.len() as f64);
    let mut result = CollectionResult::succeeded(
        source_name,
        successful.iter().map(|r| r.records_collected).sum(),
        duration,
        quality,
    );
    if !errors.is_empty() {
        result.error_message = Some(errors.join("; "));
    }
    result
}

pub struct Orchestrator {
    store: Arc<dyn MasterDataStore>,
    collectors: Vec<Box<dyn SourceCollector>>,
    predictor: Arc<dyn Predictor>,
    enrichment: EnrichmentService,
    scoring: ScoringEngine,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MasterDataStore>,
        mut collectors: Vec<Box<dyn SourceCollector>>,
        predictor: Arc<dyn Predictor>,
        config: OrchestratorConfig,
    ) -> Self {
        collectors.sort_by_key(|c| c.kind());
        Self {
            enrichment: EnrichmentService::new(store.clone(), config.enrichment.clone()),
            scoring: ScoringEngine::new(config.scoring),
            store,
            collectors,
            predictor,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn enrichment(&self) -> &EnrichmentService {
        &self.enrichment
    }

    /// Registered collector names in execution order.
    pub fn collector_names(&self) -> Vec<&str> {
        self.collectors.iter().map(|c| c.source_name()).collect()
    }

    pub async fn collect_all_data(
        &self,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
    ) -> RunReport {
        self.collect_all_data_at(area_bounds, time_period, Utc::now()).await
    }

    pub async fn collect_all_data_at(
        &self,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> RunReport {
        self.run(RunScope::All, area_bounds, time_period, now).await
    }

    /// Venues and events only, followed by scoring.
    pub async fn collect_priority_data(&self) -> RunReport {
        self.collect_priority_data_at(Utc::now()).await
    }

    pub async fn collect_priority_data_at(&self, now: DateTime<Utc>) -> RunReport {
        self.run(RunScope::Priority, None, None, now).await
    }

    /// Re-run the named collectors without a scoring pass.
    pub async fn refresh_data_sources(&self, names: &[&str]) -> RunReport {
        self.refresh_data_sources_at(names, Utc::now()).await
    }

    pub async fn refresh_data_sources_at(&self, names: &[&str], now: DateTime<Utc>) -> RunReport {
        for name in names {
            if !self.collectors.iter().any(|c| c.source_name() == *name) {
                warn!(source_name = %name, "refresh requested for unregistered source");
            }
        }
        let scope = RunScope::Named(names.iter().map(|n| n.to_string()).collect());
        self.run(scope, None, None, now).await
    }

    /// One result per venue collector.
    pub async fn collect_all_venues(&self) -> Vec<CollectionResult> {
        self.collect_all_venues_at(None, None, Utc::now()).await
    }

    pub async fn collect_all_venues_at(
        &self,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Vec<CollectionResult> {
        let run_id = Uuid::new_v4();
        self.venue_run_inner(run_id, area_bounds, time_period, now)
            .instrument(info_span!("collection_run", %run_id, scope = "venues"))
            .await
    }

    async fn venue_run_inner(
        &self,
        run_id: Uuid,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Vec<CollectionResult> {
        let venue_collectors: Vec<&dyn SourceCollector> = self
            .collectors
            .iter()
            .map(|c| c.as_ref())
            .filter(|c| c.kind() == pdpe_adapters::SourceKind::Venues)
            .collect();

        let mut resolver = match self.load_resolver().await {
            Ok(resolver) => resolver,
            Err(err) => {
                error!(error = %err, "store unavailable; venue collection skipped");
                let err = CollectionError::from(err);
                return venue_collectors
                    .iter()
                    .map(|c| CollectionResult::failed(c.source_name(), 0.0, &err))
                    .collect();
            }
        };

        let ctx = self.collect_context(run_id, now, area_bounds, time_period);
        let mut results = Vec::with_capacity(venue_collectors.len());
        for collector in venue_collectors {
            results.push(self.run_collector(collector, &ctx, &mut resolver).await);
        }
        info!(
            sources = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            "venue collection complete"
        );
        if let Err(err) = self.store.record_collection_results(&results, now).await {
            warn!(error = %err, "failed to record collection status");
        }
        results
    }

    /// Every venue collector consolidated into a single `unified_venues` result.
    pub async fn collect_data(
        &self,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
    ) -> CollectionResult {
        self.collect_data_at(area_bounds, time_period, Utc::now()).await
    }

    pub async fn collect_data_at(
        &self,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> CollectionResult {
        let results = self.collect_all_venues_at(area_bounds, time_period, now).await;
        consolidate_results(UNIFIED_VENUES_SOURCE, &results)
    }

    /// Enrich and score one venue against the current store contents.
    pub async fn score_venue(&self, venue: &CanonicalVenue) -> Result<PsychographicScore, StoreError> {
        let now = Utc::now();
        let snapshot = self.enrichment.enrich_at(venue, now).await?;
        let prediction = match self.predictor.predict(venue, &snapshot).await {
            Ok(p) => Some(p),
            Err(PredictionError::Missing(_)) => None,
            Err(PredictionError::Store(err)) => return Err(err),
        };
        Ok(self.scoring.score(venue, &snapshot, prediction.as_ref()))
    }

    pub async fn get_data_health_report(&self) -> HealthReport {
        self.get_data_health_report_at(Utc::now()).await
    }

    pub async fn get_data_health_report_at(&self, now: DateTime<Utc>) -> HealthReport {
        let stats = match self.store.venue_statistics().await {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "health report unavailable");
                return HealthReport::failed(now, &err);
            }
        };
        let data_sources = match self.store.collection_status().await {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "health report unavailable");
                return HealthReport::failed(now, &err);
            }
        };

        let ratio = |part: usize| {
            if stats.total_venues == 0 {
                0.0
            } else {
                part as f64 / stats.total_venues as f64
            }
        };
        let venues = VenueHealth {
            total_venues: stats.total_venues,
            geocoded_venues: stats.geocoded_venues,
            venues_with_psychographic: stats.venues_with_psychographic,
            total_events: stats.total_events,
            geocoding_completeness: ratio(stats.geocoded_venues),
            psychographic_completeness: ratio(stats.venues_with_psychographic),
        };
        let overall = (venues.geocoding_completeness + venues.psychographic_completeness) / 2.0;
        let day_ago = now - chrono::Duration::hours(24);
        let recent = data_sources
            .iter()
            .filter(|row| row.last_successful_collection.is_some_and(|at| at >= day_ago))
            .count();

        HealthReport {
            generated_at: now,
            venues: Some(venues),
            data_sources,
            overall_health_score: Some(overall),
            sources_collected_last_24h: Some(recent),
            error: None,
        }
    }

    async fn run(
        &self,
        scope: RunScope,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, scope, area_bounds, time_period, now)
            .instrument(info_span!("collection_run", %run_id))
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        scope: RunScope,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
        now: DateTime<Utc>,
    ) -> RunReport {
        let mut state = RunState::new(run_id);

        let mut resolver = match self.load_resolver().await {
            Ok(resolver) => resolver,
            Err(err) => {
                error!(error = %err, "backing store unreachable; aborting run");
                return RunReport::Aborted {
                    error: err.to_string(),
                    at: now,
                };
            }
        };

        let ctx = self.collect_context(run_id, now, area_bounds, time_period);
        let mut results = Vec::new();

        for phase in [CollectionPhase::Priority, CollectionPhase::Secondary] {
            state.advance(match phase {
                CollectionPhase::Priority => RunPhase::PriorityPhase,
                CollectionPhase::Secondary => RunPhase::SecondaryPhase,
            });
            for collector in self
                .collectors
                .iter()
                .filter(|c| c.kind().phase() == phase && scope.includes(c.as_ref()))
            {
                results.push(self.run_collector(collector.as_ref(), &ctx, &mut resolver).await);
            }
        }

        state.advance(RunPhase::ScoringPhase);
        let mut scored = Vec::new();
        let scoring = if scope.scores() {
            match self.scoring_phase(now).await {
                Ok((summary, venues)) => {
                    scored = venues;
                    Some(summary)
                }
                Err(err) => {
                    error!(error = %err, "scoring phase failed");
                    None
                }
            }
        } else {
            None
        };

        if let Err(err) = self.store.record_collection_results(&results, now).await {
            warn!(error = %err, "failed to record collection status");
        }

        let health = HealthMetrics::from_results(&results);
        let status = MasterDataStatus {
            run_id,
            last_refresh: now,
            total_venues: resolver.venues().len(),
            total_events: resolver.events().len(),
            data_completeness: health.data_completeness,
            collection_results: results,
            health_score: health.health_score,
            scoring,
            review_candidates: resolver.review_queue().len(),
        };

        if let Some(dir) = &self.config.reports_dir {
            match write_run_reports(dir, &status, &scored, resolver.review_queue()).await {
                Ok(artifacts) => info!(reports_dir = %artifacts.run_dir.display(), "run reports written"),
                Err(err) => warn!(error = %format!("{err:#}"), "failed to write run reports"),
            }
        }

        state.advance(RunPhase::Done);
        info!(
            total_venues = status.total_venues,
            total_events = status.total_events,
            health_score = status.health_score,
            "collection run finished"
        );
        RunReport::Completed(status)
    }

    async fn load_resolver(&self) -> Result<IdentityResolver, StoreError> {
        self.store.ping().await?;
        let venues = self.store.load_venues().await?;
        let events = self.store.load_events().await?;
        Ok(IdentityResolver::with_existing(self.config.resolver, venues, events))
    }

    fn collect_context(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        area_bounds: Option<GeoBounds>,
        time_period: Option<chrono::Duration>,
    ) -> CollectContext {
        CollectContext::new(run_id, now).with_area(
            Some(area_bounds.unwrap_or(self.config.default_bounds)),
            Some(time_period.unwrap_or(self.config.time_period)),
        )
    }

    async fn run_collector(
        &self,
        collector: &dyn SourceCollector,
        ctx: &CollectContext,
        resolver: &mut IdentityResolver,
    ) -> CollectionResult {
        let source_name = collector.source_name().to_string();
        let span = info_span!("collector", source_name = %source_name, kind = collector.kind().as_str());
        async {
            let started = Instant::now();
            info!("collector started");
            let outcome = match tokio::time::timeout(self.config.collector_timeout, collector.collect(ctx)).await {
                Ok(Ok(output)) => self.ingest(&source_name, output, resolver).await,
                Ok(Err(err)) => Err(err),
                Err(_) => Err(CollectionError::Timeout(self.config.collector_timeout)),
            };
            let elapsed = started.elapsed().as_secs_f64();
            match outcome {
                Ok((records, quality)) => {
                    info!(records, quality = ?quality, elapsed, "collector finished");
                    CollectionResult::succeeded(source_name.clone(), records, elapsed, quality)
                }
                Err(err) => {
                    warn!(error = %err, elapsed, "collector failed");
                    CollectionResult::failed(source_name.clone(), elapsed, &err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Resolve and persist one collector's output. Returns the number of valid
    /// items and the batch quality score.
    async fn ingest(
        &self,
        source_name: &str,
        output: CollectorOutput,
        resolver: &mut IdentityResolver,
    ) -> Result<(usize, Option<f64>), CollectionError> {
        let CollectorOutput {
            venues,
            events,
            context,
        } = output;

        let mut report = check_batch(&venues);
        report.merge(check_batch(&events));

        for raw in venues.iter().filter(|r| r.is_valid()) {
            if let Err(err) = resolver.resolve(raw) {
                warn!(error = %err, "venue rejected");
            }
        }
        for raw in events.iter().filter(|e| e.is_valid()) {
            if let Err(err) = resolver.resolve_event(raw) {
                warn!(error = %err, "event rejected");
            }
        }

        let context_total = context.len();
        let mut keyed = Vec::with_capacity(context_total);
        let mut context_issues = Vec::new();
        for reading in context {
            if let Some(issue) = reading.validation_issue() {
                context_issues.push(issue);
                continue;
            }
            let label = reading.label();
            let venue_name = reading.venue().cloned().unwrap_or_default();
            match reading.map_venue(|name| resolver.find(&name)) {
                Some(keyed_reading) => keyed.push(keyed_reading),
                None => context_issues.push(format!("{label} reading for unknown venue `{venue_name}`")),
            }
        }
        report.merge(QualityReport::new(context_total, keyed.len(), context_issues));
        log_quality_metrics(source_name, &report);

        let venues = resolver.pending_venues();
        let events = resolver.pending_events();
        if !venues.is_empty() {
            self.store.upsert_venues(&venues).await?;
        }
        if !events.is_empty() {
            self.store.upsert_events(&events).await?;
        }
        if !keyed.is_empty() {
            self.store.insert_context(&keyed).await?;
        }
        resolver.mark_flushed();

        let quality = (report.total > 0).then_some(report.completeness_score);
        Ok((report.valid, quality))
    }

    async fn scoring_phase(&self, now: DateTime<Utc>) -> Result<(ScoringSummary, Vec<ScoredVenue>), StoreError> {
        let started = Instant::now();
        let venues = self.store.load_venues().await?;
        let events = self.store.load_events().await?;

        let mut records = Vec::with_capacity(venues.len() + events.len());
        let mut scored = Vec::with_capacity(venues.len());
        let mut social_by_venue: HashMap<Uuid, Option<SocialSentimentReading>> = HashMap::new();
        let mut predictions_missing = 0usize;

        for venue in venues {
            let snapshot: ContextSnapshot = self.enrichment.enrich_at(&venue, now).await?;
            let prediction = match self.predictor.predict(&venue, &snapshot).await {
                Ok(prediction) => {
                    if self.predictor.persist_outputs() {
                        self.store.save_prediction(venue.venue_id, &prediction, now).await?;
                    }
                    Some(prediction)
                }
                Err(PredictionError::Missing(_)) => {
                    predictions_missing += 1;
                    None
                }
                Err(PredictionError::Store(err)) => return Err(err),
            };

            let score = self.scoring.score(&venue, &snapshot, prediction.as_ref());
            let completeness = ProfileChecklist::evaluate(&venue, &snapshot).completeness_score();
            records.push(ScoreRecord {
                entity_kind: EntityKind::Venue,
                entity_id: venue.venue_id,
                score,
                profile_completeness: Some(completeness),
                model_version: prediction.map(|p| p.model_version),
                scored_at: now,
            });
            social_by_venue.insert(venue.venue_id, snapshot.social_sentiment.clone());
            scored.push(ScoredVenue {
                provider_category: categorize_provider(&venue.provider),
                event_count: snapshot.events.event_frequency,
                profile_completeness: completeness,
                score,
                venue,
            });
        }

        let mut events_scored = 0usize;
        for event in &events {
            let social = event
                .venue_id
                .and_then(|id| social_by_venue.get(&id))
                .and_then(Option::as_ref);
            records.push(ScoreRecord {
                entity_kind: EntityKind::Event,
                entity_id: event.event_id,
                score: self.scoring.score_event(event, social),
                profile_completeness: None,
                model_version: None,
                scored_at: now,
            });
            events_scored += 1;
        }

        self.store.save_scores(&records).await?;
        self.store.refresh_master_views().await?;

        let venues_scored = scored.len();
        let mean = |values: Vec<f64>| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };
        let summary = ScoringSummary {
            venues_scored,
            events_scored,
            predictions_missing,
            avg_contextual_score: mean(scored.iter().map(|s| s.score.contextual_score).collect()),
            avg_profile_completeness: mean(scored.iter().map(|s| s.profile_completeness).collect()),
            duration_seconds: started.elapsed().as_secs_f64(),
        };
        info!(
            venues_scored,
            events_scored,
            predictions_missing,
            avg_contextual_score = summary.avg_contextual_score,
            "scoring phase finished"
        );
        Ok((summary, scored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pdpe_adapters::{SourceKind, StaticCollector};
    use pdpe_core::{PsychographicRelevance, RawRecord};
    use pdpe_storage::InMemoryStore;

    use crate::prediction::BaselinePredictor;
    use crate::scoring::WeightProfile;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).single().unwrap()
    }

    struct FailingCollector;

    #[async_trait]
    impl SourceCollector for FailingCollector {
        fn source_name(&self) -> &str {
            "broken_places"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Venues
        }

        async fn collect(&self, _ctx: &CollectContext) -> Result<CollectorOutput, CollectionError> {
            Err(CollectionError::Network("connection reset by peer".into()))
        }
    }

    struct SlowCollector;

    #[async_trait]
    impl SourceCollector for SlowCollector {
        fn source_name(&self) -> &str {
            "slow_weather"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Weather
        }

        async fn collect(&self, _ctx: &CollectContext) -> Result<CollectorOutput, CollectionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(CollectorOutput::default())
        }
    }

    fn raw(name: &str, lat: f64, lng: f64) -> RawRecord {
        RawRecord {
            external_id: name.to_lowercase().replace(' ', "-"),
            provider: "tmobile_center".into(),
            name: name.into(),
            category: Some("entertainment".into()),
            subcategory: None,
            lat: Some(lat),
            lng: Some(lng),
            address: None,
            psychographic_relevance: Some(PsychographicRelevance {
                career_driven: 0.3,
                competent: 0.5,
                fun: 0.9,
            }),
            timestamp: now(),
        }
    }

    fn orchestrator(store: Arc<InMemoryStore>, collectors: Vec<Box<dyn SourceCollector>>) -> Orchestrator {
        let config = OrchestratorConfig {
            collector_timeout: Duration::from_millis(100),
            ..OrchestratorConfig::default()
        };
        Orchestrator::new(
            store,
            collectors,
            Arc::new(BaselinePredictor::new(WeightProfile::COMPREHENSIVE)),
            config,
        )
    }

    fn venues_collector() -> Box<dyn SourceCollector> {
        Box::new(StaticCollector::new(
            "tmobile_center",
            SourceKind::Venues,
            CollectorOutput {
                venues: vec![raw("T-Mobile Center", 39.0977, -94.58)],
                ..CollectorOutput::default()
            },
        ))
    }

    #[test]
    fn consolidation_sums_and_joins() {
        let results = vec![
            CollectionResult::succeeded("tmobile_center", 1, 0.5, Some(1.0)),
            CollectionResult::failed("broken_places", 0.25, &CollectionError::Network("reset".into())),
            CollectionResult::succeeded("google_places", 4, 1.0, Some(0.5)),
        ];
        let unified = consolidate_results(UNIFIED_VENUES_SOURCE, &results);
        assert!(unified.success);
        assert_eq!(unified.records_collected, 5);
        assert_eq!(unified.duration_seconds, 1.75);
        assert_eq!(unified.quality_score, Some(0.75));
        assert_eq!(unified.error_message.as_deref(), Some("network error: reset"));

        let none = consolidate_results(UNIFIED_VENUES_SOURCE, &results[1..2]);
        assert!(!none.success);
        assert_eq!(none.quality_score, None);
        assert!(!consolidate_results(UNIFIED_VENUES_SOURCE, &[]).success);
    }

    #[tokio::test]
    async fn failing_and_slow_collectors_are_isolated() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(
            store.clone(),
            vec![Box::new(SlowCollector), Box::new(FailingCollector), venues_collector()],
        );
        assert_eq!(orch.collector_names(), vec!["broken_places", "tmobile_center", "slow_weather"]);

        let report = orch.collect_all_data_at(None, None, now()).await;
        let status = report.status().expect("run completes");
        let by_name: HashMap<&str, &CollectionResult> = status
            .collection_results
            .iter()
            .map(|r| (r.source_name.as_str(), r))
            .collect();

        assert!(!by_name["broken_places"].success);
        assert!(by_name["tmobile_center"].success);
        assert_eq!(by_name["tmobile_center"].records_collected, 1);
        let slow = by_name["slow_weather"];
        assert!(!slow.success);
        assert!(slow.error_message.as_deref().unwrap_or_default().starts_with("timed out"));

        assert!((status.data_completeness - 1.0 / 3.0).abs() < 1e-9);
        assert!((status.health_score - (1.0 / 3.0 + 1.0) / 2.0).abs() < 1e-9);
        assert_eq!(status.total_venues, 1);
        assert_eq!(status.scoring.as_ref().map(|s| s.venues_scored), Some(1));
    }

    #[tokio::test]
    async fn store_outage_aborts_run_and_fails_venue_collection() {
        let store = Arc::new(InMemoryStore::new());
        store.set_outage(Some("connection refused")).await;
        let orch = orchestrator(store, vec![venues_collector()]);

        match orch.collect_all_data_at(None, None, now()).await {
            RunReport::Aborted { error, at } => {
                assert!(error.contains("connection refused"));
                assert_eq!(at, now());
            }
            other => panic!("expected abort, got {other:?}"),
        }

        let results = orch.collect_all_venues_at(None, None, now()).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error_message.as_deref().unwrap_or_default().starts_with("database error"));

        let health = orch.get_data_health_report_at(now()).await;
        assert!(health.error.is_some());
        assert!(health.venues.is_none());
    }

    #[tokio::test]
    async fn refresh_skips_scoring_and_unknown_names() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone(), vec![venues_collector(), Box::new(FailingCollector)]);
        let report = orch.refresh_data_sources_at(&["tmobile_center", "nope"], now()).await;
        let status = report.status().expect("run completes");
        assert_eq!(status.collection_results.len(), 1);
        assert!(status.scoring.is_none());
        assert_eq!(store.view_refreshes().await, 0);
    }

    #[tokio::test]
    async fn score_venue_uses_prediction_interval() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone(), vec![venues_collector()]);
        orch.collect_priority_data_at(now()).await;

        let venues = store.load_venues().await.unwrap();
        let score = orch.score_venue(&venues[0]).await.unwrap();
        assert!((score.base_score - 0.54).abs() < 1e-9);
        assert!((score.contextual_score - 0.54).abs() < 1e-9);
        assert!((score.confidence_lower.unwrap() - 0.44).abs() < 1e-9);
        assert!((score.confidence_upper.unwrap() - 0.64).abs() < 1e-9);

        store.set_outage(Some("connection refused")).await;
        assert!(orch.score_venue(&venues[0]).await.is_err());
    }

    #[tokio::test]
    async fn health_report_summarizes_store() {
        let store = Arc::new(InMemoryStore::new());
        let mut unlocated = raw("Record Bar", 0.0, 0.0);
        unlocated.lat = None;
        unlocated.lng = None;
        unlocated.psychographic_relevance = None;
        let orch = orchestrator(
            store,
            vec![
                venues_collector(),
                Box::new(StaticCollector::new(
                    "thepitchkc",
                    SourceKind::Venues,
                    CollectorOutput {
                        venues: vec![unlocated],
                        ..CollectorOutput::default()
                    },
                )),
            ],
        );
        orch.collect_all_data_at(None, None, now()).await;

        let health = orch.get_data_health_report_at(now() + chrono::Duration::hours(1)).await;
        let venues = health.venues.expect("venue stats");
        assert_eq!(venues.total_venues, 2);
        assert_eq!(venues.geocoding_completeness, 0.5);
        assert_eq!(venues.psychographic_completeness, 0.5);
        assert_eq!(health.overall_health_score, Some(0.5));
        assert_eq!(health.sources_collected_last_24h, Some(2));
        assert_eq!(health.data_sources.len(), 2);

        let later = orch.get_data_health_report_at(now() + chrono::Duration::hours(30)).await;
        assert_eq!(later.sources_collected_last_24h, Some(0));
    }
}
