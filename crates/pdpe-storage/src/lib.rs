//! Persistence contract, store implementations and HTTP fetch utilities for PDPE.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pdpe_core::{
    CanonicalEvent, CanonicalVenue, CollectionError, CollectionResult, ContextReading,
    DemographicTract, FootTrafficReading, GeoBounds, Prediction, PsychographicScore,
    SocialSentimentReading, TrafficReading, WeatherReading,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;

pub use http::{is_transient_status, FetchError, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "pdpe-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<StoreError> for CollectionError {
    fn from(err: StoreError) -> Self {
        CollectionError::Database(err.to_string())
    }
}

/// Closed interval `[start, end]` a context reading must fall in to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReadingWindow {
    /// The `span` leading up to and including `now`.
    pub fn ending_at(now: DateTime<Utc>, span: chrono::Duration) -> Self {
        Self { start: now - span, end: now }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Venue,
    Event,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Venue => "venue",
            EntityKind::Event => "event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub score: PsychographicScore,
    pub profile_completeness: Option<f64>,
    pub model_version: Option<String>,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStatusRow {
    pub source_name: String,
    pub last_run_at: DateTime<Utc>,
    pub last_successful_collection: Option<DateTime<Utc>>,
    pub collection_health_score: Option<f64>,
    pub success: bool,
    pub records_collected: usize,
    pub error_message: Option<String>,
}

impl CollectionStatusRow {
    /// Fold a new run result into the previous status row for the same source.
    pub fn apply(previous: Option<&CollectionStatusRow>, result: &CollectionResult, at: DateTime<Utc>) -> Self {
        let last_successful_collection = if result.success {
            Some(at)
        } else {
            previous.and_then(|p| p.last_successful_collection)
        };
        Self {
            source_name: result.source_name.clone(),
            last_run_at: at,
            last_successful_collection,
            collection_health_score: result.quality_score,
            success: result.success,
            records_collected: result.records_collected,
            error_message: result.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VenueStatistics {
    pub total_venues: usize,
    pub geocoded_venues: usize,
    pub venues_with_psychographic: usize,
    pub total_events: usize,
}

/// Query and upsert contract of the backing store.
///
/// Venue and event upserts are keyed on `(external_id, provider)` and each call is
/// atomic: either the whole batch lands or none of it does.
#[async_trait]
pub trait MasterDataStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Canonical venues in creation order.
    async fn load_venues(&self) -> Result<Vec<CanonicalVenue>, StoreError>;
    async fn load_events(&self) -> Result<Vec<CanonicalEvent>, StoreError>;
    async fn upsert_venues(&self, venues: &[CanonicalVenue]) -> Result<usize, StoreError>;
    async fn upsert_events(&self, events: &[CanonicalEvent]) -> Result<usize, StoreError>;

    async fn insert_context(&self, readings: &[ContextReading<Uuid>]) -> Result<usize, StoreError>;
    async fn weather_in(
        &self,
        bounds: GeoBounds,
        window: ReadingWindow,
    ) -> Result<Vec<WeatherReading>, StoreError>;
    async fn latest_traffic(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<TrafficReading>, StoreError>;
    async fn latest_social_sentiment(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<SocialSentimentReading>, StoreError>;
    async fn latest_foot_traffic(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<FootTrafficReading>, StoreError>;
    async fn demographic_tracts(&self) -> Result<Vec<DemographicTract>, StoreError>;

    /// Events at `venue_id` with no start time or a start time at/after `now`,
    /// earliest first with undated events last.
    async fn upcoming_events(
        &self,
        venue_id: Uuid,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CanonicalEvent>, StoreError>;

    async fn save_prediction(
        &self,
        venue_id: Uuid,
        prediction: &Prediction,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn latest_prediction(&self, venue_id: Uuid) -> Result<Option<Prediction>, StoreError>;
    async fn save_scores(&self, scores: &[ScoreRecord]) -> Result<usize, StoreError>;

    async fn record_collection_results(
        &self,
        results: &[CollectionResult],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn collection_status(&self) -> Result<Vec<CollectionStatusRow>, StoreError>;
    async fn venue_statistics(&self) -> Result<VenueStatistics, StoreError>;

    /// Full recompute of the `master_venue_data` / `master_events_data` views.
    async fn refresh_master_views(&self) -> Result<(), StoreError>;
}
