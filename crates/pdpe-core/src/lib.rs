//! Core domain model for the PDPE master data pipeline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pdpe-core";

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Deterministic canonical identifier for an entity first seen as `provider:external_id`.
pub fn canonical_id(kind: &str, provider: &str, external_id: &str) -> Uuid {
    let key = format!("pdpe:{kind}:{provider}:{external_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

/// Clamp into `[0, 1]`; NaN collapses to zero.
pub fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance in meters.
    pub fn haversine_m(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }

    /// Squared planar distance in degrees. Only meaningful for ordering.
    pub fn planar_distance_sq(&self, other: &GeoPoint) -> f64 {
        (self.lat - other.lat).powi(2) + (self.lng - other.lng).powi(2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Default for GeoBounds {
    /// Kansas City metro.
    fn default() -> Self {
        Self {
            north: 39.3,
            south: 38.9,
            east: -94.3,
            west: -94.8,
        }
    }
}

impl GeoBounds {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lat <= self.north
            && point.lat >= self.south
            && point.lng <= self.east
            && point.lng >= self.west
    }

    /// Bounds covering every point within `radius_m` of `center`.
    pub fn around(center: &GeoPoint, radius_m: f64) -> Self {
        let dlat = (radius_m / EARTH_RADIUS_M).to_degrees();
        let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
        let dlng = dlat / cos_lat;
        Self {
            north: center.lat + dlat,
            south: center.lat - dlat,
            east: center.lng + dlng,
            west: center.lng - dlng,
        }
    }
}

/// Stated psychographic attributes, each expected in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PsychographicRelevance {
    #[serde(default)]
    pub career_driven: f64,
    #[serde(default)]
    pub competent: f64,
    #[serde(default)]
    pub fun: f64,
}

/// Identity of one upstream record: unique per raw source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub external_id: String,
    pub provider: String,
}

impl SourceKey {
    pub fn new(external_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            provider: provider.into(),
        }
    }
}

/// Parsed venue record handed over by a source collector. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub external_id: String,
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub psychographic_relevance: Option<PsychographicRelevance>,
    pub timestamp: DateTime<Utc>,
}

impl RawRecord {
    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(self.external_id.clone(), self.provider.clone())
    }

    pub fn location(&self) -> Option<GeoPoint> {
        Some(GeoPoint::new(self.lat?, self.lng?))
    }
}

/// Parsed event record handed over by a source collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub external_id: String,
    pub provider: String,
    pub name: String,
    pub venue_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub predicted_attendance: Option<f64>,
    #[serde(default)]
    pub psychographic_relevance: Option<PsychographicRelevance>,
    pub timestamp: DateTime<Utc>,
}

impl RawEvent {
    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(self.external_id.clone(), self.provider.clone())
    }
}

/// Deduplicated venue owning the merged attributes of every contributing raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalVenue {
    pub venue_id: Uuid,
    pub external_id: String,
    pub provider: String,
    pub name: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub address: Option<String>,
    pub psychographic_relevance: Option<PsychographicRelevance>,
    pub sources: Vec<SourceKey>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalVenue {
    pub fn location(&self) -> Option<GeoPoint> {
        Some(GeoPoint::new(self.lat?, self.lng?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: Uuid,
    pub external_id: String,
    pub provider: String,
    pub name: String,
    pub venue_id: Option<Uuid>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub predicted_attendance: Option<f64>,
    pub psychographic_relevance: Option<PsychographicRelevance>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub lat: f64,
    pub lng: f64,
    pub ts: DateTime<Utc>,
    pub temperature_f: f64,
    #[serde(default)]
    pub feels_like_f: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub wind_speed_mph: Option<f64>,
    #[serde(default)]
    pub rain_probability: Option<f64>,
}

impl WeatherReading {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficReading {
    pub ts: DateTime<Utc>,
    pub congestion_score: f64,
    #[serde(default)]
    pub travel_time_to_downtown: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialSentimentReading {
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub mention_count: i64,
    pub positive_sentiment: f64,
    #[serde(default)]
    pub engagement_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootTrafficReading {
    pub ts: DateTime<Utc>,
    pub visitors_count: i64,
    #[serde(default)]
    pub median_dwell_seconds: Option<f64>,
    #[serde(default)]
    pub visitors_change_24h: f64,
}

/// Census tract. `geometry` is an outer ring of points; the ring need not be closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicTract {
    pub tract_id: String,
    #[serde(default)]
    pub geometry: Option<Vec<GeoPoint>>,
    #[serde(default)]
    pub centroid: Option<GeoPoint>,
    #[serde(default)]
    pub median_income: Option<f64>,
    #[serde(default)]
    pub pct_bachelors: Option<f64>,
    #[serde(default)]
    pub pct_age_20_40: Option<f64>,
    #[serde(default)]
    pub pct_professional_occupation: Option<f64>,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
}

impl DemographicTract {
    /// Ray-casting point-in-polygon test. `false` when the tract has no usable geometry.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        let Some(ring) = self.geometry.as_deref() else {
            return false;
        };
        if ring.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = ring.len() - 1;
        for i in 0..ring.len() {
            let (a, b) = (&ring[i], &ring[j]);
            if (a.lat > point.lat) != (b.lat > point.lat) {
                let crossing = (b.lng - a.lng) * (point.lat - a.lat) / (b.lat - a.lat) + a.lng;
                if point.lng < crossing {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicIndicator {
    pub indicator: String,
    pub area: String,
    pub value: f64,
    pub ts: DateTime<Utc>,
}

/// Environmental or demographic observation. Venue-scoped readings carry a venue
/// reference `V`: a venue name when emitted by collectors, a venue id once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextReading<V = String> {
    Weather(WeatherReading),
    Traffic { venue: V, reading: TrafficReading },
    SocialSentiment { venue: V, reading: SocialSentimentReading },
    FootTraffic { venue: V, reading: FootTrafficReading },
    Demographics(DemographicTract),
    Economic(EconomicIndicator),
}

impl<V> ContextReading<V> {
    pub fn label(&self) -> &'static str {
        match self {
            ContextReading::Weather(_) => "weather",
            ContextReading::Traffic { .. } => "traffic",
            ContextReading::SocialSentiment { .. } => "social_sentiment",
            ContextReading::FootTraffic { .. } => "foot_traffic",
            ContextReading::Demographics(_) => "demographics",
            ContextReading::Economic(_) => "economic",
        }
    }

    pub fn venue(&self) -> Option<&V> {
        match self {
            ContextReading::Traffic { venue, .. }
            | ContextReading::SocialSentiment { venue, .. }
            | ContextReading::FootTraffic { venue, .. } => Some(venue),
            _ => None,
        }
    }

    /// Re-key a venue-scoped reading. Returns `None` when `f` cannot resolve the venue;
    /// readings without a venue pass through untouched.
    pub fn map_venue<W>(self, f: impl FnOnce(V) -> Option<W>) -> Option<ContextReading<W>> {
        Some(match self {
            ContextReading::Weather(r) => ContextReading::Weather(r),
            ContextReading::Traffic { venue, reading } => ContextReading::Traffic {
                venue: f(venue)?,
                reading,
            },
            ContextReading::SocialSentiment { venue, reading } => ContextReading::SocialSentiment {
                venue: f(venue)?,
                reading,
            },
            ContextReading::FootTraffic { venue, reading } => ContextReading::FootTraffic {
                venue: f(venue)?,
                reading,
            },
            ContextReading::Demographics(t) => ContextReading::Demographics(t),
            ContextReading::Economic(e) => ContextReading::Economic(e),
        })
    }
}

/// Upcoming events at a venue and the aggregates derived from them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssociatedEvents {
    pub events: Vec<CanonicalEvent>,
    pub event_frequency: usize,
    pub avg_event_attendance: Option<f64>,
}

impl AssociatedEvents {
    pub fn from_events(events: Vec<CanonicalEvent>) -> Self {
        let attendances: Vec<f64> = events.iter().filter_map(|e| e.predicted_attendance).collect();
        let avg_event_attendance = if attendances.is_empty() {
            None
        } else {
            Some(attendances.iter().sum::<f64>() / attendances.len() as f64)
        };
        Self {
            event_frequency: events.len(),
            avg_event_attendance,
            events,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Context joined against one canonical venue. Recomputed on every enrichment call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub venue_id: Uuid,
    pub computed_at: DateTime<Utc>,
    pub weather: Option<WeatherReading>,
    pub traffic: Option<TrafficReading>,
    pub social_sentiment: Option<SocialSentimentReading>,
    pub foot_traffic: Option<FootTrafficReading>,
    pub demographics: Option<DemographicTract>,
    pub events: AssociatedEvents,
}

impl ContextSnapshot {
    pub fn empty(venue_id: Uuid, computed_at: DateTime<Utc>) -> Self {
        Self {
            venue_id,
            computed_at,
            weather: None,
            traffic: None,
            social_sentiment: None,
            foot_traffic: None,
            demographics: None,
            events: AssociatedEvents::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub completeness_score: f64,
    pub issues: Vec<String>,
}

impl QualityReport {
    pub fn new(total: usize, valid: usize, issues: Vec<String>) -> Self {
        let completeness_score = if total == 0 {
            0.0
        } else {
            clamp01(valid as f64 / total as f64)
        };
        Self {
            total,
            valid,
            invalid: total.saturating_sub(valid),
            completeness_score,
            issues,
        }
    }

    pub fn merge(&mut self, other: QualityReport) {
        let mut issues = std::mem::take(&mut self.issues);
        issues.extend(other.issues);
        *self = QualityReport::new(self.total + other.total, self.valid + other.valid, issues);
    }
}

/// Typed failure of one collector invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub source_name: String,
    pub success: bool,
    pub records_collected: usize,
    pub duration_seconds: f64,
    pub quality_score: Option<f64>,
    pub error_message: Option<String>,
}

impl CollectionResult {
    pub fn succeeded(
        source_name: impl Into<String>,
        records_collected: usize,
        duration_seconds: f64,
        quality_score: Option<f64>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            success: true,
            records_collected,
            duration_seconds,
            quality_score: quality_score.map(clamp01),
            error_message: None,
        }
    }

    pub fn failed(source_name: impl Into<String>, duration_seconds: f64, error: &CollectionError) -> Self {
        Self {
            source_name: source_name.into(),
            success: false,
            records_collected: 0,
            duration_seconds,
            quality_score: None,
            error_message: Some(error.to_string()),
        }
    }
}

/// Aggregate measure of one collection run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub data_completeness: f64,
    pub avg_quality: f64,
    pub health_score: f64,
}

impl HealthMetrics {
    pub const DEFAULT_QUALITY: f64 = 0.5;

    pub fn from_results(results: &[CollectionResult]) -> Self {
        let successful: Vec<&CollectionResult> = results.iter().filter(|r| r.success).collect();
        let data_completeness = clamp01(successful.len() as f64 / results.len().max(1) as f64);
        let qualities: Vec<f64> = successful.iter().filter_map(|r| r.quality_score).collect();
        let avg_quality = if qualities.is_empty() {
            Self::DEFAULT_QUALITY
        } else {
            clamp01(qualities.iter().sum::<f64>() / qualities.len() as f64)
        };
        Self {
            data_completeness,
            avg_quality,
            health_score: clamp01((data_completeness + avg_quality) / 2.0),
        }
    }
}

/// Bounded relevance estimate. Every value lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsychographicScore {
    pub base_score: f64,
    pub contextual_score: f64,
    pub confidence_lower: Option<f64>,
    pub confidence_upper: Option<f64>,
}

impl PsychographicScore {
    pub fn new(base_score: f64, contextual_score: f64) -> Self {
        Self {
            base_score: clamp01(base_score),
            contextual_score: clamp01(contextual_score),
            confidence_lower: None,
            confidence_upper: None,
        }
    }

    pub fn with_interval(mut self, lower: f64, upper: f64) -> Self {
        let (lower, upper) = (clamp01(lower), clamp01(upper));
        self.confidence_lower = Some(lower.min(upper));
        self.confidence_upper = Some(lower.max(upper));
        self
    }
}

/// Density estimate returned by a predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub psychographic_density: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoringSummary {
    pub venues_scored: usize,
    pub events_scored: usize,
    pub predictions_missing: usize,
    pub avg_contextual_score: f64,
    pub avg_profile_completeness: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterDataStatus {
    pub run_id: Uuid,
    pub last_refresh: DateTime<Utc>,
    pub total_venues: usize,
    pub total_events: usize,
    pub data_completeness: f64,
    pub collection_results: Vec<CollectionResult>,
    pub health_score: f64,
    pub scoring: Option<ScoringSummary>,
    pub review_candidates: usize,
}

/// Outcome of an orchestrator run. `Aborted` only when the backing store is unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunReport {
    Completed(MasterDataStatus),
    Aborted { error: String, at: DateTime<Utc> },
}

impl RunReport {
    pub fn status(&self) -> Option<&MasterDataStatus> {
        match self {
            RunReport::Completed(status) => Some(status),
            RunReport::Aborted { .. } => None,
        }
    }

    pub fn health_score(&self) -> f64 {
        self.status().map(|s| s.health_score).unwrap_or(0.0)
    }
}
