use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use pdpe_core::{clamp01, CanonicalVenue, ContextSnapshot, Prediction};
use pdpe_storage::{MasterDataStore, StoreError};
use thiserror::Error;
use uuid::Uuid;

use crate::scoring::WeightProfile;

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("no prediction available for venue {0}")]
    Missing(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Density estimate source consumed by the scoring phase.
#[async_trait]
pub trait Predictor: Send + Sync {
    fn model_version(&self) -> &str;

    async fn predict(
        &self,
        venue: &CanonicalVenue,
        snapshot: &ContextSnapshot,
    ) -> Result<Prediction, PredictionError>;

    /// Whether predictions from this source should be written back to the store.
    fn persist_outputs(&self) -> bool {
        true
    }
}

/// Density equal to the weighted stated relevance, with a fixed ±0.1 band.
#[derive(Debug, Clone)]
pub struct BaselinePredictor {
    weights: WeightProfile,
}

impl BaselinePredictor {
    pub const MODEL_VERSION: &'static str = "baseline-weighted-v1";
    const BAND: f64 = 0.1;

    pub fn new(weights: WeightProfile) -> Self {
        Self { weights }
    }
}

#[async_trait]
impl Predictor for BaselinePredictor {
    fn model_version(&self) -> &str {
        Self::MODEL_VERSION
    }

    async fn predict(
        &self,
        venue: &CanonicalVenue,
        _snapshot: &ContextSnapshot,
    ) -> Result<Prediction, PredictionError> {
        let relevance = venue
            .psychographic_relevance
            .as_ref()
            .ok_or(PredictionError::Missing(venue.venue_id))?;
        let density = self.weights.apply(relevance);
        Ok(Prediction {
            psychographic_density: density,
            confidence_lower: clamp01(density - Self::BAND),
            confidence_upper: clamp01(density + Self::BAND),
            model_version: Self::MODEL_VERSION.to_string(),
        })
    }
}

/// Reads the most recent externally produced prediction for the venue.
#[derive(Clone)]
pub struct StoredPredictor {
    store: Arc<dyn MasterDataStore>,
}

impl StoredPredictor {
    pub fn new(store: Arc<dyn MasterDataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Predictor for StoredPredictor {
    fn model_version(&self) -> &str {
        "stored"
    }

    async fn predict(
        &self,
        venue: &CanonicalVenue,
        _snapshot: &ContextSnapshot,
    ) -> Result<Prediction, PredictionError> {
        self.store
            .latest_prediction(venue.venue_id)
            .await?
            .ok_or(PredictionError::Missing(venue.venue_id))
    }

    fn persist_outputs(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictorKind {
    #[default]
    Baseline,
    Stored,
}

impl FromStr for PredictorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(PredictorKind::Baseline),
            "stored" => Ok(PredictorKind::Stored),
            other => Err(format!("unknown predictor `{other}`")),
        }
    }
}

pub fn build_predictor(
    kind: PredictorKind,
    weights: WeightProfile,
    store: Arc<dyn MasterDataStore>,
) -> Arc<dyn Predictor> {
    match kind {
        PredictorKind::Baseline => Arc::new(BaselinePredictor::new(weights)),
        PredictorKind::Stored => Arc::new(StoredPredictor::new(store)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pdpe_core::PsychographicRelevance;
    use pdpe_storage::InMemoryStore;

    fn venue(relevance: Option<PsychographicRelevance>) -> CanonicalVenue {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).single().unwrap();
        CanonicalVenue {
            venue_id: Uuid::new_v4(),
            external_id: "uptown_uptown_theater".into(),
            provider: "uptown".into(),
            name: "Uptown Theater".into(),
            category: None,
            subcategory: None,
            lat: None,
            lng: None,
            address: None,
            psychographic_relevance: relevance,
            sources: vec![],
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn baseline_band_is_clamped() {
        let predictor = BaselinePredictor::new(WeightProfile::COMPREHENSIVE);
        let v = venue(Some(PsychographicRelevance {
            career_driven: 0.05,
            competent: 0.0,
            fun: 0.0,
        }));
        let snapshot = ContextSnapshot::empty(v.venue_id, v.created_at);
        let p = predictor.predict(&v, &snapshot).await.unwrap();
        assert!((p.psychographic_density - 0.02).abs() < 1e-9);
        assert_eq!(p.confidence_lower, 0.0);
        assert!((p.confidence_upper - 0.12).abs() < 1e-9);
        assert_eq!(p.model_version, BaselinePredictor::MODEL_VERSION);

        let bare = venue(None);
        assert!(matches!(
            predictor.predict(&bare, &snapshot).await,
            Err(PredictionError::Missing(id)) if id == bare.venue_id
        ));
    }

    #[tokio::test]
    async fn stored_predictor_reads_latest_row() {
        let store = Arc::new(InMemoryStore::new());
        let v = venue(None);
        let at = v.created_at;
        for (offset, density) in [(0, 0.3), (2, 0.7)] {
            store
                .save_prediction(
                    v.venue_id,
                    &Prediction {
                        psychographic_density: density,
                        confidence_lower: density - 0.05,
                        confidence_upper: density + 0.05,
                        model_version: "stored-v3".into(),
                    },
                    at + chrono::Duration::hours(offset),
                )
                .await
                .unwrap();
        }

        let predictor = build_predictor(PredictorKind::Stored, WeightProfile::default(), store);
        assert!(!predictor.persist_outputs());
        let snapshot = ContextSnapshot::empty(v.venue_id, at);
        let p = predictor.predict(&v, &snapshot).await.unwrap();
        assert_eq!(p.psychographic_density, 0.7);

        let other = venue(None);
        assert!(predictor.predict(&other, &snapshot).await.is_err());
    }

    #[test]
    fn predictor_kind_parses() {
        assert_eq!("Stored".parse::<PredictorKind>(), Ok(PredictorKind::Stored));
        assert!("ml".parse::<PredictorKind>().is_err());
    }
}
