//! Contextual enrichment: joins a canonical venue against the time- and
//! radius-bounded context tables of the store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pdpe_core::{
    AssociatedEvents, CanonicalVenue, ContextSnapshot, DemographicTract, GeoBounds, GeoPoint,
    WeatherReading,
};
use pdpe_storage::{MasterDataStore, ReadingWindow, StoreError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentConfig {
    pub weather_radius_m: f64,
    pub weather_window: Duration,
    pub traffic_window: Duration,
    pub social_window: Duration,
    pub foot_traffic_window: Duration,
    pub event_limit: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            weather_radius_m: 5_000.0,
            weather_window: Duration::hours(6),
            traffic_window: Duration::hours(2),
            social_window: Duration::hours(24),
            foot_traffic_window: Duration::hours(24),
            event_limit: 10,
        }
    }
}

#[derive(Clone)]
pub struct EnrichmentService {
    store: Arc<dyn MasterDataStore>,
    config: EnrichmentConfig,
}

impl EnrichmentService {
    pub fn new(store: Arc<dyn MasterDataStore>, config: EnrichmentConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    pub async fn enrich(&self, venue: &CanonicalVenue) -> Result<ContextSnapshot, StoreError> {
        self.enrich_at(venue, Utc::now()).await
    }

    /// Build a fresh snapshot as of `now`. A signal with no match inside its window
    /// stays `None`; only store failures are errors.
    pub async fn enrich_at(
        &self,
        venue: &CanonicalVenue,
        now: DateTime<Utc>,
    ) -> Result<ContextSnapshot, StoreError> {
        let mut snapshot = ContextSnapshot::empty(venue.venue_id, now);
        let cfg = &self.config;

        if let Some(location) = venue.location() {
            let candidates = self
                .store
                .weather_in(
                    GeoBounds::around(&location, cfg.weather_radius_m),
                    ReadingWindow::ending_at(now, cfg.weather_window),
                )
                .await?;
            snapshot.weather = nearest_weather(&location, candidates, cfg.weather_radius_m, now);

            let tracts = self.store.demographic_tracts().await?;
            snapshot.demographics = locate_tract(&location, &tracts).cloned();
        }

        snapshot.traffic = self
            .store
            .latest_traffic(venue.venue_id, ReadingWindow::ending_at(now, cfg.traffic_window))
            .await?;
        snapshot.social_sentiment = self
            .store
            .latest_social_sentiment(venue.venue_id, ReadingWindow::ending_at(now, cfg.social_window))
            .await?;
        snapshot.foot_traffic = self
            .store
            .latest_foot_traffic(venue.venue_id, ReadingWindow::ending_at(now, cfg.foot_traffic_window))
            .await?;

        let events = self
            .store
            .upcoming_events(venue.venue_id, now, cfg.event_limit)
            .await?;
        snapshot.events = AssociatedEvents::from_events(events);

        debug!(
            venue_id = %venue.venue_id,
            weather = snapshot.weather.is_some(),
            traffic = snapshot.traffic.is_some(),
            social = snapshot.social_sentiment.is_some(),
            foot_traffic = snapshot.foot_traffic.is_some(),
            demographics = snapshot.demographics.is_some(),
            events = snapshot.events.event_frequency,
            "venue enriched"
        );
        Ok(snapshot)
    }
}

/// Closest reading within `radius_m` that is not from the future; ties go to the newest.
pub fn nearest_weather(
    location: &GeoPoint,
    readings: Vec<WeatherReading>,
    radius_m: f64,
    now: DateTime<Utc>,
) -> Option<WeatherReading> {
    readings
        .into_iter()
        .filter(|r| r.ts <= now)
        .map(|r| (location.haversine_m(&r.location()), r))
        .filter(|(distance, _)| *distance <= radius_m)
        .min_by(|(da, a), (db, b)| da.total_cmp(db).then_with(|| b.ts.cmp(&a.ts)))
        .map(|(_, r)| r)
}

/// Tract whose polygon contains `location`; otherwise the tract with the nearest centroid.
pub fn locate_tract<'a>(location: &GeoPoint, tracts: &'a [DemographicTract]) -> Option<&'a DemographicTract> {
    if let Some(tract) = tracts.iter().find(|t| t.contains(location)) {
        return Some(tract);
    }
    tracts
        .iter()
        .filter_map(|t| t.centroid.map(|c| (c.planar_distance_sq(location), t)))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, t)| t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pdpe_core::{
        CanonicalEvent, ContextReading, FootTrafficReading, SocialSentimentReading, TrafficReading,
    };
    use pdpe_storage::InMemoryStore;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).single().unwrap()
    }

    fn venue(lat: Option<f64>, lng: Option<f64>) -> CanonicalVenue {
        CanonicalVenue {
            venue_id: Uuid::new_v4(),
            external_id: "tmobile_center_t-mobile_center".into(),
            provider: "tmobile_center".into(),
            name: "T-Mobile Center".into(),
            category: None,
            subcategory: None,
            lat,
            lng,
            address: None,
            psychographic_relevance: None,
            sources: vec![],
            created_at: now(),
            updated_at: now(),
        }
    }

    fn weather(lat: f64, lng: f64, hours_ago: i64, temperature_f: f64) -> WeatherReading {
        WeatherReading {
            lat,
            lng,
            ts: now() - Duration::hours(hours_ago),
            temperature_f,
            feels_like_f: None,
            humidity: None,
            condition: None,
            wind_speed_mph: None,
            rain_probability: None,
        }
    }

    fn tract(id: &str, geometry: Option<Vec<GeoPoint>>, centroid: Option<GeoPoint>) -> DemographicTract {
        DemographicTract {
            tract_id: id.into(),
            geometry,
            centroid,
            median_income: None,
            pct_bachelors: None,
            pct_age_20_40: None,
            pct_professional_occupation: None,
            ts: None,
        }
    }

    fn event(venue_id: Uuid, start_days: Option<i64>, attendance: Option<f64>) -> CanonicalEvent {
        let id = Uuid::new_v4();
        CanonicalEvent {
            event_id: id,
            external_id: id.to_string(),
            provider: "do816".into(),
            name: "Show".into(),
            venue_id: Some(venue_id),
            category: None,
            subcategory: None,
            start_time: start_days.map(|d| now() + Duration::days(d)),
            end_time: None,
            predicted_attendance: attendance,
            psychographic_relevance: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn nearest_weather_respects_radius_and_prefers_fresh_ties() {
        let here = GeoPoint::new(39.0977, -94.58);
        let older = weather(39.0997, -94.5786, 4, 60.0);
        let newer = weather(39.0997, -94.5786, 1, 72.0);
        let far = weather(39.30, -94.58, 0, 10.0);
        let picked = nearest_weather(&here, vec![older, far.clone(), newer], 5_000.0, now()).unwrap();
        assert_eq!(picked.temperature_f, 72.0);
        assert!(nearest_weather(&here, vec![far], 5_000.0, now()).is_none());
    }

    #[test]
    fn tract_lookup_prefers_polygon_then_centroid() {
        let here = GeoPoint::new(39.0977, -94.58);
        let ring = vec![
            GeoPoint::new(39.085, -94.60),
            GeoPoint::new(39.085, -94.57),
            GeoPoint::new(39.11, -94.57),
            GeoPoint::new(39.11, -94.60),
        ];
        let tracts = vec![
            tract("near-centroid", None, Some(GeoPoint::new(39.0978, -94.5801))),
            tract("polygon", Some(ring), None),
        ];
        assert_eq!(locate_tract(&here, &tracts).unwrap().tract_id, "polygon");

        let outside = GeoPoint::new(39.06, -94.585);
        assert_eq!(locate_tract(&outside, &tracts).unwrap().tract_id, "near-centroid");
        assert!(locate_tract(&outside, &[]).is_none());
    }

    #[tokio::test]
    async fn enrichment_applies_windows_per_signal() {
        let store = Arc::new(InMemoryStore::new());
        let v = venue(Some(39.0977), Some(-94.58));
        store.upsert_venues(std::slice::from_ref(&v)).await.unwrap();

        let readings: Vec<ContextReading<Uuid>> = vec![
            ContextReading::Weather(weather(39.0997, -94.5786, 2, 72.0)),
            ContextReading::Weather(weather(39.0997, -94.5786, 9, 35.0)),
            ContextReading::Traffic {
                venue: v.venue_id,
                reading: TrafficReading {
                    ts: now() - Duration::hours(3),
                    congestion_score: 0.9,
                    travel_time_to_downtown: None,
                },
            },
            ContextReading::SocialSentiment {
                venue: v.venue_id,
                reading: SocialSentimentReading {
                    ts: now() - Duration::hours(6),
                    mention_count: 40,
                    positive_sentiment: 0.75,
                    engagement_score: 0.6,
                },
            },
            ContextReading::FootTraffic {
                venue: v.venue_id,
                reading: FootTrafficReading {
                    ts: now() - Duration::hours(30),
                    visitors_count: 1800,
                    median_dwell_seconds: None,
                    visitors_change_24h: 0.12,
                },
            },
        ];
        store.insert_context(&readings).await.unwrap();
        store
            .upsert_events(&[
                event(v.venue_id, Some(2), Some(800.0)),
                event(v.venue_id, Some(-3), Some(5000.0)),
                event(v.venue_id, None, None),
            ])
            .await
            .unwrap();

        let service = EnrichmentService::new(store.clone(), EnrichmentConfig::default());
        let snapshot = service.enrich_at(&v, now()).await.unwrap();

        assert_eq!(snapshot.weather.as_ref().map(|w| w.temperature_f), Some(72.0));
        assert!(snapshot.traffic.is_none(), "traffic older than 2h must be ignored");
        assert_eq!(snapshot.social_sentiment.as_ref().map(|s| s.positive_sentiment), Some(0.75));
        assert!(snapshot.foot_traffic.is_none());
        assert_eq!(snapshot.events.event_frequency, 2);
        assert_eq!(snapshot.events.avg_event_attendance, Some(800.0));
    }

    #[tokio::test]
    async fn readings_stamped_after_now_are_not_current() {
        let store = Arc::new(InMemoryStore::new());
        let v = venue(Some(39.0977), Some(-94.58));
        let traffic = |hours: i64, congestion_score| ContextReading::Traffic {
            venue: v.venue_id,
            reading: TrafficReading {
                ts: now() + Duration::hours(hours),
                congestion_score,
                travel_time_to_downtown: None,
            },
        };
        let social = |hours: i64, positive_sentiment| ContextReading::SocialSentiment {
            venue: v.venue_id,
            reading: SocialSentimentReading {
                ts: now() + Duration::hours(hours),
                mention_count: 10,
                positive_sentiment,
                engagement_score: 0.5,
            },
        };
        store
            .insert_context(&[
                traffic(-1, 0.3),
                traffic(1, 0.9),
                social(3, 0.95),
                ContextReading::Weather(weather(39.0997, -94.5786, -2, 95.0)),
            ])
            .await
            .unwrap();

        let service = EnrichmentService::new(store, EnrichmentConfig::default());
        let snapshot = service.enrich_at(&v, now()).await.unwrap();
        assert_eq!(snapshot.traffic.as_ref().map(|t| t.congestion_score), Some(0.3));
        assert!(snapshot.social_sentiment.is_none());
        assert!(snapshot.weather.is_none());
    }

    #[tokio::test]
    async fn unlocated_venue_skips_geographic_signals() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_context(&[ContextReading::Weather(weather(39.0997, -94.5786, 1, 70.0))])
            .await
            .unwrap();
        let service = EnrichmentService::new(store, EnrichmentConfig::default());
        let snapshot = service.enrich_at(&venue(None, None), now()).await.unwrap();
        assert!(snapshot.weather.is_none());
        assert!(snapshot.demographics.is_none());
        assert!(snapshot.events.is_empty());
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_error() {
        let store = Arc::new(InMemoryStore::new());
        store.set_outage(Some("connection refused")).await;
        let service = EnrichmentService::new(store, EnrichmentConfig::default());
        let err = service.enrich_at(&venue(Some(39.0977), Some(-94.58)), now()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
