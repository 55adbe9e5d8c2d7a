use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pdpe_core::{
    CanonicalEvent, CanonicalVenue, CollectionResult, ContextReading, DemographicTract,
    EconomicIndicator, FootTrafficReading, GeoBounds, GeoPoint, Prediction,
    SocialSentimentReading, TrafficReading, WeatherReading,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{CollectionStatusRow, MasterDataStore, ReadingWindow, ScoreRecord, StoreError, VenueStatistics};

#[derive(Debug, Default)]
struct MemoryState {
    venues: Vec<CanonicalVenue>,
    events: Vec<CanonicalEvent>,
    weather: Vec<WeatherReading>,
    traffic: Vec<(Uuid, TrafficReading)>,
    social: Vec<(Uuid, SocialSentimentReading)>,
    foot_traffic: Vec<(Uuid, FootTrafficReading)>,
    tracts: Vec<DemographicTract>,
    economic: Vec<EconomicIndicator>,
    predictions: Vec<(Uuid, DateTime<Utc>, Prediction)>,
    scores: Vec<ScoreRecord>,
    status: BTreeMap<String, CollectionStatusRow>,
    view_refreshes: usize,
    outage: Option<String>,
}

impl MemoryState {
    fn check(&self) -> Result<(), StoreError> {
        match &self.outage {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Process-local store used when no database is configured, and by tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going away (`Some`) or coming back (`None`).
    pub async fn set_outage(&self, reason: Option<&str>) {
        self.state.lock().await.outage = reason.map(str::to_string);
    }

    pub async fn scores(&self) -> Vec<ScoreRecord> {
        self.state.lock().await.scores.clone()
    }

    pub async fn view_refreshes(&self) -> usize {
        self.state.lock().await.view_refreshes
    }

    pub async fn economic_indicators(&self) -> Vec<EconomicIndicator> {
        self.state.lock().await.economic.clone()
    }
}

fn latest_for<T: Clone>(
    rows: &[(Uuid, T)],
    venue_id: Uuid,
    window: ReadingWindow,
    ts: impl Fn(&T) -> DateTime<Utc>,
) -> Option<T> {
    rows.iter()
        .filter(|(id, r)| *id == venue_id && window.contains(ts(r)))
        .max_by_key(|(_, r)| ts(r))
        .map(|(_, r)| r.clone())
}

#[async_trait]
impl MasterDataStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.state.lock().await.check()
    }

    async fn load_venues(&self) -> Result<Vec<CanonicalVenue>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(state.venues.clone())
    }

    async fn load_events(&self) -> Result<Vec<CanonicalEvent>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(state.events.clone())
    }

    async fn upsert_venues(&self, venues: &[CanonicalVenue]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.check()?;
        for venue in venues {
            let existing = state
                .venues
                .iter_mut()
                .find(|v| v.external_id == venue.external_id && v.provider == venue.provider);
            match existing {
                Some(row) => {
                    let (venue_id, created_at) = (row.venue_id, row.created_at);
                    *row = venue.clone();
                    row.venue_id = venue_id;
                    row.created_at = created_at;
                }
                None => state.venues.push(venue.clone()),
            }
        }
        Ok(venues.len())
    }

    async fn upsert_events(&self, events: &[CanonicalEvent]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.check()?;
        for event in events {
            let existing = state
                .events
                .iter_mut()
                .find(|e| e.external_id == event.external_id && e.provider == event.provider);
            match existing {
                Some(row) => {
                    let (event_id, created_at) = (row.event_id, row.created_at);
                    *row = event.clone();
                    row.event_id = event_id;
                    row.created_at = created_at;
                }
                None => state.events.push(event.clone()),
            }
        }
        Ok(events.len())
    }

    async fn insert_context(&self, readings: &[ContextReading<Uuid>]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.check()?;
        for reading in readings {
            match reading.clone() {
                ContextReading::Weather(r) => state.weather.push(r),
                ContextReading::Traffic { venue, reading } => state.traffic.push((venue, reading)),
                ContextReading::SocialSentiment { venue, reading } => state.social.push((venue, reading)),
                ContextReading::FootTraffic { venue, reading } => state.foot_traffic.push((venue, reading)),
                ContextReading::Demographics(tract) => {
                    state.tracts.retain(|t| t.tract_id != tract.tract_id);
                    state.tracts.push(tract);
                }
                ContextReading::Economic(e) => state.economic.push(e),
            }
        }
        Ok(readings.len())
    }

    async fn weather_in(
        &self,
        bounds: GeoBounds,
        window: ReadingWindow,
    ) -> Result<Vec<WeatherReading>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(state
            .weather
            .iter()
            .filter(|w| window.contains(w.ts) && bounds.contains(&GeoPoint::new(w.lat, w.lng)))
            .cloned()
            .collect())
    }

    async fn latest_traffic(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<TrafficReading>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(latest_for(&state.traffic, venue_id, window, |r| r.ts))
    }

    async fn latest_social_sentiment(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<SocialSentimentReading>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(latest_for(&state.social, venue_id, window, |r| r.ts))
    }

    async fn latest_foot_traffic(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<FootTrafficReading>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(latest_for(&state.foot_traffic, venue_id, window, |r| r.ts))
    }

    async fn demographic_tracts(&self) -> Result<Vec<DemographicTract>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(state.tracts.clone())
    }

    async fn upcoming_events(
        &self,
        venue_id: Uuid,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CanonicalEvent>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        let mut events: Vec<CanonicalEvent> = state
            .events
            .iter()
            .filter(|e| e.venue_id == Some(venue_id))
            .filter(|e| e.start_time.map_or(true, |start| start >= now))
            .cloned()
            .collect();
        // Undated events sort after every dated one.
        events.sort_by_key(|e| (e.start_time.is_none(), e.start_time));
        events.truncate(limit);
        Ok(events)
    }

    async fn save_prediction(
        &self,
        venue_id: Uuid,
        prediction: &Prediction,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.predictions.push((venue_id, at, prediction.clone()));
        Ok(())
    }

    async fn latest_prediction(&self, venue_id: Uuid) -> Result<Option<Prediction>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(state
            .predictions
            .iter()
            .filter(|(id, _, _)| *id == venue_id)
            .max_by_key(|(_, at, _)| *at)
            .map(|(_, _, p)| p.clone()))
    }

    async fn save_scores(&self, scores: &[ScoreRecord]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.scores.extend_from_slice(scores);
        Ok(scores.len())
    }

    async fn record_collection_results(
        &self,
        results: &[CollectionResult],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check()?;
        for result in results {
            let row = CollectionStatusRow::apply(state.status.get(&result.source_name), result, at);
            state.status.insert(result.source_name.clone(), row);
        }
        Ok(())
    }

    async fn collection_status(&self) -> Result<Vec<CollectionStatusRow>, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(state.status.values().cloned().collect())
    }

    async fn venue_statistics(&self) -> Result<VenueStatistics, StoreError> {
        let state = self.state.lock().await;
        state.check()?;
        Ok(VenueStatistics {
            total_venues: state.venues.len(),
            geocoded_venues: state.venues.iter().filter(|v| v.location().is_some()).count(),
            venues_with_psychographic: state
                .venues
                .iter()
                .filter(|v| v.psychographic_relevance.is_some())
                .count(),
            total_events: state.events.len(),
        })
    }

    async fn refresh_master_views(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.view_refreshes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pdpe_core::canonical_id;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn venue(external_id: &str, name: &str, at: DateTime<Utc>) -> CanonicalVenue {
        CanonicalVenue {
            venue_id: canonical_id("venue", "uptown", external_id),
            external_id: external_id.into(),
            provider: "uptown".into(),
            name: name.into(),
            category: Some("music_venue".into()),
            subcategory: None,
            lat: Some(39.0606),
            lng: Some(-94.5847),
            address: None,
            psychographic_relevance: None,
            sources: vec![],
            created_at: at,
            updated_at: at,
        }
    }

    fn event(venue_id: Uuid, external_id: &str, start: Option<DateTime<Utc>>) -> CanonicalEvent {
        CanonicalEvent {
            event_id: canonical_id("event", "do816", external_id),
            external_id: external_id.into(),
            provider: "do816".into(),
            name: format!("Show {external_id}"),
            venue_id: Some(venue_id),
            category: None,
            subcategory: None,
            start_time: start,
            end_time: None,
            predicted_attendance: Some(300.0),
            psychographic_relevance: None,
            created_at: ts(0),
            updated_at: ts(0),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_identity_and_creation_time() {
        let store = InMemoryStore::new();
        let first = venue("uptown_theater", "Uptown Theater", ts(8));
        store.upsert_venues(&[first.clone()]).await.unwrap();

        let mut second = venue("uptown_theater", "Uptown Theater", ts(12));
        second.venue_id = Uuid::new_v4();
        second.address = Some("3700 Broadway Blvd".into());
        store.upsert_venues(&[second]).await.unwrap();

        let venues = store.load_venues().await.unwrap();
        assert_eq!(venues.len(), 1);
        assert_eq!(venues[0].venue_id, first.venue_id);
        assert_eq!(venues[0].created_at, ts(8));
        assert_eq!(venues[0].updated_at, ts(12));
        assert_eq!(venues[0].address.as_deref(), Some("3700 Broadway Blvd"));
    }

    #[tokio::test]
    async fn outage_fails_every_call_without_partial_writes() {
        let store = InMemoryStore::new();
        store.set_outage(Some("connection refused")).await;
        let err = store
            .upsert_venues(&[venue("a", "A", ts(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.ping().await.is_err());

        store.set_outage(None).await;
        assert!(store.load_venues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upcoming_events_sorted_with_undated_last() {
        let store = InMemoryStore::new();
        let v = venue("uptown_theater", "Uptown Theater", ts(0));
        let now = ts(12);
        store
            .upsert_events(&[
                event(v.venue_id, "late", Some(now + Duration::days(3))),
                event(v.venue_id, "undated", None),
                event(v.venue_id, "past", Some(now - Duration::hours(1))),
                event(v.venue_id, "soon", Some(now + Duration::hours(2))),
                event(Uuid::new_v4(), "elsewhere", Some(now + Duration::hours(1))),
            ])
            .await
            .unwrap();

        let upcoming = store.upcoming_events(v.venue_id, now, 10).await.unwrap();
        let ids: Vec<&str> = upcoming.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["soon", "late", "undated"]);

        let limited = store.upcoming_events(v.venue_id, now, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn latest_reading_respects_window() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        let reading = |hour, congestion| ContextReading::Traffic {
            venue: id,
            reading: TrafficReading {
                ts: ts(hour),
                congestion_score: congestion,
                travel_time_to_downtown: None,
            },
        };
        store
            .insert_context(&[reading(9, 0.2), reading(11, 0.6), reading(10, 0.4)])
            .await
            .unwrap();

        let window = |start, end| ReadingWindow {
            start: ts(start),
            end: ts(end),
        };
        let latest = store.latest_traffic(id, window(10, 12)).await.unwrap().unwrap();
        assert_eq!(latest.congestion_score, 0.6);
        assert!(store.latest_traffic(id, window(12, 14)).await.unwrap().is_none());

        // Readings stamped after the window end do not count as current.
        let current = store.latest_traffic(id, window(9, 10)).await.unwrap().unwrap();
        assert_eq!(current.congestion_score, 0.4);
    }

    #[tokio::test]
    async fn collection_status_keeps_last_success() {
        let store = InMemoryStore::new();
        store
            .record_collection_results(&[CollectionResult::succeeded("weather", 4, 0.3, Some(1.0))], ts(6))
            .await
            .unwrap();
        store
            .record_collection_results(
                &[CollectionResult::failed(
                    "weather",
                    0.1,
                    &pdpe_core::CollectionError::Network("reset".into()),
                )],
                ts(7),
            )
            .await
            .unwrap();

        let status = store.collection_status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(!status[0].success);
        assert_eq!(status[0].last_run_at, ts(7));
        assert_eq!(status[0].last_successful_collection, Some(ts(6)));
    }
}
