use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pdpe_core::{
    CanonicalEvent, CanonicalVenue, CollectionResult, ContextReading, DemographicTract,
    FootTrafficReading, GeoBounds, GeoPoint, Prediction, PsychographicRelevance,
    SocialSentimentReading, SourceKey, TrafficReading, WeatherReading,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{CollectionStatusRow, MasterDataStore, ReadingWindow, ScoreRecord, StoreError, VenueStatistics};

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool that opens connections on first use, so an unreachable server surfaces
    /// through [`MasterDataStore::ping`] instead of here.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

fn venue_from_row(row: &PgRow) -> Result<CanonicalVenue, sqlx::Error> {
    let relevance: Option<Json<PsychographicRelevance>> = row.try_get("psychographic_relevance")?;
    let sources: Json<Vec<SourceKey>> = row.try_get("sources")?;
    Ok(CanonicalVenue {
        venue_id: row.try_get("venue_id")?,
        external_id: row.try_get("external_id")?,
        provider: row.try_get("provider")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        subcategory: row.try_get("subcategory")?,
        lat: row.try_get("lat")?,
        lng: row.try_get("lng")?,
        address: row.try_get("address")?,
        psychographic_relevance: relevance.map(|j| j.0),
        sources: sources.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<CanonicalEvent, sqlx::Error> {
    let relevance: Option<Json<PsychographicRelevance>> = row.try_get("psychographic_relevance")?;
    Ok(CanonicalEvent {
        event_id: row.try_get("event_id")?,
        external_id: row.try_get("external_id")?,
        provider: row.try_get("provider")?,
        name: row.try_get("name")?,
        venue_id: row.try_get("venue_id")?,
        category: row.try_get("category")?,
        subcategory: row.try_get("subcategory")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        predicted_attendance: row.try_get("predicted_attendance")?,
        psychographic_relevance: relevance.map(|j| j.0),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tract_from_row(row: &PgRow) -> Result<DemographicTract, sqlx::Error> {
    let geometry: Option<Json<Vec<GeoPoint>>> = row.try_get("geometry")?;
    let centroid: Option<Json<GeoPoint>> = row.try_get("centroid")?;
    Ok(DemographicTract {
        tract_id: row.try_get("tract_id")?,
        geometry: geometry.map(|j| j.0),
        centroid: centroid.map(|j| j.0),
        median_income: row.try_get("median_income")?,
        pct_bachelors: row.try_get("pct_bachelors")?,
        pct_age_20_40: row.try_get("pct_age_20_40")?,
        pct_professional_occupation: row.try_get("pct_professional_occupation")?,
        ts: row.try_get("ts")?,
    })
}

const EVENT_COLUMNS: &str = "event_id, external_id, provider, name, venue_id, category, subcategory, \
     start_time, end_time, predicted_attendance, psychographic_relevance, created_at, updated_at";

#[async_trait]
impl MasterDataStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn load_venues(&self) -> Result<Vec<CanonicalVenue>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT venue_id, external_id, provider, name, category, subcategory, lat, lng,
                   address, psychographic_relevance, sources, created_at, updated_at
              FROM venues
             ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(venue_from_row).collect::<Result<_, _>>()?)
    }

    async fn load_events(&self) -> Result<Vec<CanonicalEvent>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY seq"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(event_from_row).collect::<Result<_, _>>()?)
    }

    async fn upsert_venues(&self, venues: &[CanonicalVenue]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for venue in venues {
            sqlx::query(
                r#"
                INSERT INTO venues (
                    venue_id, external_id, provider, name, category, subcategory, lat, lng,
                    address, psychographic_relevance, sources, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (external_id, provider) DO UPDATE
                   SET name = EXCLUDED.name,
                       category = COALESCE(EXCLUDED.category, venues.category),
                       subcategory = COALESCE(EXCLUDED.subcategory, venues.subcategory),
                       lat = COALESCE(EXCLUDED.lat, venues.lat),
                       lng = COALESCE(EXCLUDED.lng, venues.lng),
                       address = COALESCE(EXCLUDED.address, venues.address),
                       psychographic_relevance = COALESCE(EXCLUDED.psychographic_relevance, venues.psychographic_relevance),
                       sources = EXCLUDED.sources,
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(venue.venue_id)
            .bind(&venue.external_id)
            .bind(&venue.provider)
            .bind(&venue.name)
            .bind(&venue.category)
            .bind(&venue.subcategory)
            .bind(venue.lat)
            .bind(venue.lng)
            .bind(&venue.address)
            .bind(venue.psychographic_relevance.map(Json))
            .bind(Json(&venue.sources))
            .bind(venue.created_at)
            .bind(venue.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(venues.len())
    }

    async fn upsert_events(&self, events: &[CanonicalEvent]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, external_id, provider, name, venue_id, category, subcategory,
                    start_time, end_time, predicted_attendance, psychographic_relevance,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (external_id, provider) DO UPDATE
                   SET name = EXCLUDED.name,
                       venue_id = COALESCE(EXCLUDED.venue_id, events.venue_id),
                       category = COALESCE(EXCLUDED.category, events.category),
                       subcategory = COALESCE(EXCLUDED.subcategory, events.subcategory),
                       start_time = COALESCE(EXCLUDED.start_time, events.start_time),
                       end_time = COALESCE(EXCLUDED.end_time, events.end_time),
                       predicted_attendance = COALESCE(EXCLUDED.predicted_attendance, events.predicted_attendance),
                       psychographic_relevance = COALESCE(EXCLUDED.psychographic_relevance, events.psychographic_relevance),
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(event.event_id)
            .bind(&event.external_id)
            .bind(&event.provider)
            .bind(&event.name)
            .bind(event.venue_id)
            .bind(&event.category)
            .bind(&event.subcategory)
            .bind(event.start_time)
            .bind(event.end_time)
            .bind(event.predicted_attendance)
            .bind(event.psychographic_relevance.map(Json))
            .bind(event.created_at)
            .bind(event.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(events.len())
    }

    async fn insert_context(&self, readings: &[ContextReading<Uuid>]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for reading in readings {
            match reading {
                ContextReading::Weather(w) => {
                    sqlx::query(
                        r#"
                        INSERT INTO weather_data (
                            lat, lng, ts, temperature_f, feels_like_f, humidity,
                            weather_condition, wind_speed_mph, rain_probability
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#,
                    )
                    .bind(w.lat)
                    .bind(w.lng)
                    .bind(w.ts)
                    .bind(w.temperature_f)
                    .bind(w.feels_like_f)
                    .bind(w.humidity)
                    .bind(&w.condition)
                    .bind(w.wind_speed_mph)
                    .bind(w.rain_probability)
                    .execute(&mut *tx)
                    .await?;
                }
                ContextReading::Traffic { venue, reading } => {
                    sqlx::query(
                        "INSERT INTO traffic_data (venue_id, ts, congestion_score, travel_time_to_downtown) \
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(venue)
                    .bind(reading.ts)
                    .bind(reading.congestion_score)
                    .bind(reading.travel_time_to_downtown)
                    .execute(&mut *tx)
                    .await?;
                }
                ContextReading::SocialSentiment { venue, reading } => {
                    sqlx::query(
                        "INSERT INTO social_sentiment (venue_id, ts, mention_count, positive_sentiment, engagement_score) \
                         VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(venue)
                    .bind(reading.ts)
                    .bind(reading.mention_count)
                    .bind(reading.positive_sentiment)
                    .bind(reading.engagement_score)
                    .execute(&mut *tx)
                    .await?;
                }
                ContextReading::FootTraffic { venue, reading } => {
                    sqlx::query(
                        "INSERT INTO venue_traffic (venue_id, ts, visitors_count, median_dwell_seconds, visitors_change_24h) \
                         VALUES ($1, $2, $3, $4, $5)",
                    )
                    .bind(venue)
                    .bind(reading.ts)
                    .bind(reading.visitors_count)
                    .bind(reading.median_dwell_seconds)
                    .bind(reading.visitors_change_24h)
                    .execute(&mut *tx)
                    .await?;
                }
                ContextReading::Demographics(t) => {
                    sqlx::query(
                        r#"
                        INSERT INTO demographics (
                            tract_id, geometry, centroid, median_income, pct_bachelors,
                            pct_age_20_40, pct_professional_occupation, ts
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        ON CONFLICT (tract_id) DO UPDATE
                           SET geometry = COALESCE(EXCLUDED.geometry, demographics.geometry),
                               centroid = COALESCE(EXCLUDED.centroid, demographics.centroid),
                               median_income = EXCLUDED.median_income,
                               pct_bachelors = EXCLUDED.pct_bachelors,
                               pct_age_20_40 = EXCLUDED.pct_age_20_40,
                               pct_professional_occupation = EXCLUDED.pct_professional_occupation,
                               ts = EXCLUDED.ts
                        "#,
                    )
                    .bind(&t.tract_id)
                    .bind(t.geometry.as_ref().map(Json))
                    .bind(t.centroid.map(Json))
                    .bind(t.median_income)
                    .bind(t.pct_bachelors)
                    .bind(t.pct_age_20_40)
                    .bind(t.pct_professional_occupation)
                    .bind(t.ts)
                    .execute(&mut *tx)
                    .await?;
                }
                ContextReading::Economic(e) => {
                    sqlx::query("INSERT INTO economic_data (indicator, area, value, ts) VALUES ($1, $2, $3, $4)")
                        .bind(&e.indicator)
                        .bind(&e.area)
                        .bind(e.value)
                        .bind(e.ts)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(readings.len())
    }

    async fn weather_in(
        &self,
        bounds: GeoBounds,
        window: ReadingWindow,
    ) -> Result<Vec<WeatherReading>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT lat, lng, ts, temperature_f, feels_like_f, humidity, weather_condition,
                   wind_speed_mph, rain_probability
              FROM weather_data
             WHERE ts BETWEEN $1 AND $2
               AND lat BETWEEN $3 AND $4
               AND lng BETWEEN $5 AND $6
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .bind(bounds.south)
        .bind(bounds.north)
        .bind(bounds.west)
        .bind(bounds.east)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(WeatherReading {
                lat: row.try_get("lat")?,
                lng: row.try_get("lng")?,
                ts: row.try_get("ts")?,
                temperature_f: row.try_get("temperature_f")?,
                feels_like_f: row.try_get("feels_like_f")?,
                humidity: row.try_get("humidity")?,
                condition: row.try_get("weather_condition")?,
                wind_speed_mph: row.try_get("wind_speed_mph")?,
                rain_probability: row.try_get("rain_probability")?,
            });
        }
        Ok(out)
    }

    async fn latest_traffic(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<TrafficReading>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT ts, congestion_score, travel_time_to_downtown
              FROM traffic_data
             WHERE venue_id = $1 AND ts BETWEEN $2 AND $3
             ORDER BY ts DESC
             LIMIT 1
            "#,
        )
        .bind(venue_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(TrafficReading {
            ts: row.try_get("ts")?,
            congestion_score: row.try_get("congestion_score")?,
            travel_time_to_downtown: row.try_get("travel_time_to_downtown")?,
        }))
    }

    async fn latest_social_sentiment(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<SocialSentimentReading>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT ts, mention_count, positive_sentiment, engagement_score
              FROM social_sentiment
             WHERE venue_id = $1 AND ts BETWEEN $2 AND $3
             ORDER BY ts DESC
             LIMIT 1
            "#,
        )
        .bind(venue_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SocialSentimentReading {
            ts: row.try_get("ts")?,
            mention_count: row.try_get("mention_count")?,
            positive_sentiment: row.try_get("positive_sentiment")?,
            engagement_score: row.try_get("engagement_score")?,
        }))
    }

    async fn latest_foot_traffic(
        &self,
        venue_id: Uuid,
        window: ReadingWindow,
    ) -> Result<Option<FootTrafficReading>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT ts, visitors_count, median_dwell_seconds, visitors_change_24h
              FROM venue_traffic
             WHERE venue_id = $1 AND ts BETWEEN $2 AND $3
             ORDER BY ts DESC
             LIMIT 1
            "#,
        )
        .bind(venue_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(FootTrafficReading {
            ts: row.try_get("ts")?,
            visitors_count: row.try_get("visitors_count")?,
            median_dwell_seconds: row.try_get("median_dwell_seconds")?,
            visitors_change_24h: row.try_get("visitors_change_24h")?,
        }))
    }

    async fn demographic_tracts(&self) -> Result<Vec<DemographicTract>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tract_id, geometry, centroid, median_income, pct_bachelors, pct_age_20_40,
                   pct_professional_occupation, ts
              FROM demographics
             ORDER BY tract_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(tract_from_row).collect::<Result<_, _>>()?)
    }

    async fn upcoming_events(
        &self,
        venue_id: Uuid,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CanonicalEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE venue_id = $1 AND (start_time IS NULL OR start_time >= $2) \
             ORDER BY start_time ASC NULLS LAST \
             LIMIT $3"
        ))
        .bind(venue_id)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(event_from_row).collect::<Result<_, _>>()?)
    }

    async fn save_prediction(
        &self,
        venue_id: Uuid,
        prediction: &Prediction,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO predictions (
                venue_id, ts, psychographic_density, confidence_lower, confidence_upper, model_version
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(venue_id)
        .bind(at)
        .bind(prediction.psychographic_density)
        .bind(prediction.confidence_lower)
        .bind(prediction.confidence_upper)
        .bind(&prediction.model_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_prediction(&self, venue_id: Uuid) -> Result<Option<Prediction>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT psychographic_density, confidence_lower, confidence_upper, model_version
              FROM predictions
             WHERE venue_id = $1
             ORDER BY ts DESC
             LIMIT 1
            "#,
        )
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Prediction {
            psychographic_density: row.try_get("psychographic_density")?,
            confidence_lower: row.try_get("confidence_lower")?,
            confidence_upper: row.try_get("confidence_upper")?,
            model_version: row.try_get("model_version")?,
        }))
    }

    async fn save_scores(&self, scores: &[ScoreRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in scores {
            sqlx::query(
                r#"
                INSERT INTO psychographic_scores (
                    entity_kind, entity_id, base_score, contextual_score, confidence_lower,
                    confidence_upper, profile_completeness, model_version, scored_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(record.entity_kind.as_str())
            .bind(record.entity_id)
            .bind(record.score.base_score)
            .bind(record.score.contextual_score)
            .bind(record.score.confidence_lower)
            .bind(record.score.confidence_upper)
            .bind(record.profile_completeness)
            .bind(&record.model_version)
            .bind(record.scored_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(scores.len())
    }

    async fn record_collection_results(
        &self,
        results: &[CollectionResult],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for result in results {
            sqlx::query(
                r#"
                INSERT INTO collection_status (
                    source_name, last_run_at, last_successful_collection, collection_health_score,
                    success, records_collected, error_message
                )
                VALUES ($1, $2, CASE WHEN $5 THEN $2 END, $3, $5, $4, $6)
                ON CONFLICT (source_name) DO UPDATE
                   SET last_run_at = EXCLUDED.last_run_at,
                       last_successful_collection = COALESCE(
                           EXCLUDED.last_successful_collection,
                           collection_status.last_successful_collection
                       ),
                       collection_health_score = EXCLUDED.collection_health_score,
                       success = EXCLUDED.success,
                       records_collected = EXCLUDED.records_collected,
                       error_message = EXCLUDED.error_message
                "#,
            )
            .bind(&result.source_name)
            .bind(at)
            .bind(result.quality_score)
            .bind(i64::try_from(result.records_collected).unwrap_or(i64::MAX))
            .bind(result.success)
            .bind(&result.error_message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn collection_status(&self) -> Result<Vec<CollectionStatusRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_name, last_run_at, last_successful_collection, collection_health_score,
                   success, records_collected, error_message
              FROM collection_status
             ORDER BY source_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let records: i64 = row.try_get("records_collected")?;
            out.push(CollectionStatusRow {
                source_name: row.try_get("source_name")?,
                last_run_at: row.try_get("last_run_at")?,
                last_successful_collection: row.try_get("last_successful_collection")?,
                collection_health_score: row.try_get("collection_health_score")?,
                success: row.try_get("success")?,
                records_collected: count(records),
                error_message: row.try_get("error_message")?,
            });
        }
        Ok(out)
    }

    async fn venue_statistics(&self) -> Result<VenueStatistics, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_venues,
                   COUNT(*) FILTER (WHERE lat IS NOT NULL AND lng IS NOT NULL) AS geocoded_venues,
                   COUNT(*) FILTER (WHERE psychographic_relevance IS NOT NULL) AS venues_with_psychographic,
                   (SELECT COUNT(*) FROM events) AS total_events
              FROM venues
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(VenueStatistics {
            total_venues: count(row.try_get("total_venues")?),
            geocoded_venues: count(row.try_get("geocoded_venues")?),
            venues_with_psychographic: count(row.try_get("venues_with_psychographic")?),
            total_events: count(row.try_get("total_events")?),
        })
    }

    async fn refresh_master_views(&self) -> Result<(), StoreError> {
        sqlx::query("REFRESH MATERIALIZED VIEW master_venue_data")
            .execute(&self.pool)
            .await?;
        sqlx::query("REFRESH MATERIALIZED VIEW master_events_data")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
