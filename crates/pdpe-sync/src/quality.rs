use pdpe_core::{clamp01, CanonicalVenue, ContextReading, ContextSnapshot, QualityReport, RawEvent, RawRecord};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Presence-based validity of one collected item.
pub trait Validate {
    /// `None` when the item is usable, otherwise a one-line description of the problem.
    fn validation_issue(&self) -> Option<String>;

    fn is_valid(&self) -> bool {
        self.validation_issue().is_none()
    }
}

impl Validate for RawRecord {
    fn validation_issue(&self) -> Option<String> {
        self.name
            .trim()
            .is_empty()
            .then(|| format!("venue {}/{} is missing a name", self.provider, self.external_id))
    }
}

impl Validate for RawEvent {
    fn validation_issue(&self) -> Option<String> {
        self.name
            .trim()
            .is_empty()
            .then(|| format!("event {}/{} is missing a name", self.provider, self.external_id))
    }
}

impl Validate for ContextReading {
    fn validation_issue(&self) -> Option<String> {
        match self {
            ContextReading::Weather(w) if !w.temperature_f.is_finite() => {
                Some(format!("weather reading at {} has no temperature", w.ts))
            }
            ContextReading::Demographics(t) if t.tract_id.trim().is_empty() => {
                Some("demographics row without tract id".to_string())
            }
            ContextReading::Economic(e) if e.indicator.trim().is_empty() => {
                Some(format!("economic value for {} without indicator", e.area))
            }
            other => match other.venue() {
                Some(venue) if venue.trim().is_empty() => {
                    Some(format!("{} reading without venue name", other.label()))
                }
                _ => None,
            },
        }
    }
}

pub fn check_batch<T: Validate>(items: &[T]) -> QualityReport {
    let issues: Vec<String> = items.iter().filter_map(Validate::validation_issue).collect();
    QualityReport::new(items.len(), items.len() - issues.len(), issues)
}

pub fn log_quality_metrics(source_name: &str, report: &QualityReport) {
    info!(
        source_name,
        total = report.total,
        valid = report.valid,
        invalid = report.invalid,
        completeness = report.completeness_score,
        "quality report"
    );
    for issue in report.issues.iter().take(5) {
        warn!(source_name, issue = %issue, "quality issue");
    }
}

/// Which of the eight profile categories a canonical venue currently has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileChecklist {
    pub basic_info: bool,
    pub psychographic: bool,
    pub weather: bool,
    pub traffic: bool,
    pub social_sentiment: bool,
    pub foot_traffic: bool,
    pub demographics: bool,
    pub events: bool,
}

impl ProfileChecklist {
    pub const ITEMS: usize = 8;

    pub fn evaluate(venue: &CanonicalVenue, snapshot: &ContextSnapshot) -> Self {
        Self {
            basic_info: !venue.name.trim().is_empty() && venue.location().is_some(),
            psychographic: venue.psychographic_relevance.is_some(),
            weather: snapshot.weather.is_some(),
            traffic: snapshot.traffic.is_some(),
            social_sentiment: snapshot.social_sentiment.is_some(),
            foot_traffic: snapshot.foot_traffic.is_some(),
            demographics: snapshot.demographics.is_some(),
            events: !snapshot.events.is_empty(),
        }
    }

    fn items(&self) -> [(&'static str, bool); Self::ITEMS] {
        [
            ("basic_info", self.basic_info),
            ("psychographic", self.psychographic),
            ("weather", self.weather),
            ("traffic", self.traffic),
            ("social_sentiment", self.social_sentiment),
            ("foot_traffic", self.foot_traffic),
            ("demographics", self.demographics),
            ("events", self.events),
        ]
    }

    pub fn present(&self) -> usize {
        self.items().iter().filter(|(_, present)| *present).count()
    }

    pub fn missing(&self) -> Vec<&'static str> {
        self.items()
            .iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn completeness_score(&self) -> f64 {
        clamp01(self.present() as f64 / Self::ITEMS as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pdpe_core::{DemographicTract, PsychographicRelevance, TrafficReading};
    use uuid::Uuid;

    fn raw(name: &str) -> RawRecord {
        RawRecord {
            external_id: "x".into(),
            provider: "google_places".into(),
            name: name.into(),
            category: None,
            subcategory: None,
            lat: None,
            lng: None,
            address: None,
            psychographic_relevance: None,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn batch_completeness_counts_named_records() {
        let report = check_batch(&[raw("Uptown Theater"), raw(""), raw("Record Bar"), raw("   ")]);
        assert_eq!(report.total, 4);
        assert_eq!(report.valid, 2);
        assert_eq!(report.invalid, 2);
        assert_eq!(report.completeness_score, 0.5);
        assert_eq!(report.issues.len(), 2);

        let empty: [RawRecord; 0] = [];
        assert_eq!(check_batch(&empty).completeness_score, 0.0);
    }

    #[test]
    fn venue_readings_need_a_venue_name() {
        let reading: ContextReading = ContextReading::Traffic {
            venue: " ".into(),
            reading: TrafficReading {
                ts: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
                congestion_score: 0.4,
                travel_time_to_downtown: None,
            },
        };
        assert!(!reading.is_valid());
    }

    #[test]
    fn three_of_eight_profile_items() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let venue = CanonicalVenue {
            venue_id: Uuid::new_v4(),
            external_id: "kauffman_kauffman_center".into(),
            provider: "kauffman".into(),
            name: "Kauffman Center".into(),
            category: None,
            subcategory: None,
            lat: Some(39.0942),
            lng: Some(-94.5877),
            address: None,
            psychographic_relevance: Some(PsychographicRelevance::default()),
            sources: vec![],
            created_at: at,
            updated_at: at,
        };
        let mut snapshot = ContextSnapshot::empty(venue.venue_id, at);
        snapshot.demographics = Some(DemographicTract {
            tract_id: "29095015900".into(),
            geometry: None,
            centroid: None,
            median_income: Some(72_000.0),
            pct_bachelors: Some(41.0),
            pct_age_20_40: None,
            pct_professional_occupation: None,
            ts: None,
        });

        let checklist = ProfileChecklist::evaluate(&venue, &snapshot);
        assert_eq!(checklist.present(), 3);
        assert_eq!(checklist.completeness_score(), 0.375);
        assert_eq!(
            checklist.missing(),
            vec!["weather", "traffic", "social_sentiment", "foot_traffic", "events"]
        );
    }
}
