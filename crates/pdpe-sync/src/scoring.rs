//! Psychographic scoring: weighted base score plus contextual adjustments.

use std::fmt;
use std::str::FromStr;

use pdpe_core::{
    clamp01, CanonicalEvent, CanonicalVenue, ContextSnapshot, Prediction, PsychographicRelevance,
    PsychographicScore, SocialSentimentReading,
};
use serde::{Deserialize, Serialize};

/// Named weight set over `career_driven`, `competent` and `fun`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeightProfile {
    pub name: &'static str,
    pub career_driven: f64,
    pub competent: f64,
    pub fun: f64,
}

impl WeightProfile {
    pub const COMPREHENSIVE: WeightProfile = WeightProfile {
        name: "comprehensive",
        career_driven: 0.4,
        competent: 0.3,
        fun: 0.3,
    };

    pub const UNIFIED_COLLECTOR: WeightProfile = WeightProfile {
        name: "unified_collector",
        career_driven: 0.5,
        competent: 0.3,
        fun: 0.2,
    };

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "comprehensive" => Some(Self::COMPREHENSIVE),
            "unified_collector" | "unified" => Some(Self::UNIFIED_COLLECTOR),
            _ => None,
        }
    }

    pub fn apply(&self, relevance: &PsychographicRelevance) -> f64 {
        clamp01(
            self.career_driven * relevance.career_driven
                + self.competent * relevance.competent
                + self.fun * relevance.fun,
        )
    }
}

impl Default for WeightProfile {
    fn default() -> Self {
        Self::COMPREHENSIVE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringPath {
    /// Base score times the product of contextual multipliers.
    #[default]
    VenueCentric,
    /// Base score plus additive social and foot-traffic boosts.
    Comprehensive,
}

impl FromStr for ScoringPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "venue_centric" => Ok(ScoringPath::VenueCentric),
            "comprehensive" => Ok(ScoringPath::Comprehensive),
            other => Err(format!("unknown scoring path `{other}`")),
        }
    }
}

impl fmt::Display for ScoringPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScoringPath::VenueCentric => "venue_centric",
            ScoringPath::Comprehensive => "comprehensive",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoringConfig {
    pub weights: WeightProfile,
    pub path: ScoringPath,
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Weighted stated relevance; falls back to the predicted density, then zero.
    pub fn base_score(&self, relevance: Option<&PsychographicRelevance>, prediction: Option<&Prediction>) -> f64 {
        match (relevance, prediction) {
            (Some(r), _) => self.config.weights.apply(r),
            (None, Some(p)) => clamp01(p.psychographic_density),
            (None, None) => 0.0,
        }
    }

    pub fn contextual_multiplier(&self, snapshot: &ContextSnapshot) -> f64 {
        let mut factor = 1.0;

        if let Some(weather) = &snapshot.weather {
            let t = weather.temperature_f;
            if (65.0..=80.0).contains(&t) {
                factor *= 1.10;
            } else if !(40.0..=90.0).contains(&t) {
                factor *= 0.90;
            }
        }

        if let Some(social) = &snapshot.social_sentiment {
            if social.positive_sentiment > 0.7 {
                factor *= 1.15;
            } else if social.positive_sentiment < 0.3 {
                factor *= 0.85;
            }
        }

        factor *= 1.0 + (0.05 * snapshot.events.event_frequency as f64).min(0.20);

        if let Some(tract) = &snapshot.demographics {
            let income = tract.median_income.unwrap_or(0.0);
            let bachelors = tract.pct_bachelors.unwrap_or(0.0);
            if income > 60_000.0 && bachelors > 30.0 {
                factor *= 1.10;
            }
        }

        factor
    }

    /// Additive social and foot-traffic boost of the comprehensive path.
    pub fn comprehensive_boost(&self, snapshot: &ContextSnapshot) -> f64 {
        let social = snapshot
            .social_sentiment
            .as_ref()
            .map_or(0.0, social_boost);
        let traffic = snapshot.foot_traffic.as_ref().map_or(0.0, |f| {
            (0.1 * (f.visitors_count as f64 / 1000.0) + 0.1 * f.visitors_change_24h.max(0.0)).clamp(0.0, 0.2)
        });
        social + traffic
    }

    pub fn score(
        &self,
        venue: &CanonicalVenue,
        snapshot: &ContextSnapshot,
        prediction: Option<&Prediction>,
    ) -> PsychographicScore {
        let base = self.base_score(venue.psychographic_relevance.as_ref(), prediction);
        let contextual = match self.config.path {
            ScoringPath::VenueCentric => base * self.contextual_multiplier(snapshot),
            ScoringPath::Comprehensive => base + self.comprehensive_boost(snapshot),
        };
        let score = PsychographicScore::new(base, contextual);
        match prediction {
            Some(p) => score.with_interval(p.confidence_lower, p.confidence_upper),
            None => score,
        }
    }

    /// Event score: weighted relevance plus sentiment at the host venue and an attendance boost.
    pub fn score_event(&self, event: &CanonicalEvent, social: Option<&SocialSentimentReading>) -> PsychographicScore {
        let base = self.base_score(event.psychographic_relevance.as_ref(), None);
        let attendance = event
            .predicted_attendance
            .map_or(0.0, |a| (0.1 * a.max(0.0) / 500.0).min(0.2));
        let total = base + social.map_or(0.0, social_boost) + attendance;
        PsychographicScore::new(base, total)
    }
}

fn social_boost(social: &SocialSentimentReading) -> f64 {
    0.3 * social.positive_sentiment + 0.2 * social.engagement_score
}
