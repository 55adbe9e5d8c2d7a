//! Identity resolution: folds raw venue and event records into canonical entities.
//!
//! Matching runs against canonical venues in creation order and the first hit wins.
//! The resolver owns its state exclusively (`&mut self`), so one run resolves
//! records strictly one after another.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use pdpe_core::{canonical_id, CanonicalEvent, CanonicalVenue, GeoPoint, RawEvent, RawRecord, SourceKey};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATIC_VENUE_PROVIDERS: [&str; 6] = ["tmobile", "uptown", "kauffman", "starlight", "midland", "knuckleheads"];
const AGGREGATOR_PROVIDERS: [&str; 4] = ["visitkc", "do816", "thepitchkc", "aura"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCategory {
    ApiPlaces,
    ApiEvents,
    ScrapedStatic,
    ScrapedDynamic,
    ScrapedLocal,
    Unknown,
}

impl ProviderCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCategory::ApiPlaces => "api_places",
            ProviderCategory::ApiEvents => "api_events",
            ProviderCategory::ScrapedStatic => "scraped_static",
            ProviderCategory::ScrapedDynamic => "scraped_dynamic",
            ProviderCategory::ScrapedLocal => "scraped_local",
            ProviderCategory::Unknown => "unknown",
        }
    }
}

pub fn categorize_provider(provider: &str) -> ProviderCategory {
    let provider = provider.to_lowercase();
    if provider.is_empty() {
        ProviderCategory::Unknown
    } else if provider.contains("google") || provider.contains("places") {
        ProviderCategory::ApiPlaces
    } else if STATIC_VENUE_PROVIDERS.iter().any(|p| provider.contains(p)) {
        ProviderCategory::ScrapedStatic
    } else if AGGREGATOR_PROVIDERS.iter().any(|p| provider.contains(p)) {
        ProviderCategory::ScrapedDynamic
    } else {
        ProviderCategory::ScrapedLocal
    }
}

pub fn categorize_event_provider(provider: &str) -> ProviderCategory {
    let provider = provider.to_lowercase();
    if provider.is_empty() {
        ProviderCategory::Unknown
    } else if provider.contains("predicthq") {
        ProviderCategory::ApiEvents
    } else if AGGREGATOR_PROVIDERS.iter().any(|p| provider.contains(p)) {
        ProviderCategory::ScrapedDynamic
    } else {
        ProviderCategory::ScrapedLocal
    }
}

/// `"Uptown Theater"` -> `"uptown_theater"`.
pub fn slug(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Lowercase, punctuation folded to spaces, whitespace collapsed.
pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Case-insensitive exact name, then substring containment either way.
    Substring,
    /// Normalized-name equality, additionally within a distance threshold when both sides are located.
    NormalizedProximity,
}

impl FromStr for MatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "substring" => Ok(MatchStrategy::Substring),
            "normalized_proximity" | "proximity" => Ok(MatchStrategy::NormalizedProximity),
            other => Err(format!("unknown match strategy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolverConfig {
    pub strategy: MatchStrategy,
    pub proximity_threshold_m: f64,
    pub review_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: MatchStrategy::Substring,
            proximity_threshold_m: 200.0,
            review_threshold: 0.88,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("record {external_id} from {provider} has an empty name")]
    EmptyName { provider: String, external_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    SourceKey,
    ExactName,
    Substring,
    NormalizedProximity,
    Created,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub venue_id: Uuid,
    pub kind: MatchKind,
}

/// A newly created venue that looks like an existing one. Never merged automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCandidate {
    pub venue_id: Uuid,
    pub venue_name: String,
    pub similar_venue_id: Uuid,
    pub similar_venue_name: String,
    pub confidence: f64,
}

#[derive(Debug, Default)]
pub struct IdentityResolver {
    config: ResolverConfig,
    venues: Vec<CanonicalVenue>,
    events: Vec<CanonicalEvent>,
    venue_by_source: HashMap<SourceKey, usize>,
    event_by_source: HashMap<SourceKey, usize>,
    dirty_venues: BTreeSet<usize>,
    dirty_events: BTreeSet<usize>,
    review_queue: Vec<ReviewCandidate>,
}

impl IdentityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Seed the resolver with canonical entities already persisted, in creation order.
    pub fn with_existing(config: ResolverConfig, venues: Vec<CanonicalVenue>, events: Vec<CanonicalEvent>) -> Self {
        let mut resolver = Self::new(config);
        for (idx, venue) in venues.iter().enumerate() {
            resolver
                .venue_by_source
                .insert(SourceKey::new(venue.external_id.clone(), venue.provider.clone()), idx);
            for key in &venue.sources {
                resolver.venue_by_source.insert(key.clone(), idx);
            }
        }
        for (idx, event) in events.iter().enumerate() {
            resolver
                .event_by_source
                .insert(SourceKey::new(event.external_id.clone(), event.provider.clone()), idx);
        }
        resolver.venues = venues;
        resolver.events = events;
        resolver
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn venues(&self) -> &[CanonicalVenue] {
        &self.venues
    }

    pub fn events(&self) -> &[CanonicalEvent] {
        &self.events
    }

    pub fn venue(&self, venue_id: Uuid) -> Option<&CanonicalVenue> {
        self.venues.iter().find(|v| v.venue_id == venue_id)
    }

    pub fn review_queue(&self) -> &[ReviewCandidate] {
        &self.review_queue
    }

    /// Venues created or merged since the last [`IdentityResolver::mark_flushed`].
    pub fn pending_venues(&self) -> Vec<CanonicalVenue> {
        self.dirty_venues.iter().map(|&i| self.venues[i].clone()).collect()
    }

    pub fn pending_events(&self) -> Vec<CanonicalEvent> {
        self.dirty_events.iter().map(|&i| self.events[i].clone()).collect()
    }

    pub fn mark_flushed(&mut self) {
        self.dirty_venues.clear();
        self.dirty_events.clear();
    }

    /// Look a venue up by name without creating one.
    pub fn find(&self, name: &str) -> Option<Uuid> {
        if name.trim().is_empty() {
            return None;
        }
        self.match_by_name(name, None).map(|(idx, _)| self.venues[idx].venue_id)
    }

    pub fn resolve(&mut self, raw: &RawRecord) -> Result<Resolution, ResolveError> {
        if raw.name.trim().is_empty() {
            return Err(ResolveError::EmptyName {
                provider: raw.provider.clone(),
                external_id: raw.external_id.clone(),
            });
        }

        let key = raw.source_key();
        let matched = match self.venue_by_source.get(&key) {
            Some(&idx) => Some((idx, MatchKind::SourceKey)),
            None => self.match_by_name(&raw.name, raw.location()),
        };

        match matched {
            Some((idx, kind)) => {
                merge_venue(&mut self.venues[idx], raw);
                self.venue_by_source.insert(key, idx);
                self.dirty_venues.insert(idx);
                debug!(venue_id = %self.venues[idx].venue_id, ?kind, provider = %raw.provider, "merged raw record");
                Ok(Resolution {
                    venue_id: self.venues[idx].venue_id,
                    kind,
                })
            }
            None => {
                let venue_id = self.create_venue(raw, key);
                Ok(Resolution {
                    venue_id,
                    kind: MatchKind::Created,
                })
            }
        }
    }

    /// Resolve an event and the venue it is held at. Returns the canonical `event_id`.
    pub fn resolve_event(&mut self, raw: &RawEvent) -> Result<Uuid, ResolveError> {
        if raw.name.trim().is_empty() {
            return Err(ResolveError::EmptyName {
                provider: raw.provider.clone(),
                external_id: raw.external_id.clone(),
            });
        }

        let venue_id = if raw.venue_name.trim().is_empty() {
            None
        } else {
            let host = RawRecord {
                external_id: format!("{}_{}", raw.provider, slug(&raw.venue_name)),
                provider: raw.provider.clone(),
                name: raw.venue_name.clone(),
                category: None,
                subcategory: None,
                lat: None,
                lng: None,
                address: None,
                psychographic_relevance: None,
                timestamp: raw.timestamp,
            };
            Some(self.resolve(&host)?.venue_id)
        };

        let key = raw.source_key();
        let idx = match self.event_by_source.get(&key) {
            Some(&idx) => {
                merge_event(&mut self.events[idx], raw, venue_id);
                idx
            }
            None => {
                self.events.push(CanonicalEvent {
                    event_id: canonical_id("event", &raw.provider, &raw.external_id),
                    external_id: raw.external_id.clone(),
                    provider: raw.provider.clone(),
                    name: raw.name.clone(),
                    venue_id,
                    category: raw.category.clone(),
                    subcategory: raw.subcategory.clone(),
                    start_time: raw.start_time,
                    end_time: raw.end_time,
                    predicted_attendance: raw.predicted_attendance,
                    psychographic_relevance: raw.psychographic_relevance,
                    created_at: raw.timestamp,
                    updated_at: raw.timestamp,
                });
                let idx = self.events.len() - 1;
                self.event_by_source.insert(key, idx);
                idx
            }
        };
        self.dirty_events.insert(idx);
        Ok(self.events[idx].event_id)
    }

    fn match_by_name(&self, name: &str, location: Option<GeoPoint>) -> Option<(usize, MatchKind)> {
        match self.config.strategy {
            MatchStrategy::Substring => {
                let needle = name.trim().to_lowercase();
                if let Some(idx) = self.venues.iter().position(|v| v.name.to_lowercase() == needle) {
                    return Some((idx, MatchKind::ExactName));
                }
                self.venues
                    .iter()
                    .position(|v| {
                        let existing = v.name.to_lowercase();
                        existing.contains(&needle) || needle.contains(&existing)
                    })
                    .map(|idx| (idx, MatchKind::Substring))
            }
            MatchStrategy::NormalizedProximity => {
                let needle = normalize_name(name);
                self.venues
                    .iter()
                    .position(|v| {
                        normalize_name(&v.name) == needle
                            && match (location, v.location()) {
                                (Some(a), Some(b)) => a.haversine_m(&b) < self.config.proximity_threshold_m,
                                _ => true,
                            }
                    })
                    .map(|idx| (idx, MatchKind::NormalizedProximity))
            }
        }
    }

    /// `{provider}_{slug}`, suffixed `_2`, `_3`, ... while another canonical venue of the
    /// same provider already holds the id.
    fn unused_external_id(&self, provider: &str, name: &str) -> String {
        let base = format!("{provider}_{}", slug(name));
        let taken = |candidate: &str| {
            self.venues
                .iter()
                .any(|v| v.provider == provider && v.external_id == candidate)
        };
        let mut external_id = base.clone();
        let mut n = 1;
        while taken(&external_id) {
            n += 1;
            external_id = format!("{base}_{n}");
        }
        external_id
    }

    fn create_venue(&mut self, raw: &RawRecord, key: SourceKey) -> Uuid {
        let external_id = self.unused_external_id(&raw.provider, &raw.name);
        let venue = CanonicalVenue {
            venue_id: canonical_id("venue", &raw.provider, &external_id),
            external_id,
            provider: raw.provider.clone(),
            name: raw.name.trim().to_string(),
            category: raw.category.clone(),
            subcategory: raw.subcategory.clone(),
            lat: raw.lat,
            lng: raw.lng,
            address: raw.address.clone(),
            psychographic_relevance: raw.psychographic_relevance,
            sources: vec![key.clone()],
            created_at: raw.timestamp,
            updated_at: raw.timestamp,
        };

        if let Some(candidate) = self.similar_to(&venue) {
            warn!(
                venue = %candidate.venue_name,
                similar = %candidate.similar_venue_name,
                confidence = candidate.confidence,
                "possible duplicate venue queued for review"
            );
            self.review_queue.push(candidate);
        }

        info!(venue_id = %venue.venue_id, name = %venue.name, provider = %venue.provider, "created canonical venue");
        let venue_id = venue.venue_id;
        self.venues.push(venue);
        let idx = self.venues.len() - 1;
        self.venue_by_source.insert(key, idx);
        self.dirty_venues.insert(idx);
        venue_id
    }

    fn similar_to(&self, venue: &CanonicalVenue) -> Option<ReviewCandidate> {
        let name = normalize_name(&venue.name);
        self.venues
            .iter()
            .map(|other| (other, jaro_winkler(&name, &normalize_name(&other.name))))
            .filter(|(_, score)| *score >= self.config.review_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(other, confidence)| ReviewCandidate {
                venue_id: venue.venue_id,
                venue_name: venue.name.clone(),
                similar_venue_id: other.venue_id,
                similar_venue_name: other.name.clone(),
                confidence,
            })
    }
}

fn overwrite<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        slot.clone_from(incoming);
    }
}

/// Category sticks to the first classification unless a later record is more specific.
fn merge_category(
    category: &mut Option<String>,
    subcategory: &mut Option<String>,
    incoming_category: &Option<String>,
    incoming_subcategory: &Option<String>,
) {
    if incoming_subcategory.is_some() {
        overwrite(category, incoming_category);
        subcategory.clone_from(incoming_subcategory);
    } else if category.is_none() {
        category.clone_from(incoming_category);
    }
}

fn merge_venue(venue: &mut CanonicalVenue, raw: &RawRecord) {
    merge_category(&mut venue.category, &mut venue.subcategory, &raw.category, &raw.subcategory);
    overwrite(&mut venue.lat, &raw.lat);
    overwrite(&mut venue.lng, &raw.lng);
    overwrite(&mut venue.address, &raw.address);
    overwrite(&mut venue.psychographic_relevance, &raw.psychographic_relevance);
    let key = raw.source_key();
    if !venue.sources.contains(&key) {
        venue.sources.push(key);
    }
    venue.updated_at = raw.timestamp;
}

fn merge_event(event: &mut CanonicalEvent, raw: &RawEvent, venue_id: Option<Uuid>) {
    if !raw.name.trim().is_empty() {
        event.name = raw.name.clone();
    }
    overwrite(&mut event.venue_id, &venue_id);
    merge_category(&mut event.category, &mut event.subcategory, &raw.category, &raw.subcategory);
    overwrite(&mut event.start_time, &raw.start_time);
    overwrite(&mut event.end_time, &raw.end_time);
    overwrite(&mut event.predicted_attendance, &raw.predicted_attendance);
    overwrite(&mut event.psychographic_relevance, &raw.psychographic_relevance);
    event.updated_at = raw.timestamp;
}
