//! Identity resolution, contextual enrichment, quality and psychographic scoring,
//! and the collection orchestrator that sequences them.

pub mod config;
pub mod enrichment;
pub mod orchestrator;
pub mod prediction;
pub mod quality;
pub mod reports;
pub mod resolver;
pub mod scoring;

pub use config::{
    build_collectors, build_orchestrator, connect_store, load_source_registry,
    run_collection_once_from_env, PipelineConfig, SourceRegistry,
};
pub use enrichment::{EnrichmentConfig, EnrichmentService};
pub use orchestrator::{
    consolidate_results, HealthReport, Orchestrator, OrchestratorConfig, RunPhase, VenueHealth,
    UNIFIED_VENUES_SOURCE,
};
pub use prediction::{build_predictor, BaselinePredictor, PredictionError, Predictor, PredictorKind, StoredPredictor};
pub use quality::{check_batch, ProfileChecklist, Validate};
pub use reports::{write_run_reports, RunArtifacts, ScoredVenue};
pub use resolver::{
    categorize_event_provider, categorize_provider, IdentityResolver, MatchKind, MatchStrategy,
    ProviderCategory, ResolveError, ResolverConfig, ReviewCandidate,
};
pub use scoring::{ScoringConfig, ScoringEngine, ScoringPath, WeightProfile};

pub const CRATE_NAME: &str = "pdpe-sync";
