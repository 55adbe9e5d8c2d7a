use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pdpe_adapters::{collector_for_source, SourceCollector, SourceConfig, SourceMode, DEFAULT_TIME_PERIOD_DAYS};
use pdpe_core::RunReport;
use pdpe_storage::{HttpClientConfig, HttpFetcher, InMemoryStore, MasterDataStore, PgStore};
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::prediction::{build_predictor, PredictorKind};
use crate::resolver::{MatchStrategy, ResolverConfig};
use crate::scoring::{ScoringConfig, ScoringPath, WeightProfile};

const PG_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub collector_timeout_secs: u64,
    pub weight_profile: WeightProfile,
    pub scoring_path: ScoringPath,
    pub match_strategy: MatchStrategy,
    pub predictor: PredictorKind,
    pub time_period_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let weight_profile = match text("PDPE_WEIGHT_PROFILE") {
            None => WeightProfile::default(),
            Some(name) => WeightProfile::parse(&name).unwrap_or_else(|| {
                warn!(value = %name, "unknown PDPE_WEIGHT_PROFILE; using comprehensive");
                WeightProfile::default()
            }),
        };

        Self {
            database_url: text("DATABASE_URL"),
            workspace_root: text("PDPE_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            reports_dir: text("PDPE_REPORTS_DIR").map(PathBuf::from),
            user_agent: text("PDPE_USER_AGENT").unwrap_or_else(|| "pdpe-bot/0.1".to_string()),
            http_timeout_secs: parsed(&text, "PDPE_HTTP_TIMEOUT_SECS", 15),
            collector_timeout_secs: parsed(&text, "PDPE_COLLECTOR_TIMEOUT_SECS", 120),
            weight_profile,
            scoring_path: parsed(&text, "PDPE_SCORING_PATH", ScoringPath::VenueCentric),
            match_strategy: parsed(&text, "PDPE_MATCH_STRATEGY", MatchStrategy::Substring),
            predictor: parsed(&text, "PDPE_PREDICTOR", PredictorKind::Baseline),
            time_period_days: parsed(&text, "PDPE_TIME_PERIOD_DAYS", DEFAULT_TIME_PERIOD_DAYS),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            collector_timeout: Duration::from_secs(self.collector_timeout_secs),
            time_period: chrono::Duration::days(self.time_period_days),
            resolver: ResolverConfig {
                strategy: self.match_strategy,
                ..ResolverConfig::default()
            },
            scoring: ScoringConfig {
                weights: self.weight_profile,
                path: self.scoring_path,
            },
            reports_dir: self.reports_dir.clone(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn parsed<T: FromStr>(text: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match text(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

pub async fn load_source_registry(workspace_root: &Path) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Collectors for every enabled source. The HTTP fetcher is only built when a source needs it.
pub fn build_collectors(
    registry: &SourceRegistry,
    workspace_root: &Path,
    http_config: HttpClientConfig,
) -> Result<Vec<Box<dyn SourceCollector>>> {
    let http = if registry.enabled().any(|s| s.mode == SourceMode::Http) {
        Some(Arc::new(HttpFetcher::new(http_config)?))
    } else {
        None
    };

    let mut collectors = Vec::new();
    for source in &registry.sources {
        if !source.enabled {
            debug!(source_name = %source.source_name, "source disabled");
            continue;
        }
        let collector = collector_for_source(source, workspace_root, http.clone())
            .with_context(|| format!("building collector for {}", source.source_name))?;
        collectors.push(collector);
    }
    Ok(collectors)
}

pub fn connect_store(config: &PipelineConfig) -> Result<Arc<dyn MasterDataStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect_lazy(url, PG_MAX_CONNECTIONS).context("configuring postgres pool")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

pub async fn build_orchestrator(config: &PipelineConfig, store: Arc<dyn MasterDataStore>) -> Result<Orchestrator> {
    let registry = load_source_registry(&config.workspace_root).await?;
    let collectors = build_collectors(&registry, &config.workspace_root, config.http_client_config())?;
    let predictor = build_predictor(config.predictor, config.weight_profile, store.clone());
    Ok(Orchestrator::new(store, collectors, predictor, config.orchestrator_config()))
}

pub async fn run_collection_once_from_env() -> Result<RunReport> {
    let config = PipelineConfig::from_env();
    let store = connect_store(&config)?;
    let orchestrator = build_orchestrator(&config, store).await?;
    Ok(orchestrator.collect_all_data(None, None).await)
}
