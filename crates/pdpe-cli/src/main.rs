use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pdpe_storage::PgStore;
use pdpe_sync::{build_orchestrator, connect_store, PipelineConfig};

#[derive(Debug, Parser)]
#[command(name = "pdpe-cli")]
#[command(about = "Psychographic data pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled collector, resolve, enrich and score.
    Collect {
        /// Venue and event collectors only.
        #[arg(long)]
        priority: bool,
    },
    /// Re-run the named sources without scoring.
    Refresh {
        #[arg(required = true)]
        sources: Vec<String>,
    },
    /// Print the data health report.
    Health,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Collect { priority: false }) {
        Commands::Collect { priority } => {
            let orchestrator = build_orchestrator(&config, connect_store(&config)?).await?;
            let report = if priority {
                orchestrator.collect_priority_data().await
            } else {
                orchestrator.collect_all_data(None, None).await
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Refresh { sources } => {
            let orchestrator = build_orchestrator(&config, connect_store(&config)?).await?;
            let names: Vec<&str> = sources.iter().map(String::as_str).collect();
            let report = orchestrator.refresh_data_sources(&names).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Health => {
            let orchestrator = build_orchestrator(&config, connect_store(&config)?).await?;
            let report = orchestrator.get_data_health_report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let url = config.database_url.as_deref().context("DATABASE_URL is required for migrate")?;
            let store = PgStore::connect(url, 1).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
