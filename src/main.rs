//! Operator CLI
//!
//! `serve` runs pipeline workers (all roles, or one via `--role`), `migrate`
//! validates store indexes, `janitor` purges soft-deleted rows past
//! retention. Exit codes: 0 clean, 1 fatal startup, 2 graceful shutdown with
//! a drain timeout.

use aegis_posture_core::cache::memory::MemoryCache;
use aegis_posture_core::cache::redis::RedisCache;
use aegis_posture_core::cache::SharedCache;
use aegis_posture_core::config::PipelineConfig;
use aegis_posture_core::connectors::microsoft365::Microsoft365Factory;
use aegis_posture_core::connectors::{
    ConnectorRegistry, IntegrationCapability, LinkRules, SharedRegistry,
};
use aegis_posture_core::fabric::memory::InProcessFabric;
use aegis_posture_core::janitor::Janitor;
use aegis_posture_core::repository::memory::MemoryRepository;
use aegis_posture_core::types::AnalysisType;
use aegis_posture_core::{PipelineRuntime, PostureError, Role};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "aegis-posture", version, about = "Security posture ingestion and analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pipeline workers.
    Serve {
        /// Run a single role instead of the whole pipeline.
        #[arg(long, value_enum)]
        role: Option<Role>,
    },
    /// Validate or build the required store indexes.
    Migrate,
    /// Hard-purge soft-deleted rows past the retention window.
    Janitor,
}

fn build_registry() -> SharedRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register(IntegrationCapability {
        slug: "microsoft-365".to_string(),
        connector: Arc::new(Microsoft365Factory::new()),
        link_rules: LinkRules::directory(),
        analyses: AnalysisType::all(),
    });
    Arc::new(registry)
}

async fn build_cache(config: &PipelineConfig) -> Result<SharedCache, PostureError> {
    match &config.cache_url {
        Some(url) => Ok(Arc::new(RedisCache::connect(url).await?)),
        None => Ok(Arc::new(MemoryCache::new())),
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;

    let repo = Arc::new(MemoryRepository::new());
    let fabric = Arc::new(InProcessFabric::new());
    let cache = build_cache(&config).await?;
    let registry = build_registry();

    let runtime = PipelineRuntime::new(
        config,
        repo.clone(),
        fabric.clone(),
        fabric,
        cache,
        registry,
    );

    match cli.command {
        Command::Migrate => {
            runtime.init().await?;
            info!("indexes verified");
            Ok(ExitCode::SUCCESS)
        }
        Command::Janitor => {
            runtime.init().await?;
            let janitor = Janitor::new(repo);
            let outcome = janitor.run().await?;
            info!(
                entities = outcome.entities_purged,
                relationships = outcome.relationships_purged,
                alerts = outcome.alerts_purged,
                "janitor finished"
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { role } => {
            runtime.init().await?;
            let roles = role.map(|r| vec![r]).unwrap_or_else(Role::all);
            runtime.start(&roles).await?;
            info!(?roles, "serving; press ctrl-c to stop");

            tokio::signal::ctrl_c()
                .await
                .map_err(|e| PostureError::Internal(format!("signal handler failed: {}", e)))?;
            info!("shutdown signal received");

            match runtime.stop().await {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(PostureError::DrainTimeout(_)) => Ok(ExitCode::from(2)),
                Err(e) => Err(e.into()),
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("aegis_posture_core=info".parse().expect("static directive")))
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}
