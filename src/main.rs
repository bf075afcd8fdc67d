//! # Analysis Engine Main Entry Point
//!
//! Serves the API with the background engine by default; the other
//! subcommands run one-off operator tasks against the same database.

use std::sync::Arc;

use analysis_engine::{
    config::ConfigLoader,
    consistency::RepairTarget,
    db,
    engine::JobEngine,
    server::run_server,
    tasks::{ExampleAnalysisBackend, ExampleMediaBackend, TaskRegistry},
    telemetry,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "analysis-engine")]
#[command(about = "Background job engine for creator analytics: queue, workers, validation, credits.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API together with the worker pool and the periodic validator (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Run one consistency scan and print the report
    Scan,
    /// Repair one analysis (or issue) by id, or everything flagged
    Repair {
        /// `all`, an analysis job id or a consistency issue id
        #[arg(long, default_value = "all")]
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new()
        .load()
        .context("Failed to load configuration")?;
    telemetry::init_tracing(&config).context("Failed to initialize telemetry")?;
    info!(profile = %config.profile, "Configuration loaded");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config).await?;
    db::run_migrations(&db).await?;

    let registry = TaskRegistry::with_backends(
        Arc::new(ExampleMediaBackend::default()),
        Arc::new(ExampleAnalysisBackend::default()),
    );
    let engine = Arc::new(JobEngine::new(&config, db.clone(), registry));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config, db, engine).await,
        Command::Migrate => Ok(()),
        Command::Scan => {
            let report = engine.scan().await.context("Consistency scan failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Repair { target } => {
            let target: RepairTarget = target.parse().map_err(|err: String| anyhow!(err))?;
            let report = engine.repair(target).await.context("Repair failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
