//! One validator pass for cron-style deployments: hang sweep, completeness
//! checks, reservation TTL refunds and retention purge, then exit.
//!
//! With `--repair`, everything flagged is repaired after the scan.

use std::sync::Arc;

use analysis_engine::{
    config::ConfigLoader,
    consistency::RepairTarget,
    db,
    engine::JobEngine,
    tasks::{ExampleAnalysisBackend, ExampleMediaBackend, TaskRegistry},
    telemetry,
};
use anyhow::{Context, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let repair = std::env::args().skip(1).any(|arg| arg == "--repair");

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db).await?;

    let registry = TaskRegistry::with_backends(
        Arc::new(ExampleMediaBackend::default()),
        Arc::new(ExampleAnalysisBackend::default()),
    );
    let engine = JobEngine::new(&config, db, registry);

    let scan = engine.scan().await.context("running consistency scan")?;
    println!(
        "scan: hung_failed={} checked={} issues={} downgraded={} restored={} refunded={} committed={} purged={}",
        scan.hung_jobs_failed,
        scan.analyses_checked,
        scan.issues_detected,
        scan.analyses_downgraded,
        scan.analyses_restored,
        scan.reservations_refunded,
        scan.reservations_committed,
        scan.records_purged
    );

    if repair {
        let report = engine
            .repair(RepairTarget::All)
            .await
            .context("repairing flagged analyses")?;
        println!(
            "repair: recomputed={} resubmitted={} already_consistent={} not_repairable={}",
            report.recomputed,
            report.resubmitted,
            report.already_consistent,
            report.not_repairable
        );
    }

    Ok(())
}
