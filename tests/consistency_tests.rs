//! Hang detection, consistency scan and repair against persisted state.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use analysis_engine::consistency::{HEARTBEAT_TIMEOUT_REASON, RepairAction, RepairTarget};
use analysis_engine::engine::JobEngine;
use analysis_engine::models::analysis_unit::UNIT_PENDING;
use analysis_engine::models::{
    AnalysisAggregate, AnalysisJob, AnalysisStatus, AnalysisUnit, Job, JobState,
    ReservationState, analysis_job, analysis_unit, job,
};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use test_utils::{
    ScriptedBackend, age_reservation, analysis, setup_engine, test_config, wait_for_state,
};
use uuid::Uuid;

const SETTLE: Duration = Duration::from_secs(5);

/// Pretend the worker of a running job went silent `minutes` ago.
async fn age_heartbeat(db: &DatabaseConnection, job_id: Uuid, minutes: i64) -> Result<()> {
    let stale = (Utc::now() - ChronoDuration::minutes(minutes)).fixed_offset();
    Job::update_many()
        .col_expr(job::Column::LastHeartbeatAt, Expr::value(stale))
        .filter(job::Column::Id.eq(job_id))
        .exec(db)
        .await?;
    AnalysisJob::update_many()
        .col_expr(analysis_job::Column::LastHeartbeatAt, Expr::value(stale))
        .filter(analysis_job::Column::JobId.eq(job_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Run one analysis to completion on a started engine, then stop it.
async fn completed_analysis(
    engine: &JobEngine,
    owner_id: Uuid,
    units: &[&str],
) -> Result<Uuid> {
    engine.start().await?;
    let job_id = engine
        .submit(analysis(owner_id, "creator-9", units, 0))
        .await?
        .job_id;
    wait_for_state(engine, job_id, JobState::Succeeded, SETTLE).await?;
    engine.shutdown().await;
    Ok(job_id)
}

#[tokio::test]
async fn test_silent_running_job_is_failed_and_refunded_by_scan() -> Result<()> {
    let backend = ScriptedBackend::new();
    let (engine, db) = setup_engine(&test_config(), &backend).await?;
    let owner = Uuid::new_v4();
    engine.deposit(owner, 100).await?;

    let submitted = engine
        .submit(analysis(owner, "creator-1", &["p1", "p2"], 100))
        .await?;
    assert_eq!(engine.balance(owner).await?.balance, 0);

    // Claimed by a worker that then died without a trace.
    engine
        .lifecycle()
        .claim_job(submitted.job_id)
        .await?
        .expect("job is claimable");
    age_heartbeat(&db, submitted.job_id, 10).await?;

    let view = engine.status(submitted.job_id).await?;
    assert_eq!(view.status, AnalysisStatus::Running);
    assert!(view.health.is_hung);

    let report = engine.scan().await?;
    assert_eq!(report.hung_jobs_failed, 1);

    let view = engine.status(submitted.job_id).await?;
    assert_eq!(view.status, AnalysisStatus::Failed);
    assert!(!view.health.is_hung);
    assert_eq!(view.error.as_deref(), Some(HEARTBEAT_TIMEOUT_REASON));

    assert_eq!(engine.balance(owner).await?.balance, 100);
    let reservation = engine
        .reservation(submitted.reservation_id.expect("reservation"))
        .await?;
    assert_eq!(
        reservation.reservation_state(),
        Some(ReservationState::Refunded)
    );

    // A second pass finds nothing left to do.
    assert_eq!(engine.scan().await?.hung_jobs_failed, 0);
    assert_eq!(engine.balance(owner).await?.balance, 100);
    Ok(())
}

#[tokio::test]
async fn test_recent_heartbeat_is_not_hung() -> Result<()> {
    let backend = ScriptedBackend::new();
    let (engine, db) = setup_engine(&test_config(), &backend).await?;

    let job_id = engine
        .submit(analysis(Uuid::new_v4(), "creator-2", &["p1"], 0))
        .await?
        .job_id;
    engine.lifecycle().claim_job(job_id).await?;
    age_heartbeat(&db, job_id, 4).await?;

    assert!(!engine.status(job_id).await?.health.is_hung);
    assert_eq!(engine.scan().await?.hung_jobs_failed, 0);
    assert_eq!(engine.get_job(job_id).await?.state, "running");
    Ok(())
}

#[tokio::test]
async fn test_missing_aggregate_is_detected_and_recomputed_once() -> Result<()> {
    let backend = ScriptedBackend::new();
    let (engine, db) = setup_engine(&test_config(), &backend).await?;
    let job_id = completed_analysis(&engine, Uuid::new_v4(), &["p1", "p2", "p3"]).await?;

    let original = engine.lifecycle().get_aggregate(job_id).await?.expect("aggregate");
    AnalysisAggregate::delete_by_id(job_id).exec(&db).await?;

    let report = engine.scan().await?;
    assert_eq!(report.analyses_checked, 1);
    assert_eq!(report.issues_detected, 1);
    assert_eq!(report.analyses_downgraded, 1);
    assert_eq!(
        engine.status(job_id).await?.status,
        AnalysisStatus::RepairNeeded
    );
    assert_eq!(engine.get_job(job_id).await?.state, "repairing");

    let issues = engine.list_issues(true, 10).await?;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].issue_type, "aggregate_missing");

    // Scanning again does not duplicate the open issue.
    assert_eq!(engine.scan().await?.issues_detected, 0);
    assert_eq!(engine.list_issues(true, 10).await?.len(), 1);

    let report = engine.repair(RepairTarget::All).await?;
    assert_eq!(report.recomputed, 1);
    assert_eq!(report.outcomes[0].action, RepairAction::Recomputed);

    let view = engine.status(job_id).await?;
    assert_eq!(view.status, AnalysisStatus::Completed);
    assert_eq!(engine.get_job(job_id).await?.state, "succeeded");
    let rebuilt = engine.lifecycle().get_aggregate(job_id).await?.expect("aggregate");
    assert_eq!(rebuilt.unit_count, original.unit_count);
    assert_eq!(rebuilt.summary, original.summary);
    assert!(engine.list_issues(true, 10).await?.is_empty());

    // Repeating the repair changes nothing.
    let report = engine.repair(RepairTarget::All).await?;
    assert!(report.outcomes.is_empty());
    let report = engine.repair(RepairTarget::Id(job_id)).await?;
    assert_eq!(report.already_consistent, 1);
    assert_eq!(
        engine.lifecycle().get_aggregate(job_id).await?,
        Some(rebuilt)
    );
    Ok(())
}

#[tokio::test]
async fn test_lost_unit_results_are_reprocessed() -> Result<()> {
    let backend = ScriptedBackend::new();
    let config = test_config();
    let (first, db) = setup_engine(&config, &backend).await?;
    let job_id = completed_analysis(&first, Uuid::new_v4(), &["p1", "p2", "p3"]).await?;
    drop(first);

    AnalysisUnit::update_many()
        .col_expr(analysis_unit::Column::Status, Expr::value(UNIT_PENDING))
        .col_expr(
            analysis_unit::Column::Result,
            Expr::value(Option::<serde_json::Value>::None),
        )
        .filter(analysis_unit::Column::AnalysisJobId.eq(job_id))
        .filter(analysis_unit::Column::UnitKey.eq("p2"))
        .exec(&db)
        .await?;

    let engine = Arc::new(JobEngine::new(&config, db, backend.registry()));
    let report = engine.scan().await?;
    assert_eq!(report.issues_detected, 1);
    let issues = engine.list_issues(true, 10).await?;
    assert_eq!(issues[0].issue_type, "incomplete_units");

    // Repairing by issue id resolves to the analysis; a repeat reuses the active reprocess job.
    let report = engine.repair(RepairTarget::Id(issues[0].id)).await?;
    assert_eq!(report.resubmitted, 1);
    let reprocess_ids = report.outcomes[0].reprocess_job_ids.clone();
    assert_eq!(reprocess_ids.len(), 1);

    let again = engine.repair(RepairTarget::All).await?;
    assert_eq!(again.outcomes[0].action, RepairAction::UnitsResubmitted);
    assert_eq!(again.outcomes[0].reprocess_job_ids, reprocess_ids);

    engine.start().await?;
    wait_for_state(&engine, reprocess_ids[0], JobState::Succeeded, SETTLE).await?;
    engine.shutdown().await;

    assert_eq!(backend.call_count("p2"), 2);
    assert_eq!(engine.status(job_id).await?.status, AnalysisStatus::Completed);
    let aggregate = engine.lifecycle().get_aggregate(job_id).await?.expect("aggregate");
    assert_eq!(aggregate.unit_count, 3);
    assert!(engine.list_issues(true, 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_deleted_unit_row_is_recreated_and_reprocessed() -> Result<()> {
    let backend = ScriptedBackend::new();
    let config = test_config();
    let (first, db) = setup_engine(&config, &backend).await?;
    let job_id = completed_analysis(&first, Uuid::new_v4(), &["p1", "p2", "p3"]).await?;
    drop(first);

    AnalysisUnit::delete_many()
        .filter(analysis_unit::Column::AnalysisJobId.eq(job_id))
        .filter(analysis_unit::Column::UnitKey.eq("p3"))
        .exec(&db)
        .await?;

    let engine = Arc::new(JobEngine::new(&config, db.clone(), backend.registry()));
    let report = engine.scan().await?;
    assert_eq!(report.issues_detected, 1);
    assert_eq!(report.analyses_downgraded, 1);
    assert_eq!(
        engine.list_issues(true, 10).await?[0].issue_type,
        "incomplete_units"
    );

    // Two stored results out of three are not enough to complete.
    assert!(
        !engine
            .lifecycle()
            .complete_repair(job_id, "aggregate recomputed")
            .await?
    );

    let report = engine.repair(RepairTarget::Id(job_id)).await?;
    assert_eq!(report.resubmitted, 1);
    assert_eq!(report.outcomes[0].action, RepairAction::UnitsResubmitted);
    let reprocess_ids = report.outcomes[0].reprocess_job_ids.clone();
    assert_eq!(reprocess_ids.len(), 1);

    let view = engine.status(job_id).await?;
    assert_eq!(view.status, AnalysisStatus::RepairNeeded);
    assert_eq!(view.progress.units_done, 2);
    let units = engine.lifecycle().list_units(job_id).await?;
    assert_eq!(units.len(), 3);
    assert!(units[2].is_pending());

    engine.start().await?;
    wait_for_state(&engine, reprocess_ids[0], JobState::Succeeded, SETTLE).await?;
    engine.shutdown().await;

    assert_eq!(backend.call_count("p3"), 2);
    let view = engine.status(job_id).await?;
    assert_eq!(view.status, AnalysisStatus::Completed);
    assert_eq!(view.progress.units_done, 3);
    let aggregate = engine.lifecycle().get_aggregate(job_id).await?.expect("aggregate");
    assert_eq!(aggregate.unit_count, 3);

    // Settled: a fresh scan finds nothing to flag.
    let report = engine.scan().await?;
    assert_eq!(report.issues_detected, 0);
    assert_eq!(report.analyses_downgraded, 0);
    assert!(engine.list_issues(true, 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_finalized_analysis_of_a_dead_worker_is_committed_not_refunded() -> Result<()> {
    let backend = ScriptedBackend::new();
    let (engine, db) = setup_engine(&test_config(), &backend).await?;
    let owner = Uuid::new_v4();
    engine.deposit(owner, 100).await?;

    let submitted = engine
        .submit(analysis(owner, "creator-6", &["p1", "p2"], 100))
        .await?;
    let job_id = submitted.job_id;
    let lifecycle = engine.lifecycle();
    lifecycle.claim_job(job_id).await?.expect("job is claimable");
    for unit_key in ["p1", "p2"] {
        lifecycle
            .record_unit_success(job_id, unit_key, serde_json::json!({"score": 1}))
            .await?;
    }
    assert_eq!(
        lifecycle.finalize_analysis(job_id).await?,
        AnalysisStatus::Completed
    );
    // The job completes together with its analysis, before any reservation commit.
    assert_eq!(engine.get_job(job_id).await?.state, "succeeded");

    // The worker died right there: stale heartbeat, reservation still held.
    age_heartbeat(&db, job_id, 10).await?;
    age_reservation(&db, submitted.reservation_id.expect("reservation"), 2).await?;

    let report = engine.scan().await?;
    assert_eq!(report.hung_jobs_failed, 0);
    assert_eq!(report.reservations_committed, 1);
    assert_eq!(report.reservations_refunded, 0);

    assert_eq!(engine.status(job_id).await?.status, AnalysisStatus::Completed);
    assert_eq!(engine.balance(owner).await?.balance, 0);
    let reservation = engine
        .reservation(submitted.reservation_id.expect("reservation"))
        .await?;
    assert_eq!(
        reservation.reservation_state(),
        Some(ReservationState::Committed)
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_analysis_is_not_repairable() -> Result<()> {
    let backend = ScriptedBackend::new();
    backend.script("p1", test_utils::Script::Permanent);
    let (engine, _db) = setup_engine(&test_config(), &backend).await?;

    engine.start().await?;
    let job_id = engine
        .submit(analysis(Uuid::new_v4(), "creator-4", &["p1"], 0))
        .await?
        .job_id;
    wait_for_state(&engine, job_id, JobState::Failed, SETTLE).await?;
    engine.shutdown().await;

    let report = engine.repair(RepairTarget::Id(job_id)).await?;
    assert_eq!(report.not_repairable, 1);
    assert_eq!(engine.status(job_id).await?.status, AnalysisStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_scan_purges_terminal_records_past_retention() -> Result<()> {
    let backend = ScriptedBackend::new();
    let config = test_config();
    let (first, db) = setup_engine(&config, &backend).await?;
    let old_id = completed_analysis(&first, Uuid::new_v4(), &["p1", "p2"]).await?;
    drop(first);

    let engine = JobEngine::new(&config, db.clone(), backend.registry());
    let recent_id = engine
        .submit(analysis(Uuid::new_v4(), "creator-5", &["p1"], 0))
        .await?
        .job_id;

    // Finished well before the default 30-day window.
    let long_ago = (Utc::now() - ChronoDuration::days(45)).fixed_offset();
    Job::update_many()
        .col_expr(job::Column::CompletedAt, Expr::value(long_ago))
        .filter(job::Column::Id.eq(old_id))
        .exec(&db)
        .await?;

    let report = engine.scan().await?;
    assert_eq!(report.records_purged, 1);

    assert!(engine.get_job(old_id).await.is_err());
    assert!(AnalysisJob::find_by_id(old_id).one(&db).await?.is_none());
    assert!(AnalysisAggregate::find_by_id(old_id).one(&db).await?.is_none());
    let units = AnalysisUnit::find()
        .filter(analysis_unit::Column::AnalysisJobId.eq(old_id))
        .all(&db)
        .await?;
    assert!(units.is_empty());

    // Queued work is never purged.
    assert_eq!(engine.get_job(recent_id).await?.state, "queued");
    Ok(())
}
