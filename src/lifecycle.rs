//! # Job Lifecycle Tracker
//!
//! Owns every persisted state transition of `jobs`, `analysis_jobs` and
//! `analysis_units`. Transitions are compare-and-swap updates filtered on the
//! expected source state, so a replayed or racing call affects zero rows
//! instead of corrupting the record.
//!
//! Liveness is only ever read from `last_heartbeat_at`. `is_hung` is derived
//! when a status view is read and is never stored.
//!
//! An analysis is `completed` only when every one of its units succeeded;
//! any failed unit makes the whole analysis `failed`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::LifecycleConfig;
use crate::credit_gate::cutoff_before;
use crate::models::analysis_aggregate::{
    ActiveModel as AggregateActiveModel, Column as AggregateColumn, Entity as AnalysisAggregate,
    Model as AggregateModel,
};
use crate::models::analysis_job::{
    ActiveModel as AnalysisActiveModel, Column as AnalysisColumn, Entity as AnalysisJob,
    Model as AnalysisModel,
};
use crate::models::analysis_unit::{
    self, ActiveModel as UnitActiveModel, Column as UnitColumn, Entity as AnalysisUnit,
    Model as UnitModel, UNIT_FAILED, UNIT_PENDING, UNIT_SUCCEEDED,
};
use crate::models::consistency_issue::{Column as IssueColumn, Entity as ConsistencyIssue};
use crate::models::job::{
    ActiveModel as JobActiveModel, Column as JobColumn, Entity as Job, Model as JobModel,
};
use crate::models::{AnalysisStatus, JobState, Priority};
use crate::tasks::JobPayload;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("job {job_id} not found")]
    JobNotFound { job_id: Uuid },
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition { job_id: Uuid, from: String, to: String },
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything needed to persist a freshly submitted job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub payload: JobPayload,
    pub dedup_key: String,
    pub priority: Priority,
    pub cost: i64,
    pub max_attempts: i32,
    pub reservation_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProgressView {
    /// 0.0 to 100.0, one decimal
    pub percentage: f64,
    pub units_done: i32,
    pub units_total: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TimingView {
    #[schema(value_type = Option<String>, format = DateTime)]
    pub started_at: Option<DateTime<FixedOffset>>,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub last_heartbeat_at: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthView {
    pub is_hung: bool,
}

/// Poll-friendly status of a job, as returned by `GET /jobs/{job_id}/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: AnalysisStatus,
    pub progress: ProgressView,
    pub timing: TimingView,
    pub health: HealthView,
    /// Last failure reason for failed or repair-needed jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `status = running AND now - last_heartbeat_at > threshold`.
pub fn is_hung(
    status: AnalysisStatus,
    last_heartbeat_at: Option<DateTime<FixedOffset>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    if status != AnalysisStatus::Running {
        return false;
    }
    let Some(heartbeat) = last_heartbeat_at else {
        return false;
    };
    let silent_for = now.signed_duration_since(heartbeat.with_timezone(&Utc));
    silent_for
        .to_std()
        .map(|silent_for| silent_for > threshold)
        .unwrap_or(false)
}

fn percentage(done: i32, total: i32, finished: bool) -> f64 {
    if total <= 0 {
        return if finished { 100.0 } else { 0.0 };
    }
    let permille = (i64::from(done.clamp(0, total)) * 1000) / i64::from(total);
    permille as f64 / 10.0
}

fn public_status(state: JobState) -> AnalysisStatus {
    match state {
        JobState::Queued => AnalysisStatus::Pending,
        JobState::Running => AnalysisStatus::Running,
        JobState::Succeeded => AnalysisStatus::Completed,
        JobState::Failed => AnalysisStatus::Failed,
        JobState::Repairing => AnalysisStatus::RepairNeeded,
    }
}

fn now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

pub struct JobLifecycleTracker {
    db: DatabaseConnection,
    hang_threshold: Duration,
    status_cache: TtlCache<Uuid, JobStatusView>,
}

impl JobLifecycleTracker {
    pub fn new(db: DatabaseConnection, config: &LifecycleConfig) -> Self {
        Self {
            db,
            hang_threshold: config.hang_threshold(),
            status_cache: TtlCache::new(config.status_cache_capacity, config.status_cache_ttl()),
        }
    }

    pub fn hang_threshold(&self) -> Duration {
        self.hang_threshold
    }

    async fn invalidate(&self, job_id: Uuid) {
        self.status_cache.invalidate(&job_id).await;
    }

    /// Persist a queued job and, for content analysis, its pending analysis record and units.
    #[instrument(skip(self, new), fields(job_id = %new.job_id, kind = new.payload.kind().as_str()))]
    pub async fn create_job(&self, new: NewJob) -> Result<JobModel, LifecycleError> {
        let ts = now();
        let payload_json = serde_json::to_value(&new.payload)?;
        let txn = self.db.begin().await?;

        let job = JobActiveModel {
            id: Set(new.job_id),
            owner_id: Set(new.owner_id),
            kind: Set(new.payload.kind().as_str().to_string()),
            payload: Set(payload_json),
            dedup_key: Set(new.dedup_key.clone()),
            priority: Set(new.priority.as_i16()),
            state: Set(JobState::Queued.as_str().to_string()),
            attempt_count: Set(0),
            max_attempts: Set(new.max_attempts),
            cost: Set(new.cost),
            reservation_id: Set(new.reservation_id),
            enqueued_at: Set(ts),
            retry_after: Set(None),
            started_at: Set(None),
            last_heartbeat_at: Set(None),
            completed_at: Set(None),
            error: Set(None),
            created_at: Set(ts),
            updated_at: Set(ts),
        }
        .insert(&txn)
        .await?;

        if let JobPayload::ContentAnalysis {
            target_entity_id,
            unit_keys,
        } = &new.payload
        {
            AnalysisActiveModel {
                job_id: Set(new.job_id),
                owner_id: Set(new.owner_id),
                target_entity_id: Set(target_entity_id.clone()),
                status: Set(AnalysisStatus::Pending.as_str().to_string()),
                units_total: Set(unit_keys.len() as i32),
                units_done: Set(0),
                units_failed: Set(0),
                started_at: Set(None),
                last_heartbeat_at: Set(None),
                completed_at: Set(None),
                failure_reason: Set(None),
                created_at: Set(ts),
                updated_at: Set(ts),
            }
            .insert(&txn)
            .await?;

            let units: Vec<UnitActiveModel> = unit_keys
                .iter()
                .enumerate()
                .map(|(position, unit_key)| UnitActiveModel {
                    id: Set(Uuid::new_v4()),
                    analysis_job_id: Set(new.job_id),
                    unit_key: Set(unit_key.clone()),
                    position: Set(position as i32),
                    status: Set(UNIT_PENDING.to_string()),
                    result: Set(None),
                    error: Set(None),
                    processed_at: Set(None),
                    created_at: Set(ts),
                    updated_at: Set(ts),
                })
                .collect();
            if !units.is_empty() {
                AnalysisUnit::insert_many(units)
                    .exec_without_returning(&txn)
                    .await?;
            }
        }

        txn.commit().await?;
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<JobModel, LifecycleError> {
        Job::find_by_id(job_id)
            .one(&self.db)
            .await?
            .ok_or(LifecycleError::JobNotFound { job_id })
    }

    pub async fn find_job(&self, job_id: Uuid) -> Result<Option<JobModel>, LifecycleError> {
        Ok(Job::find_by_id(job_id).one(&self.db).await?)
    }

    pub async fn get_analysis(&self, job_id: Uuid) -> Result<Option<AnalysisModel>, LifecycleError> {
        Ok(AnalysisJob::find_by_id(job_id).one(&self.db).await?)
    }

    pub async fn list_units(&self, job_id: Uuid) -> Result<Vec<UnitModel>, LifecycleError> {
        Ok(AnalysisUnit::find()
            .filter(UnitColumn::AnalysisJobId.eq(job_id))
            .order_by_asc(UnitColumn::Position)
            .all(&self.db)
            .await?)
    }

    /// Units not yet processed, in their original order. A retried analysis resumes here.
    pub async fn pending_units(&self, job_id: Uuid) -> Result<Vec<UnitModel>, LifecycleError> {
        Ok(AnalysisUnit::find()
            .filter(UnitColumn::AnalysisJobId.eq(job_id))
            .filter(UnitColumn::Status.eq(UNIT_PENDING))
            .order_by_asc(UnitColumn::Position)
            .all(&self.db)
            .await?)
    }

    pub async fn get_aggregate(
        &self,
        job_id: Uuid,
    ) -> Result<Option<AggregateModel>, LifecycleError> {
        Ok(AnalysisAggregate::find_by_id(job_id).one(&self.db).await?)
    }

    /// Queued jobs in dispatch order, for re-enqueueing after a restart.
    pub async fn queued_jobs(&self) -> Result<Vec<JobModel>, LifecycleError> {
        Ok(Job::find()
            .filter(JobColumn::State.eq(JobState::Queued.as_str()))
            .order_by_desc(JobColumn::Priority)
            .order_by_asc(JobColumn::EnqueuedAt)
            .all(&self.db)
            .await?)
    }

    /// Queued to Running. Returns `None` when the job is no longer queued or its attempt budget
    /// is spent, so a job can only be claimed by one worker per attempt.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn claim_job(&self, job_id: Uuid) -> Result<Option<JobModel>, LifecycleError> {
        let ts = now();
        let txn = self.db.begin().await?;

        let claimed = Job::update_many()
            .col_expr(JobColumn::State, Expr::value(JobState::Running.as_str()))
            .col_expr(
                JobColumn::AttemptCount,
                Expr::col(JobColumn::AttemptCount).add(1),
            )
            .col_expr(JobColumn::StartedAt, Expr::value(ts))
            .col_expr(JobColumn::LastHeartbeatAt, Expr::value(ts))
            .col_expr(JobColumn::RetryAfter, Expr::value(Option::<DateTime<FixedOffset>>::None))
            .col_expr(JobColumn::UpdatedAt, Expr::value(ts))
            .filter(JobColumn::Id.eq(job_id))
            .filter(JobColumn::State.eq(JobState::Queued.as_str()))
            .filter(Expr::col(JobColumn::AttemptCount).lt(Expr::col(JobColumn::MaxAttempts)))
            .exec(&txn)
            .await?;

        if claimed.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(None);
        }

        AnalysisJob::update_many()
            .col_expr(
                AnalysisColumn::Status,
                Expr::value(AnalysisStatus::Running.as_str()),
            )
            .col_expr(AnalysisColumn::StartedAt, Expr::value(ts))
            .col_expr(AnalysisColumn::LastHeartbeatAt, Expr::value(ts))
            .col_expr(AnalysisColumn::UpdatedAt, Expr::value(ts))
            .filter(AnalysisColumn::JobId.eq(job_id))
            .filter(AnalysisColumn::Status.eq(AnalysisStatus::Pending.as_str()))
            .exec(&txn)
            .await?;

        let job = Job::find_by_id(job_id).one(&txn).await?;
        txn.commit().await?;
        self.invalidate(job_id).await;
        Ok(job)
    }

    /// Refresh liveness of a running job. Returns false when the job is no longer running, which
    /// tells the worker to stop.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<bool, LifecycleError> {
        let alive = touch(&self.db, job_id, now()).await?;
        self.invalidate(job_id).await;
        Ok(alive)
    }

    /// Mark one unit succeeded and advance progress. Idempotent per unit; a previously failed
    /// unit that now succeeds stops counting as failed.
    #[instrument(skip(self, result), fields(job_id = %job_id, unit_key))]
    pub async fn record_unit_success(
        &self,
        job_id: Uuid,
        unit_key: &str,
        result: JsonValue,
    ) -> Result<bool, LifecycleError> {
        self.record_unit(job_id, unit_key, UNIT_SUCCEEDED, Some(result), None)
            .await
    }

    /// Mark one unit irrecoverably failed. The analysis can no longer complete.
    #[instrument(skip(self), fields(job_id = %job_id, unit_key))]
    pub async fn record_unit_failure(
        &self,
        job_id: Uuid,
        unit_key: &str,
        error: &str,
    ) -> Result<bool, LifecycleError> {
        self.record_unit(job_id, unit_key, UNIT_FAILED, None, Some(error.to_string()))
            .await
    }

    async fn record_unit(
        &self,
        job_id: Uuid,
        unit_key: &str,
        status: &'static str,
        result: Option<JsonValue>,
        error: Option<String>,
    ) -> Result<bool, LifecycleError> {
        let ts = now();
        let txn = self.db.begin().await?;

        let Some(unit) = AnalysisUnit::find()
            .filter(UnitColumn::AnalysisJobId.eq(job_id))
            .filter(UnitColumn::UnitKey.eq(unit_key))
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Err(LifecycleError::JobNotFound { job_id });
        };

        if unit.status == status || unit.is_succeeded() {
            txn.rollback().await?;
            return Ok(false);
        }

        let previous = unit.status.clone();
        let mut active: UnitActiveModel = unit.into();
        active.status = Set(status.to_string());
        active.result = Set(result);
        active.error = Set(error);
        active.processed_at = Set(Some(ts));
        active.updated_at = Set(ts);
        active.update(&txn).await?;

        // units_done counts processed units (succeeded or failed).
        let (done_delta, failed_delta) = match (previous.as_str(), status) {
            (UNIT_PENDING, UNIT_SUCCEEDED) => (1, 0),
            (UNIT_PENDING, UNIT_FAILED) => (1, 1),
            (UNIT_FAILED, UNIT_SUCCEEDED) => (0, -1),
            _ => (0, 0),
        };
        AnalysisJob::update_many()
            .col_expr(
                AnalysisColumn::UnitsDone,
                Expr::col(AnalysisColumn::UnitsDone).add(done_delta),
            )
            .col_expr(
                AnalysisColumn::UnitsFailed,
                Expr::col(AnalysisColumn::UnitsFailed).add(failed_delta),
            )
            .col_expr(AnalysisColumn::UpdatedAt, Expr::value(ts))
            .filter(AnalysisColumn::JobId.eq(job_id))
            .exec(&txn)
            .await?;
        touch(&txn, job_id, ts).await?;

        txn.commit().await?;
        self.invalidate(job_id).await;
        Ok(true)
    }

    /// Close a running analysis: `completed` with a fresh aggregate when every unit succeeded,
    /// otherwise `failed`. A completed analysis moves its job to Succeeded in the same
    /// transaction, so the two can never disagree after a crash.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn finalize_analysis(&self, job_id: Uuid) -> Result<AnalysisStatus, LifecycleError> {
        let ts = now();
        let txn = self.db.begin().await?;

        let analysis = AnalysisJob::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or(LifecycleError::JobNotFound { job_id })?;
        if analysis.analysis_status() != Some(AnalysisStatus::Running) {
            txn.rollback().await?;
            return Err(LifecycleError::InvalidTransition {
                job_id,
                from: analysis.status,
                to: "finalized".to_string(),
            });
        }

        let units = load_units(&txn, job_id).await?;
        let pending = units.iter().filter(|unit| unit.is_pending()).count();
        if pending > 0 {
            txn.rollback().await?;
            return Err(LifecycleError::InvalidTransition {
                job_id,
                from: format!("running with {pending} pending units"),
                to: "finalized".to_string(),
            });
        }

        let failed = units.iter().filter(|unit| !unit.is_succeeded()).count();
        let outcome = if failed == 0 {
            let succeeded = Job::update_many()
                .col_expr(JobColumn::State, Expr::value(JobState::Succeeded.as_str()))
                .col_expr(JobColumn::CompletedAt, Expr::value(ts))
                .col_expr(JobColumn::Error, Expr::value(Option::<String>::None))
                .col_expr(JobColumn::UpdatedAt, Expr::value(ts))
                .filter(JobColumn::Id.eq(job_id))
                .filter(JobColumn::State.eq(JobState::Running.as_str()))
                .exec(&txn)
                .await?;
            if succeeded.rows_affected == 0 {
                // Failed or cancelled while the last unit ran.
                txn.rollback().await?;
                return Err(LifecycleError::InvalidTransition {
                    job_id,
                    from: "settled job".to_string(),
                    to: "finalized".to_string(),
                });
            }
            write_aggregate(&txn, &analysis, &units, ts).await?;
            AnalysisStatus::Completed
        } else {
            AnalysisStatus::Failed
        };

        let mut active: AnalysisActiveModel = analysis.into();
        active.status = Set(outcome.as_str().to_string());
        active.completed_at = Set(Some(ts));
        active.updated_at = Set(ts);
        if failed > 0 {
            active.failure_reason = Set(Some(format!(
                "{failed} of {} units failed",
                units.len()
            )));
        }
        active.update(&txn).await?;

        txn.commit().await?;
        self.invalidate(job_id).await;
        info!(status = %outcome, units = units.len(), failed, "Analysis finalized");
        Ok(outcome)
    }

    /// Running back to Queued after a failed attempt. The analysis waits as `pending` so that the
    /// backoff gap is not mistaken for a hang.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn schedule_retry(
        &self,
        job_id: Uuid,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<bool, LifecycleError> {
        let ts = now();
        let txn = self.db.begin().await?;

        let requeued = Job::update_many()
            .col_expr(JobColumn::State, Expr::value(JobState::Queued.as_str()))
            .col_expr(JobColumn::Error, Expr::value(error))
            .col_expr(JobColumn::RetryAfter, Expr::value(retry_after.fixed_offset()))
            .col_expr(JobColumn::UpdatedAt, Expr::value(ts))
            .filter(JobColumn::Id.eq(job_id))
            .filter(JobColumn::State.eq(JobState::Running.as_str()))
            .exec(&txn)
            .await?;

        if requeued.rows_affected == 1 {
            AnalysisJob::update_many()
                .col_expr(
                    AnalysisColumn::Status,
                    Expr::value(AnalysisStatus::Pending.as_str()),
                )
                .col_expr(AnalysisColumn::UpdatedAt, Expr::value(ts))
                .filter(AnalysisColumn::JobId.eq(job_id))
                .filter(AnalysisColumn::Status.eq(AnalysisStatus::Running.as_str()))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        self.invalidate(job_id).await;
        Ok(requeued.rows_affected == 1)
    }

    /// Running to Succeeded. Also true when the job is already Succeeded, which is the case
    /// for analyses closed by [`Self::finalize_analysis`]; false when it was failed meanwhile.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn mark_job_succeeded(&self, job_id: Uuid) -> Result<bool, LifecycleError> {
        let ts = now();
        let done = Job::update_many()
            .col_expr(JobColumn::State, Expr::value(JobState::Succeeded.as_str()))
            .col_expr(JobColumn::CompletedAt, Expr::value(ts))
            .col_expr(JobColumn::Error, Expr::value(Option::<String>::None))
            .col_expr(JobColumn::UpdatedAt, Expr::value(ts))
            .filter(JobColumn::Id.eq(job_id))
            .filter(JobColumn::State.eq(JobState::Running.as_str()))
            .exec(&self.db)
            .await?;
        self.invalidate(job_id).await;
        if done.rows_affected == 1 {
            return Ok(true);
        }
        let job = self.get_job(job_id).await?;
        Ok(job.job_state() == Some(JobState::Succeeded))
    }

    /// Queued or Running to Failed, failing the analysis record with it. Returns false when the
    /// job had already reached a terminal state.
    #[instrument(skip(self), fields(job_id = %job_id, reason))]
    pub async fn mark_job_failed(&self, job_id: Uuid, reason: &str) -> Result<bool, LifecycleError> {
        let ts = now();
        let txn = self.db.begin().await?;

        let failed = Job::update_many()
            .col_expr(JobColumn::State, Expr::value(JobState::Failed.as_str()))
            .col_expr(JobColumn::CompletedAt, Expr::value(ts))
            .col_expr(JobColumn::Error, Expr::value(reason))
            .col_expr(JobColumn::UpdatedAt, Expr::value(ts))
            .filter(JobColumn::Id.eq(job_id))
            .filter(
                JobColumn::State.is_in([JobState::Queued.as_str(), JobState::Running.as_str()]),
            )
            .exec(&txn)
            .await?;

        if failed.rows_affected == 1 {
            AnalysisJob::update_many()
                .col_expr(
                    AnalysisColumn::Status,
                    Expr::value(AnalysisStatus::Failed.as_str()),
                )
                .col_expr(AnalysisColumn::FailureReason, Expr::value(reason))
                .col_expr(AnalysisColumn::CompletedAt, Expr::value(ts))
                .col_expr(AnalysisColumn::UpdatedAt, Expr::value(ts))
                .filter(AnalysisColumn::JobId.eq(job_id))
                .filter(AnalysisColumn::Status.is_in([
                    AnalysisStatus::Pending.as_str(),
                    AnalysisStatus::Running.as_str(),
                ]))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        self.invalidate(job_id).await;
        Ok(failed.rows_affected == 1)
    }

    /// Completed to RepairNeeded (and the job Succeeded to Repairing).
    #[instrument(skip(self), fields(job_id = %job_id, reason))]
    pub async fn mark_repair_needed(&self, job_id: Uuid, reason: &str) -> Result<bool, LifecycleError> {
        let ts = now();
        let txn = self.db.begin().await?;

        let downgraded = AnalysisJob::update_many()
            .col_expr(
                AnalysisColumn::Status,
                Expr::value(AnalysisStatus::RepairNeeded.as_str()),
            )
            .col_expr(AnalysisColumn::FailureReason, Expr::value(reason))
            .col_expr(AnalysisColumn::UpdatedAt, Expr::value(ts))
            .filter(AnalysisColumn::JobId.eq(job_id))
            .filter(AnalysisColumn::Status.eq(AnalysisStatus::Completed.as_str()))
            .exec(&txn)
            .await?;

        if downgraded.rows_affected == 1 {
            Job::update_many()
                .col_expr(JobColumn::State, Expr::value(JobState::Repairing.as_str()))
                .col_expr(JobColumn::UpdatedAt, Expr::value(ts))
                .filter(JobColumn::Id.eq(job_id))
                .filter(JobColumn::State.eq(JobState::Succeeded.as_str()))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        self.invalidate(job_id).await;
        Ok(downgraded.rows_affected == 1)
    }

    /// Try to bring a `repair_needed` analysis back to `completed`: when every unit has
    /// succeeded the aggregate is rebuilt, the analysis completes, its job returns to Succeeded
    /// and open issues for it are resolved, all in one transaction. Returns false (and changes
    /// nothing) while units are still missing. Running it again after success is a no-op.
    #[instrument(skip(self), fields(job_id = %job_id, resolution))]
    pub async fn complete_repair(&self, job_id: Uuid, resolution: &str) -> Result<bool, LifecycleError> {
        let ts = now();
        let txn = self.db.begin().await?;

        let Some(analysis) = AnalysisJob::find_by_id(job_id).one(&txn).await? else {
            txn.rollback().await?;
            return Err(LifecycleError::JobNotFound { job_id });
        };
        if analysis.analysis_status() != Some(AnalysisStatus::RepairNeeded) {
            txn.rollback().await?;
            return Ok(false);
        }

        let units = load_units(&txn, job_id).await?;
        if units.len() as i32 != analysis.units_total
            || units.iter().any(|unit| !unit.is_succeeded())
        {
            txn.rollback().await?;
            return Ok(false);
        }

        write_aggregate(&txn, &analysis, &units, ts).await?;

        let mut active: AnalysisActiveModel = analysis.into();
        active.status = Set(AnalysisStatus::Completed.as_str().to_string());
        active.units_done = Set(units.len() as i32);
        active.units_failed = Set(0);
        active.failure_reason = Set(None);
        active.updated_at = Set(ts);
        active.update(&txn).await?;

        Job::update_many()
            .col_expr(JobColumn::State, Expr::value(JobState::Succeeded.as_str()))
            .col_expr(JobColumn::Error, Expr::value(Option::<String>::None))
            .col_expr(JobColumn::UpdatedAt, Expr::value(ts))
            .filter(JobColumn::Id.eq(job_id))
            .filter(JobColumn::State.eq(JobState::Repairing.as_str()))
            .exec(&txn)
            .await?;

        ConsistencyIssue::update_many()
            .col_expr(IssueColumn::Resolution, Expr::value(resolution))
            .col_expr(IssueColumn::ResolvedAt, Expr::value(ts))
            .filter(IssueColumn::EntityId.eq(job_id))
            .filter(IssueColumn::Resolution.is_null())
            .exec(&txn)
            .await?;

        txn.commit().await?;
        self.invalidate(job_id).await;
        info!("Analysis repaired and completed");
        Ok(true)
    }

    /// Recreate unit rows of a `repair_needed` analysis that went missing, as `pending`, from
    /// the unit keys of the job payload. Progress counters are recomputed from the rows.
    /// Returns the restored keys; empty when nothing was missing or the analysis is not
    /// waiting for repair.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn restore_missing_units(&self, job_id: Uuid) -> Result<Vec<String>, LifecycleError> {
        let ts = now();
        let txn = self.db.begin().await?;

        let Some(analysis) = AnalysisJob::find_by_id(job_id).one(&txn).await? else {
            txn.rollback().await?;
            return Err(LifecycleError::JobNotFound { job_id });
        };
        if analysis.analysis_status() != Some(AnalysisStatus::RepairNeeded) {
            txn.rollback().await?;
            return Ok(Vec::new());
        }
        let job = Job::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or(LifecycleError::JobNotFound { job_id })?;
        let JobPayload::ContentAnalysis { unit_keys, .. } =
            serde_json::from_value::<JobPayload>(job.payload)?
        else {
            txn.rollback().await?;
            return Ok(Vec::new());
        };

        let units = load_units(&txn, job_id).await?;
        let missing: Vec<(usize, String)> = unit_keys
            .into_iter()
            .enumerate()
            .filter(|(_, unit_key)| !units.iter().any(|unit| &unit.unit_key == unit_key))
            .collect();
        if missing.is_empty() {
            txn.rollback().await?;
            return Ok(Vec::new());
        }

        let restored: Vec<UnitActiveModel> = missing
            .iter()
            .map(|(position, unit_key)| UnitActiveModel {
                id: Set(Uuid::new_v4()),
                analysis_job_id: Set(job_id),
                unit_key: Set(unit_key.clone()),
                position: Set(*position as i32),
                status: Set(UNIT_PENDING.to_string()),
                result: Set(None),
                error: Set(None),
                processed_at: Set(None),
                created_at: Set(ts),
                updated_at: Set(ts),
            })
            .collect();
        AnalysisUnit::insert_many(restored)
            .exec_without_returning(&txn)
            .await?;

        let processed = units.iter().filter(|unit| !unit.is_pending()).count() as i32;
        let failed = units.iter().filter(|unit| unit.status == UNIT_FAILED).count() as i32;
        AnalysisJob::update_many()
            .col_expr(AnalysisColumn::UnitsDone, Expr::value(processed))
            .col_expr(AnalysisColumn::UnitsFailed, Expr::value(failed))
            .col_expr(AnalysisColumn::UpdatedAt, Expr::value(ts))
            .filter(AnalysisColumn::JobId.eq(job_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        self.invalidate(job_id).await;
        let keys: Vec<String> = missing.into_iter().map(|(_, unit_key)| unit_key).collect();
        warn!(restored = ?keys, "Recreated missing analysis units");
        Ok(keys)
    }

    /// Status view for polling. Served from the TTL cache when fresh; `is_hung` is always
    /// recomputed against the current time.
    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView, LifecycleError> {
        let mut view = match self.status_cache.get(&job_id).await {
            Some(view) => view,
            None => {
                let view = self.load_status(job_id).await?;
                self.status_cache.insert(job_id, view.clone()).await;
                view
            }
        };
        view.health.is_hung = is_hung(
            view.status,
            view.timing.last_heartbeat_at,
            Utc::now(),
            self.hang_threshold,
        );
        Ok(view)
    }

    async fn load_status(&self, job_id: Uuid) -> Result<JobStatusView, LifecycleError> {
        let job = self.get_job(job_id).await?;

        if let Some(analysis) = AnalysisJob::find_by_id(job_id).one(&self.db).await? {
            let status = analysis
                .analysis_status()
                .unwrap_or(AnalysisStatus::Failed);
            let finished = matches!(status, AnalysisStatus::Completed);
            return Ok(JobStatusView {
                job_id,
                status,
                progress: ProgressView {
                    percentage: percentage(analysis.units_done, analysis.units_total, finished),
                    units_done: analysis.units_done,
                    units_total: analysis.units_total,
                },
                timing: TimingView {
                    started_at: analysis.started_at,
                    last_heartbeat_at: analysis.last_heartbeat_at,
                },
                health: HealthView { is_hung: false },
                error: analysis.failure_reason.or(job.error),
            });
        }

        let state = job.job_state().unwrap_or(JobState::Failed);
        let status = public_status(state);
        let units_done = i32::from(state.is_terminal() || state == JobState::Repairing);
        Ok(JobStatusView {
            job_id,
            status,
            progress: ProgressView {
                percentage: percentage(units_done, 1, state == JobState::Succeeded),
                units_done,
                units_total: 1,
            },
            timing: TimingView {
                started_at: job.started_at,
                last_heartbeat_at: job.last_heartbeat_at,
            },
            health: HealthView { is_hung: false },
            error: job.error,
        })
    }

    /// Running analyses whose heartbeat is older than the hang threshold.
    pub async fn find_hung_analyses(&self, limit: u64) -> Result<Vec<AnalysisModel>, LifecycleError> {
        let cutoff = cutoff_before(self.hang_threshold);
        Ok(AnalysisJob::find()
            .filter(AnalysisColumn::Status.eq(AnalysisStatus::Running.as_str()))
            .filter(AnalysisColumn::LastHeartbeatAt.lt(cutoff))
            .order_by_asc(AnalysisColumn::LastHeartbeatAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Running jobs of any kind whose heartbeat is older than the hang threshold.
    pub async fn find_stale_jobs(&self, limit: u64) -> Result<Vec<JobModel>, LifecycleError> {
        let cutoff = cutoff_before(self.hang_threshold);
        Ok(Job::find()
            .filter(JobColumn::State.eq(JobState::Running.as_str()))
            .filter(JobColumn::LastHeartbeatAt.lt(cutoff))
            .order_by_asc(JobColumn::LastHeartbeatAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Completed analyses in creation order, one page at a time, for the consistency scan.
    pub async fn completed_analyses(
        &self,
        after: Option<(DateTime<FixedOffset>, Uuid)>,
        limit: u64,
    ) -> Result<Vec<AnalysisModel>, LifecycleError> {
        self.analyses_with_status(AnalysisStatus::Completed, after, limit)
            .await
    }

    pub async fn analyses_with_status(
        &self,
        status: AnalysisStatus,
        after: Option<(DateTime<FixedOffset>, Uuid)>,
        limit: u64,
    ) -> Result<Vec<AnalysisModel>, LifecycleError> {
        let mut query = AnalysisJob::find().filter(AnalysisColumn::Status.eq(status.as_str()));
        if let Some((created_at, job_id)) = after {
            query = query.filter(
                AnalysisColumn::CreatedAt.gt(created_at).or(AnalysisColumn::CreatedAt
                    .eq(created_at)
                    .and(AnalysisColumn::JobId.gt(job_id))),
            );
        }
        Ok(query
            .order_by_asc(AnalysisColumn::CreatedAt)
            .order_by_asc(AnalysisColumn::JobId)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Delete terminal jobs (and their analysis rows) completed before `now - retention`.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, retention: Duration, limit: u64) -> Result<u64, LifecycleError> {
        let cutoff = cutoff_before(retention);
        let expired: Vec<Uuid> = Job::find()
            .select_only()
            .column(JobColumn::Id)
            .filter(
                JobColumn::State
                    .is_in([JobState::Succeeded.as_str(), JobState::Failed.as_str()]),
            )
            .filter(JobColumn::CompletedAt.lt(cutoff))
            .order_by_asc(JobColumn::CompletedAt)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin().await?;
        AnalysisAggregate::delete_many()
            .filter(AggregateColumn::AnalysisJobId.is_in(expired.clone()))
            .exec(&txn)
            .await?;
        AnalysisUnit::delete_many()
            .filter(UnitColumn::AnalysisJobId.is_in(expired.clone()))
            .exec(&txn)
            .await?;
        AnalysisJob::delete_many()
            .filter(AnalysisColumn::JobId.is_in(expired.clone()))
            .exec(&txn)
            .await?;
        ConsistencyIssue::delete_many()
            .filter(IssueColumn::EntityId.is_in(expired.clone()))
            .filter(IssueColumn::Resolution.is_not_null())
            .exec(&txn)
            .await?;
        let deleted = Job::delete_many()
            .filter(JobColumn::Id.is_in(expired.clone()))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        for job_id in &expired {
            self.invalidate(*job_id).await;
        }
        debug!(deleted = deleted.rows_affected, "Purged expired jobs");
        Ok(deleted.rows_affected)
    }
}

/// Bump `last_heartbeat_at` on the running job and its analysis.
async fn touch<C: ConnectionTrait>(
    conn: &C,
    job_id: Uuid,
    ts: DateTime<FixedOffset>,
) -> Result<bool, DbErr> {
    let touched = Job::update_many()
        .col_expr(JobColumn::LastHeartbeatAt, Expr::value(ts))
        .col_expr(JobColumn::UpdatedAt, Expr::value(ts))
        .filter(JobColumn::Id.eq(job_id))
        .filter(JobColumn::State.eq(JobState::Running.as_str()))
        .exec(conn)
        .await?;
    AnalysisJob::update_many()
        .col_expr(AnalysisColumn::LastHeartbeatAt, Expr::value(ts))
        .col_expr(AnalysisColumn::UpdatedAt, Expr::value(ts))
        .filter(AnalysisColumn::JobId.eq(job_id))
        .filter(AnalysisColumn::Status.eq(AnalysisStatus::Running.as_str()))
        .exec(conn)
        .await?;
    Ok(touched.rows_affected == 1)
}

async fn load_units<C: ConnectionTrait>(conn: &C, job_id: Uuid) -> Result<Vec<UnitModel>, DbErr> {
    AnalysisUnit::find()
        .filter(UnitColumn::AnalysisJobId.eq(job_id))
        .order_by_asc(UnitColumn::Position)
        .all(conn)
        .await
}

/// Summary artifact built from unit results.
pub fn build_summary(target_entity_id: &str, units: &[analysis_unit::Model]) -> JsonValue {
    let results: BTreeMap<&str, &JsonValue> = units
        .iter()
        .filter(|unit| unit.is_succeeded())
        .filter_map(|unit| unit.result.as_ref().map(|result| (unit.unit_key.as_str(), result)))
        .collect();
    json!({
        "target_entity_id": target_entity_id,
        "units": results,
    })
}

/// Replace the aggregate for `analysis` with one recomputed from its succeeded units.
async fn write_aggregate<C: ConnectionTrait>(
    conn: &C,
    analysis: &AnalysisModel,
    units: &[UnitModel],
    ts: DateTime<FixedOffset>,
) -> Result<(), DbErr> {
    let succeeded = units.iter().filter(|unit| unit.is_succeeded()).count() as i32;
    let summary = build_summary(&analysis.target_entity_id, units);

    AnalysisAggregate::delete_by_id(analysis.job_id)
        .exec(conn)
        .await?;
    AggregateActiveModel {
        analysis_job_id: Set(analysis.job_id),
        unit_count: Set(succeeded),
        summary: Set(summary),
        computed_at: Set(ts),
    }
    .insert(conn)
    .await?;
    if succeeded as usize != units.len() {
        warn!(job_id = %analysis.job_id, "Aggregate written for a partially processed analysis");
    }
    Ok(())
}
