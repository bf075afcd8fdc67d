//! # Job Engine
//!
//! Wires the components together and exposes the caller-facing operations:
//! submission, status polling, cancellation, consistency scan and repair, and
//! the credit account calls.
//!
//! Background work runs entirely inside the engine's own tasks with their own
//! database handles. Callers only ever see persisted state, so a caller that
//! disconnects never affects a job it submitted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sea_orm::{DatabaseConnection, DbErr};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakers};
use crate::config::AppConfig;
use crate::consistency::{ConsistencyValidator, RepairReport, RepairTarget, ScanReport};
use crate::credit_gate::{CreditError, CreditGate};
use crate::error::is_unique_violation;
use crate::lifecycle::{JobLifecycleTracker, JobStatusView, LifecycleError, NewJob};
use crate::models::consistency_issue::Model as IssueModel;
use crate::models::credit_balance::Model as BalanceModel;
use crate::models::credit_reservation::Model as ReservationModel;
use crate::models::job::Model as JobModel;
use crate::models::{JobState, Priority};
use crate::queue::{EnqueueOutcome, JobQueue, QueueError, QueuedJob};
use crate::repositories::{ConsistencyIssueRepository, JobListFilter, JobRepository};
use crate::tasks::{JobPayload, TaskRegistry};
use crate::worker_pool::{CANCELLED_BY_CALLER, WorkerPool};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Credit(#[from] CreditError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// `submit(payload, priority, cost)` on behalf of `owner_id`.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub owner_id: Uuid,
    pub payload: JobPayload,
    pub priority: Priority,
    /// Credits held while the job runs; 0 submits without a reservation
    pub cost: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubmitOutcome {
    pub job_id: Uuid,
    /// True when an active job with the same payload already existed and its id is returned
    pub deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Was queued; now failed and refunded
    Cancelled,
    /// Is running; will stop at the next sub-unit boundary
    Signalled,
    /// Had already reached this state
    AlreadyFinished { state: JobState },
}

/// Persists, reserves and enqueues new jobs. Shared by the public API and the repair path.
pub struct JobSubmitter {
    lifecycle: Arc<JobLifecycleTracker>,
    credits: CreditGate,
    queue: Arc<JobQueue>,
    jobs: JobRepository,
    max_attempts: i32,
}

impl JobSubmitter {
    pub fn new(
        lifecycle: Arc<JobLifecycleTracker>,
        credits: CreditGate,
        queue: Arc<JobQueue>,
        jobs: JobRepository,
        max_attempts: u32,
    ) -> Self {
        Self {
            lifecycle,
            credits,
            queue,
            jobs,
            max_attempts: i32::try_from(max_attempts).unwrap_or(i32::MAX).max(1),
        }
    }

    /// Validate, deduplicate, reserve credits, persist and enqueue. A payload identical to an
    /// active job of the same owner returns that job without reserving anything.
    #[instrument(
        skip(self, request),
        fields(owner_id = %request.owner_id, kind = %request.payload.kind(), cost = request.cost)
    )]
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, EngineError> {
        let mut problems = request.payload.validate();
        if request.cost < 0 {
            problems.push(format!("cost must not be negative, got {}", request.cost));
        }
        if !problems.is_empty() {
            return Err(EngineError::Validation(problems.join("; ")));
        }

        let dedup_key = request.payload.dedup_key(request.owner_id);
        if let Some(existing) = self.jobs.find_active_by_dedup_key(&dedup_key).await? {
            return Ok(deduplicated(&existing));
        }

        let job_id = Uuid::new_v4();
        let reservation_id = if request.cost > 0 {
            let reservation = self
                .credits
                .reserve(request.owner_id, job_id, request.cost)
                .await?;
            Some(reservation.id)
        } else {
            None
        };

        let created = self
            .lifecycle
            .create_job(NewJob {
                job_id,
                owner_id: request.owner_id,
                payload: request.payload,
                dedup_key: dedup_key.clone(),
                priority: request.priority,
                cost: request.cost,
                max_attempts: self.max_attempts,
                reservation_id,
            })
            .await;

        let job = match created {
            Ok(job) => job,
            Err(err) => {
                if let Some(reservation_id) = reservation_id {
                    if let Err(refund_err) = self
                        .credits
                        .refund(reservation_id, "job could not be created")
                        .await
                    {
                        error!(error = %refund_err, "Failed to refund reservation of unsaved job");
                    }
                }
                // Lost a race against an identical submission.
                if let LifecycleError::Database(db_err) = &err {
                    if is_unique_violation(db_err) {
                        if let Some(existing) =
                            self.jobs.find_active_by_dedup_key(&dedup_key).await?
                        {
                            return Ok(deduplicated(&existing));
                        }
                    }
                }
                return Err(err.into());
            }
        };

        let queued = QueuedJob {
            job_id,
            priority: request.priority,
            dedup_key,
            enqueued_at: job.enqueued_at.with_timezone(&Utc),
        };
        let enqueued = match self.queue.enqueue(queued.clone()).await {
            // Storage says the identity is free, so the in-process holder is stale.
            Ok(EnqueueOutcome::Duplicate) => self.queue.reclaim(queued).await,
            Ok(EnqueueOutcome::Accepted) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = enqueued {
            warn!(job_id = %job_id, error = %err, "Job persisted but not enqueued; dispatched after restart");
        }

        counter!("engine_jobs_submitted_total", "kind" => job.kind.clone()).increment(1);
        info!(job_id = %job_id, priority = ?request.priority, "Job submitted");
        Ok(SubmitOutcome {
            job_id,
            deduplicated: false,
            reservation_id,
        })
    }
}

fn deduplicated(existing: &JobModel) -> SubmitOutcome {
    counter!("engine_jobs_deduplicated_total").increment(1);
    debug!(job_id = %existing.id, "Duplicate submission; returning active job");
    SubmitOutcome {
        job_id: existing.id,
        deduplicated: true,
        reservation_id: existing.reservation_id,
    }
}

struct Background {
    workers: JoinSet<()>,
    validator: JoinHandle<()>,
    adopter: JoinHandle<()>,
}

/// Enqueue persisted `queued` jobs whose identity the in-process queue does not hold: all of
/// them after a restart, afterwards the ones submitted through another process.
async fn adopt_queued(
    lifecycle: &JobLifecycleTracker,
    queue: &JobQueue,
) -> Result<usize, EngineError> {
    let now = Utc::now();
    let mut adopted = 0;

    for job in lifecycle.queued_jobs().await? {
        if queue.is_held(&job.dedup_key).await {
            continue;
        }
        let entry = QueuedJob {
            job_id: job.id,
            priority: job.job_priority(),
            dedup_key: job.dedup_key.clone(),
            enqueued_at: job.enqueued_at.with_timezone(&Utc),
        };
        let waiting = job
            .retry_after
            .and_then(|retry_after| (retry_after.with_timezone(&Utc) - now).to_std().ok())
            .filter(|wait| !wait.is_zero());
        match waiting {
            Some(wait) => queue.retry_after(entry, wait).await?,
            None => {
                queue.enqueue(entry).await?;
            }
        }
        adopted += 1;
    }
    Ok(adopted)
}

async fn adopt_loop(
    lifecycle: Arc<JobLifecycleTracker>,
    queue: Arc<JobQueue>,
    every: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(every) => {
                match adopt_queued(&lifecycle, &queue).await {
                    Ok(0) => {}
                    Ok(adopted) => info!(adopted, "Adopted queued jobs from storage"),
                    Err(EngineError::Queue(QueueError::Closed)) => break,
                    Err(err) => warn!(error = %err, "Failed to adopt queued jobs"),
                }
            }
        }
    }
}

pub struct JobEngine {
    lifecycle: Arc<JobLifecycleTracker>,
    credits: CreditGate,
    queue: Arc<JobQueue>,
    breakers: Arc<CircuitBreakers>,
    pool: Arc<WorkerPool>,
    submitter: Arc<JobSubmitter>,
    validator: Arc<ConsistencyValidator>,
    jobs: JobRepository,
    issues: ConsistencyIssueRepository,
    adopt_interval: Duration,
    shutdown: CancellationToken,
    background: Mutex<Option<Background>>,
}

impl JobEngine {
    pub fn new(config: &AppConfig, db: DatabaseConnection, registry: TaskRegistry) -> Self {
        let lifecycle = Arc::new(JobLifecycleTracker::new(db.clone(), &config.lifecycle));
        let credits = CreditGate::new(db.clone());
        let queue = Arc::new(JobQueue::new());
        let breakers = Arc::new(CircuitBreakers::new(
            config.engine.circuit_failure_threshold,
            config.engine.circuit_recovery_timeout(),
        ));
        let jobs = JobRepository::new(db.clone());
        let issues = ConsistencyIssueRepository::new(db);

        let submitter = Arc::new(JobSubmitter::new(
            Arc::clone(&lifecycle),
            credits.clone(),
            Arc::clone(&queue),
            jobs.clone(),
            config.engine.retry_attempts,
        ));
        let pool = Arc::new(WorkerPool::new(
            config.engine.clone(),
            Arc::clone(&queue),
            Arc::clone(&breakers),
            Arc::new(registry),
            Arc::clone(&lifecycle),
            credits.clone(),
        ));
        let validator = Arc::new(ConsistencyValidator::new(
            &config.consistency,
            &config.lifecycle,
            Arc::clone(&lifecycle),
            credits.clone(),
            issues.clone(),
            Arc::clone(&submitter),
        ));

        Self {
            lifecycle,
            credits,
            queue,
            breakers,
            pool,
            submitter,
            validator,
            jobs,
            issues,
            adopt_interval: config.consistency.scan_interval(),
            shutdown: CancellationToken::new(),
            background: Mutex::new(None),
        }
    }

    /// Re-enqueue persisted work, then start the worker pool, the periodic validator and the
    /// adoption of jobs persisted by other processes.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Err(EngineError::Conflict("engine already started".to_string()));
        }

        let recovered = adopt_queued(&self.lifecycle, &self.queue).await?;
        let workers = self.pool.start(self.shutdown.clone());
        let validator = tokio::spawn(Arc::clone(&self.validator).run(self.shutdown.clone()));
        let adopter = tokio::spawn(adopt_loop(
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.queue),
            self.adopt_interval,
            self.shutdown.clone(),
        ));
        *background = Some(Background {
            workers,
            validator,
            adopter,
        });

        info!(recovered, "Job engine started");
        Ok(())
    }

    /// Stop taking work, drain in-flight jobs (aborting them once the drain window closes) and
    /// stop the background tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let Some(background) = self.background.lock().await.take() else {
            return;
        };
        self.pool.drain(background.workers).await;
        for (task, handle) in [
            ("consistency validator", background.validator),
            ("queue adopter", background.adopter),
        ] {
            if let Err(err) = handle.await {
                error!(task, error = %err, "Background task panicked");
            }
        }
        info!("Job engine stopped");
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, EngineError> {
        self.submitter.submit(request).await
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusView, EngineError> {
        Ok(self.lifecycle.job_status(job_id).await?)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<JobModel, EngineError> {
        Ok(self.lifecycle.get_job(job_id).await?)
    }

    pub async fn list_jobs(&self, filter: &JobListFilter) -> Result<Vec<JobModel>, EngineError> {
        Ok(self.jobs.list(filter).await?)
    }

    /// Persisted jobs per state.
    pub async fn job_counts(&self) -> Result<BTreeMap<String, i64>, EngineError> {
        Ok(self.jobs.count_by_state().await?)
    }

    /// Cancel a job. Queued jobs are withdrawn, failed and refunded at once; running jobs are
    /// signalled and settle when they reach the next sub-unit boundary.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, EngineError> {
        let job = self.lifecycle.get_job(job_id).await?;
        let Some(state) = job.job_state() else {
            return Err(EngineError::Conflict(format!(
                "job {job_id} has unknown state '{}'",
                job.state
            )));
        };

        match state {
            JobState::Queued => {
                self.queue.remove(job_id).await;
                if self.fail_and_refund(&job).await? {
                    self.queue.release(job_id, &job.dedup_key).await;
                    info!("Queued job cancelled");
                    return Ok(CancelOutcome::Cancelled);
                }
                // Claimed by a worker in the meantime.
                let current = self.lifecycle.get_job(job_id).await?;
                match current.job_state() {
                    Some(JobState::Running) => self.signal_running(&current).await,
                    Some(state) => Ok(CancelOutcome::AlreadyFinished { state }),
                    None => Err(EngineError::Conflict(format!(
                        "job {job_id} has unknown state '{}'",
                        current.state
                    ))),
                }
            }
            JobState::Running => self.signal_running(&job).await,
            state => Ok(CancelOutcome::AlreadyFinished { state }),
        }
    }

    async fn signal_running(&self, job: &JobModel) -> Result<CancelOutcome, EngineError> {
        if self.pool.cancel_running(job.id) {
            info!(job_id = %job.id, "Running job signalled to stop");
            return Ok(CancelOutcome::Signalled);
        }
        // Not executing in this process: settle it here, its worker stops on the next heartbeat.
        self.fail_and_refund(job).await?;
        Ok(CancelOutcome::Cancelled)
    }

    async fn fail_and_refund(&self, job: &JobModel) -> Result<bool, EngineError> {
        let failed = self
            .lifecycle
            .mark_job_failed(job.id, CANCELLED_BY_CALLER)
            .await?;
        if failed {
            if let Some(reservation_id) = job.reservation_id {
                self.credits.refund(reservation_id, CANCELLED_BY_CALLER).await?;
            }
        }
        Ok(failed)
    }

    pub async fn scan(&self) -> Result<ScanReport, EngineError> {
        self.validator.scan().await
    }

    pub async fn repair(&self, target: RepairTarget) -> Result<RepairReport, EngineError> {
        self.validator.repair(target).await
    }

    pub async fn list_issues(
        &self,
        open_only: bool,
        limit: u64,
    ) -> Result<Vec<IssueModel>, EngineError> {
        Ok(self.issues.list(open_only, limit).await?)
    }

    pub async fn deposit(&self, owner_id: Uuid, amount: i64) -> Result<BalanceModel, EngineError> {
        Ok(self.credits.deposit(owner_id, amount).await?)
    }

    pub async fn balance(&self, owner_id: Uuid) -> Result<BalanceModel, EngineError> {
        Ok(self.credits.balance(owner_id).await?)
    }

    pub async fn reservation(&self, reservation_id: Uuid) -> Result<ReservationModel, EngineError> {
        Ok(self.credits.get_reservation(reservation_id).await?)
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycleTracker> {
        &self.lifecycle
    }

    pub fn credits(&self) -> &CreditGate {
        &self.credits
    }
}
