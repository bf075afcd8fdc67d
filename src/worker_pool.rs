//! # Worker Pool
//!
//! Fixed set of workers pulling from the [`JobQueue`]. For each job a worker:
//!
//! 1. takes an execution slot from the [`DispatchGate`], dequeues, then waits
//!    for the next dispatch token;
//! 2. asks the dependency's circuit breaker for a permit and defers the job,
//!    without spending an attempt, while the breaker sheds load;
//! 3. claims the persisted job (queued to running) and runs its handler under
//!    the job timeout, with a background heartbeat;
//! 4. settles the outcome: success commits the credit reservation, transient
//!    failures retry with exponential backoff until the attempt budget is
//!    spent, and everything terminal refunds and releases the payload identity.
//!
//! Shutdown stops dequeuing, lets in-flight jobs drain for the configured
//! window, then aborts what is left and marks those jobs failed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakers;
use crate::config::EngineConfig;
use crate::credit_gate::CreditGate;
use crate::lifecycle::JobLifecycleTracker;
use crate::models::JobState;
use crate::models::job::Model as JobModel;
use crate::queue::{JobQueue, QueuedJob};
use crate::rate_limiter::DispatchGate;
use crate::tasks::{JobContext, JobPayload, TaskError, TaskErrorKind, TaskRegistry};

/// Backoff before attempt `attempts_completed + 1`: `base * 2^(attempts_completed - 1)`, capped,
/// plus up to `jitter_factor` of random extra.
pub fn retry_backoff(config: &EngineConfig, attempts_completed: i32) -> Duration {
    let base = config.retry_base_delay_s as f64;
    let max = config.retry_max_delay_s as f64;
    let exponent = attempts_completed.saturating_sub(1).clamp(0, 30);
    let backoff = (base * 2_f64.powi(exponent)).min(max);

    let jitter_span = config.retry_jitter_factor * backoff;
    let jitter = if jitter_span > 0.0 {
        thread_rng().gen_range(0.0..jitter_span)
    } else {
        0.0
    };
    Duration::from_secs_f64(backoff + jitter)
}

pub const CANCELLED_BY_CALLER: &str = "cancelled: requested by caller";
pub const CANCELLED_BY_SHUTDOWN: &str = "cancelled: shutdown";

enum Outcome {
    Finished(Result<(), TaskError>),
    TimedOut,
    Aborted,
}

pub struct WorkerPool {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    gate: Arc<DispatchGate>,
    breakers: Arc<CircuitBreakers>,
    registry: Arc<TaskRegistry>,
    lifecycle: Arc<JobLifecycleTracker>,
    credits: CreditGate,
    /// Cooperative cancellation handles of jobs currently executing.
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Fired when the drain window closes; aborts whatever still runs.
    abort: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: EngineConfig,
        queue: Arc<JobQueue>,
        breakers: Arc<CircuitBreakers>,
        registry: Arc<TaskRegistry>,
        lifecycle: Arc<JobLifecycleTracker>,
        credits: CreditGate,
    ) -> Self {
        let gate = Arc::new(DispatchGate::new(
            config.rate_limit_interval(),
            config.max_concurrent_jobs,
        ));
        Self {
            config,
            queue,
            gate,
            breakers,
            registry,
            lifecycle,
            credits,
            running: Mutex::new(HashMap::new()),
            abort: CancellationToken::new(),
        }
    }

    /// Spawn the workers. They stop taking new jobs once `shutdown` fires; call
    /// [`WorkerPool::drain`] with the returned set to wait for in-flight jobs.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinSet<()> {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.worker_count.max(1) {
            let pool = Arc::clone(self);
            let shutdown = shutdown.clone();
            workers.spawn(
                async move { pool.run_worker(shutdown).await }
                    .instrument(info_span!("worker", worker_id)),
            );
        }
        info!(
            workers = self.config.worker_count,
            max_in_flight = self.gate.max_in_flight(),
            "Worker pool started"
        );
        workers
    }

    /// Close the queue, give in-flight jobs the drain window, then abort the rest. Aborted jobs
    /// are marked failed with a cancellation reason and refunded.
    pub async fn drain(&self, mut workers: JoinSet<()>) {
        self.queue.close().await;
        let window = self.config.shutdown_drain_timeout();
        let drained = timeout(window, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = self.in_flight(),
                "Drain window elapsed; cancelling remaining jobs"
            );
            self.abort.cancel();
            while workers.join_next().await.is_some() {}
        }
        self.gate.close();
        info!("Worker pool stopped");
    }

    pub fn in_flight(&self) -> usize {
        self.running
            .lock()
            .map(|running| running.len())
            .unwrap_or_default()
    }

    /// Ask a running job to stop at its next sub-unit boundary. Returns false when the job is not
    /// executing on this pool.
    pub fn cancel_running(&self, job_id: Uuid) -> bool {
        let token = self
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(&job_id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_worker(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let slot = tokio::select! {
                _ = shutdown.cancelled() => break,
                slot = self.gate.reserve_slot() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let Some(job) = self.queue.dequeue(&shutdown).await else {
                break;
            };

            tokio::select! {
                // The job stays `queued` in the database and is recovered on the next start.
                _ = shutdown.cancelled() => break,
                _ = self.gate.pace() => {}
            }

            self.dispatch(job).await;
            drop(slot);
        }
        debug!("Worker exiting");
    }

    async fn dispatch(&self, job: QueuedJob) {
        let job_id = job.job_id;
        let record = match self.lifecycle.find_job(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(job_id = %job_id, "Dequeued job no longer exists");
                self.queue.release(job_id, &job.dedup_key).await;
                return;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "Failed to load dequeued job; deferring");
                self.requeue_deferred(job).await;
                return;
            }
        };

        match record.job_state() {
            Some(JobState::Queued) => {}
            Some(state) => {
                // Cancelled or failed elsewhere while waiting in the queue.
                debug!(job_id = %job_id, state = %state, "Skipping job that is no longer queued");
                if state.is_terminal() {
                    self.queue.release(job_id, &job.dedup_key).await;
                }
                return;
            }
            None => {
                self.fail_terminal(&record, &job, "unknown persisted job state")
                    .await;
                return;
            }
        }

        if record.attempt_count >= record.max_attempts {
            self.fail_terminal(&record, &job, "retry budget exhausted")
                .await;
            return;
        }

        let payload: JobPayload = match serde_json::from_value(record.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                self.fail_terminal(&record, &job, &format!("malformed payload: {err}"))
                    .await;
                return;
            }
        };

        let handler = match self.registry.get(payload.kind()) {
            Ok(handler) => handler,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "No handler for job kind");
                self.fail_terminal(&record, &job, &err.to_string()).await;
                return;
            }
        };

        let breaker = self.breakers.get(handler.dependency());
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                counter!("engine_jobs_deferred_total", "dependency" => handler.dependency())
                    .increment(1);
                debug!(job_id = %job_id, error = %open, "Breaker open; deferring job");
                self.requeue_deferred(job).await;
                return;
            }
        };

        let claimed = match self.lifecycle.claim_job(job_id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(job_id = %job_id, "Job was claimed or settled elsewhere");
                return;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "Failed to claim job; deferring");
                drop(permit);
                self.requeue_deferred(job).await;
                return;
            }
        };

        let span = info_span!(
            "job",
            job_id = %job_id,
            kind = %payload.kind(),
            attempt = claimed.attempt_count,
            dependency = handler.dependency()
        );

        async {
            let started = Instant::now();
            let cancel = self.abort.child_token();
            if let Ok(mut running) = self.running.lock() {
                running.insert(job_id, cancel.clone());
            }
            let _registration = scopeguard::guard((), |_| {
                if let Ok(mut running) = self.running.lock() {
                    running.remove(&job_id);
                }
            });

            let heartbeat_stop = CancellationToken::new();
            let heartbeat = tokio::spawn(heartbeat_loop(
                Arc::clone(&self.lifecycle),
                job_id,
                heartbeat_interval(self.lifecycle.hang_threshold()),
                heartbeat_stop.clone(),
            ));

            let ctx = JobContext::new(
                job_id,
                claimed.owner_id,
                claimed.attempt_count,
                payload,
                cancel.clone(),
                Arc::clone(&self.lifecycle),
            );

            let outcome = tokio::select! {
                result = timeout(self.config.job_timeout(), handler.execute(&ctx)) => match result {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) => Outcome::TimedOut,
                },
                _ = self.abort.cancelled() => Outcome::Aborted,
            };

            heartbeat_stop.cancel();
            let _ = heartbeat.await;
            histogram!("engine_job_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

            match outcome {
                Outcome::Finished(Ok(())) => {
                    permit.success();
                    self.succeed(&claimed, &job).await;
                }
                Outcome::Finished(Err(err)) => match err.kind {
                    TaskErrorKind::Transient => {
                        permit.failure();
                        self.retry_or_fail(&claimed, job, &err).await;
                    }
                    TaskErrorKind::Internal => {
                        // Not the dependency's fault; leave the breaker as it was.
                        drop(permit);
                        warn!(error = %err, "Job hit a storage error");
                        self.retry_or_fail(&claimed, job, &err).await;
                    }
                    TaskErrorKind::Permanent => {
                        // The dependency answered; the input was bad.
                        permit.success();
                        warn!(error = %err, "Job failed permanently");
                        self.fail_terminal(&claimed, &job, &err.message).await;
                    }
                    TaskErrorKind::Cancelled => {
                        drop(permit);
                        let reason = if self.abort.is_cancelled() {
                            CANCELLED_BY_SHUTDOWN.to_string()
                        } else if cancel.is_cancelled() {
                            CANCELLED_BY_CALLER.to_string()
                        } else {
                            format!("cancelled: {}", err.message)
                        };
                        info!(reason = %reason, "Job cancelled");
                        self.fail_terminal(&claimed, &job, &reason).await;
                    }
                },
                Outcome::TimedOut => {
                    permit.failure();
                    cancel.cancel();
                    let reason = format!(
                        "timed out after {}s",
                        self.config.job_timeout().as_secs()
                    );
                    warn!(reason = %reason, "Job timed out");
                    self.fail_terminal(&claimed, &job, &reason).await;
                }
                Outcome::Aborted => {
                    drop(permit);
                    self.fail_terminal(&claimed, &job, CANCELLED_BY_SHUTDOWN).await;
                }
            }
        }
        .instrument(span)
        .await;
    }

    async fn succeed(&self, record: &JobModel, job: &QueuedJob) {
        match self.lifecycle.mark_job_succeeded(record.id).await {
            Ok(true) => {
                counter!("engine_jobs_succeeded_total", "kind" => record.kind.clone()).increment(1);
                info!("Job succeeded");
            }
            Ok(false) => {
                // Forced to failed while running (hang sweep or cancel).
                warn!("Job finished after it was already settled; result discarded");
            }
            Err(err) => error!(error = %err, "Failed to record job success"),
        }
        self.settle_reservation(record, "job failed").await;
        self.queue.release(record.id, &job.dedup_key).await;
    }

    async fn retry_or_fail(&self, record: &JobModel, job: QueuedJob, err: &TaskError) {
        if record.attempt_count >= record.max_attempts {
            let reason = format!(
                "{} (gave up after {} attempts)",
                err.message, record.attempt_count
            );
            self.fail_terminal(record, &job, &reason).await;
            return;
        }

        let backoff = retry_backoff(&self.config, record.attempt_count);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
        match self
            .lifecycle
            .schedule_retry(record.id, &err.message, retry_at)
            .await
        {
            Ok(true) => {
                counter!("engine_jobs_retried_total", "kind" => record.kind.clone()).increment(1);
                info!(
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transient failure; retry scheduled"
                );
                if let Err(err) = self.queue.retry_after(job, backoff).await {
                    debug!(error = %err, "Queue closed; retry stays persisted for recovery");
                }
            }
            Ok(false) => {
                debug!("Job left running state before retry could be scheduled");
                self.queue.release(record.id, &job.dedup_key).await;
            }
            Err(db_err) => {
                error!(error = %db_err, "Failed to schedule retry; failing job");
                self.fail_terminal(record, &job, &err.message).await;
            }
        }
    }

    async fn fail_terminal(&self, record: &JobModel, job: &QueuedJob, reason: &str) {
        match self.lifecycle.mark_job_failed(record.id, reason).await {
            Ok(true) => {
                counter!("engine_jobs_failed_total", "kind" => record.kind.clone()).increment(1);
            }
            Ok(false) => debug!(job_id = %record.id, "Job already settled"),
            Err(err) => error!(job_id = %record.id, error = %err, "Failed to mark job failed"),
        }
        self.settle_reservation(record, reason).await;
        self.queue.release(record.id, &job.dedup_key).await;
    }

    /// Commit or refund by what the job row says now, not by what this worker saw: a timeout
    /// can fire after the handler already completed the job.
    async fn settle_reservation(&self, record: &JobModel, reason: &str) {
        let Some(reservation_id) = record.reservation_id else {
            return;
        };
        match self
            .credits
            .settle_for_job(reservation_id, record.id, reason)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(
                reservation_id = %reservation_id,
                "Job still active; reservation left for the hang or TTL sweep"
            ),
            Err(err) => error!(
                reservation_id = %reservation_id,
                error = %err,
                "Failed to settle reservation; TTL sweep will settle it"
            ),
        }
    }

    async fn requeue_deferred(&self, job: QueuedJob) {
        if let Err(err) = self.queue.defer(job, self.config.breaker_defer()).await {
            debug!(error = %err, "Queue closed; deferred job stays persisted for recovery");
        }
    }
}

fn heartbeat_interval(hang_threshold: Duration) -> Duration {
    (hang_threshold / 4).max(Duration::from_secs(1))
}

async fn heartbeat_loop(
    lifecycle: Arc<JobLifecycleTracker>,
    job_id: Uuid,
    every: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(every) => {
                if let Err(err) = lifecycle.heartbeat(job_id).await {
                    warn!(job_id = %job_id, error = %err, "Heartbeat write failed");
                }
            }
        }
    }
}
