//! # Priority Job Queue
//!
//! In-process dispatch queue. Ready jobs are ordered by priority class and then
//! by enqueue sequence (FIFO within a class). Deferred and retried jobs wait in
//! a separate delay heap until they are due.
//!
//! Duplicate suppression is keyed by payload identity: a key stays held from
//! the first enqueue until the owning job reaches a terminal state and the key
//! is released, so re-enqueues for deferral or retry bypass the check.
//!
//! The queue only orders job ids. The persisted `jobs` row stays the source of
//! truth for state, and the database unique index backs dedup across processes.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::models::Priority;

/// Idle workers re-check the queue at least this often.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
}

/// Dispatch handle for one persisted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub priority: Priority,
    pub dedup_key: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// A job with the same payload identity is already queued or running.
    Duplicate,
}

#[derive(Debug)]
struct ReadyEntry {
    seq: u64,
    job: QueuedJob,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    // Max-heap: higher priority first, then the lower (older) sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct DelayedEntry {
    due: Instant,
    entry: ReadyEntry,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.entry.seq == other.entry.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    /// Payload identity to the queued or running job holding it.
    held_keys: HashMap<String, Uuid>,
    /// Sequence originally assigned to each job, reused when a deferred job returns.
    sequences: HashMap<Uuid, u64>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.due > now {
                break;
            }
            if let Some(Reverse(due)) = self.delayed.pop() {
                self.ready.push(due.entry);
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Insert a new job unless its payload identity is already held.
    pub async fn enqueue(&self, job: QueuedJob) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.held_keys.contains_key(&job.dedup_key) {
            debug!(job_id = %job.job_id, dedup_key = %job.dedup_key, "Dropped duplicate enqueue");
            return Ok(EnqueueOutcome::Duplicate);
        }
        state.held_keys.insert(job.dedup_key.clone(), job.job_id);

        let seq = state.next_seq();
        state.sequences.insert(job.job_id, seq);
        state.ready.push(ReadyEntry { seq, job });
        gauge!("engine_queue_depth").set(state.depth() as f64);
        drop(state);

        self.notify.notify_one();
        Ok(EnqueueOutcome::Accepted)
    }

    /// Enqueue a job whose identity storage has already confirmed as free, taking the key over
    /// from a stale in-process holder (a job failed by the hang sweep while its worker was stuck).
    pub async fn reclaim(&self, job: QueuedJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.held_keys.get(&job.dedup_key) {
            debug!(job_id = %job.job_id, previous = %previous, "Taking over payload identity");
        }
        let seq = state.next_seq();
        state.sequences.insert(job.job_id, seq);
        self.schedule(&mut state, job, seq, Duration::ZERO)
    }

    /// Put a job back after `delay` keeping its original place within its priority class.
    /// Used when the job was never attempted (breaker open).
    pub async fn defer(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let original = state.sequences.get(&job.job_id).copied();
        let seq = match original {
            Some(seq) => seq,
            None => state.next_seq(),
        };
        self.schedule(&mut state, job, seq, delay)
    }

    /// Re-enqueue a failed attempt after its backoff. A retry joins the back of its class.
    pub async fn retry_after(&self, job: QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        state.sequences.insert(job.job_id, seq);
        self.schedule(&mut state, job, seq, delay)
    }

    fn schedule(
        &self,
        state: &mut QueueState,
        job: QueuedJob,
        seq: u64,
        delay: Duration,
    ) -> Result<(), QueueError> {
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.held_keys.insert(job.dedup_key.clone(), job.job_id);
        let entry = ReadyEntry { seq, job };
        if delay.is_zero() {
            state.ready.push(entry);
        } else {
            state.delayed.push(Reverse(DelayedEntry {
                due: Instant::now() + delay,
                entry,
            }));
        }
        gauge!("engine_queue_depth").set(state.depth() as f64);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the highest-priority due job. Returns `None` once the queue is closed or
    /// `shutdown` fires.
    pub async fn dequeue(&self, shutdown: &CancellationToken) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                state.promote_due(now);
                if let Some(entry) = state.ready.pop() {
                    gauge!("engine_queue_depth").set(state.depth() as f64);
                    return Some(entry.job);
                }
                let idle_deadline = now + MAX_IDLE_WAIT;
                state
                    .delayed
                    .peek()
                    .map(|Reverse(head)| head.due.min(idle_deadline))
                    .unwrap_or(idle_deadline)
            };

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    /// Drop the payload identity of a job that reached a terminal state. A key taken over by a
    /// newer job stays held.
    pub async fn release(&self, job_id: Uuid, dedup_key: &str) {
        let mut state = self.state.lock().await;
        if state.held_keys.get(dedup_key) == Some(&job_id) {
            state.held_keys.remove(dedup_key);
        }
        state.sequences.remove(&job_id);
    }

    /// Withdraw a job that has not been dispatched yet. Returns whether it was found.
    pub async fn remove(&self, job_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let before = state.depth();
        state.ready.retain(|entry| entry.job.job_id != job_id);
        state
            .delayed
            .retain(|Reverse(delayed)| delayed.entry.job.job_id != job_id);
        let removed = state.depth() < before;
        gauge!("engine_queue_depth").set(state.depth() as f64);
        removed
    }

    /// Whether a queued or running job holds this payload identity.
    pub async fn is_held(&self, dedup_key: &str) -> bool {
        self.state.lock().await.held_keys.contains_key(dedup_key)
    }

    pub async fn contains(&self, job_id: Uuid) -> bool {
        let state = self.state.lock().await;
        state.ready.iter().any(|entry| entry.job.job_id == job_id)
            || state
                .delayed
                .iter()
                .any(|Reverse(delayed)| delayed.entry.job.job_id == job_id)
    }

    /// Stop accepting work and wake every waiting worker. Jobs still queued are left in place
    /// (and persisted as `queued`) for the next start.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Number of jobs waiting, ready or delayed.
    pub async fn len(&self) -> usize {
        self.state.lock().await.depth()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn job(priority: Priority, key: &str) -> QueuedJob {
        QueuedJob {
            job_id: Uuid::new_v4(),
            priority,
            dedup_key: key.to_string(),
            enqueued_at: Utc::now(),
        }
    }

    async fn drain(queue: &JobQueue) -> Vec<String> {
        let token = CancellationToken::new();
        let mut keys = Vec::new();
        while !queue.is_empty().await {
            let next = queue.dequeue(&token).await.unwrap();
            keys.push(next.dedup_key);
        }
        keys
    }

    #[tokio::test]
    async fn strict_priority_then_fifo() {
        let queue = JobQueue::new();
        for (priority, key) in [
            (Priority::Low, "low-1"),
            (Priority::High, "high-1"),
            (Priority::Medium, "medium-1"),
            (Priority::High, "high-2"),
            (Priority::Critical, "critical-1"),
            (Priority::Low, "low-2"),
        ] {
            queue.enqueue(job(priority, key)).await.unwrap();
        }

        assert_eq!(
            drain(&queue).await,
            vec!["critical-1", "high-1", "high-2", "medium-1", "low-1", "low-2"]
        );
    }

    #[tokio::test]
    async fn duplicate_payload_is_dropped_until_released() {
        let queue = JobQueue::new();
        let first = job(Priority::Medium, "same");
        assert_eq!(
            queue.enqueue(first.clone()).await.unwrap(),
            EnqueueOutcome::Accepted
        );
        assert_eq!(
            queue.enqueue(job(Priority::High, "same")).await.unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(queue.len().await, 1);

        let token = CancellationToken::new();
        let running = queue.dequeue(&token).await.unwrap();
        // Still held while running.
        assert_eq!(
            queue.enqueue(job(Priority::Low, "same")).await.unwrap(),
            EnqueueOutcome::Duplicate
        );

        queue.release(running.job_id, &running.dedup_key).await;
        assert_eq!(
            queue.enqueue(job(Priority::Low, "same")).await.unwrap(),
            EnqueueOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn reclaimed_key_survives_release_by_stale_holder() {
        let queue = JobQueue::new();
        let token = CancellationToken::new();
        let stale = job(Priority::Medium, "same");
        queue.enqueue(stale.clone()).await.unwrap();
        let stale = queue.dequeue(&token).await.unwrap();

        let fresh = job(Priority::Medium, "same");
        queue.reclaim(fresh.clone()).await.unwrap();
        queue.release(stale.job_id, &stale.dedup_key).await;

        assert_eq!(
            queue.enqueue(job(Priority::Low, "same")).await.unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(queue.dequeue(&token).await.unwrap().job_id, fresh.job_id);
    }

    #[tokio::test]
    async fn deferred_job_keeps_its_place_but_retry_goes_to_the_back() {
        let queue = JobQueue::new();
        let token = CancellationToken::new();
        let a = job(Priority::Medium, "a");
        queue.enqueue(a.clone()).await.unwrap();
        queue.enqueue(job(Priority::Medium, "b")).await.unwrap();

        let taken = queue.dequeue(&token).await.unwrap();
        assert_eq!(taken.dedup_key, "a");
        queue.defer(taken, Duration::ZERO).await.unwrap();
        assert_eq!(queue.dequeue(&token).await.unwrap().dedup_key, "a");

        let taken = queue.dequeue(&token).await.unwrap();
        assert_eq!(taken.dedup_key, "b");
        queue.enqueue(job(Priority::Medium, "c")).await.unwrap();
        queue.retry_after(taken, Duration::ZERO).await.unwrap();
        assert_eq!(drain(&queue).await, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn delayed_job_is_not_dispatched_before_due() {
        let queue = JobQueue::new();
        let token = CancellationToken::new();
        queue
            .retry_after(job(Priority::Critical, "later"), Duration::from_millis(80))
            .await
            .unwrap();
        queue.enqueue(job(Priority::Low, "now")).await.unwrap();

        assert_eq!(queue.dequeue(&token).await.unwrap().dedup_key, "now");
        assert!(
            timeout(Duration::from_millis(20), queue.dequeue(&token))
                .await
                .is_err()
        );
        let later = timeout(Duration::from_millis(500), queue.dequeue(&token))
            .await
            .expect("delayed job becomes due")
            .unwrap();
        assert_eq!(later.dedup_key, "later");
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let token = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(job(Priority::Low, "wake")).await.unwrap();

        let got = timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().dedup_key, "wake");
    }

    #[tokio::test]
    async fn remove_withdraws_pending_job() {
        let queue = JobQueue::new();
        let target = job(Priority::High, "target");
        queue.enqueue(target.clone()).await.unwrap();
        queue
            .retry_after(job(Priority::Low, "delayed"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(queue.contains(target.job_id).await);
        assert!(queue.remove(target.job_id).await);
        assert!(!queue.remove(target.job_id).await);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn close_rejects_enqueue_and_releases_waiters() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let token = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.dequeue(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(
            queue.enqueue(job(Priority::Low, "x")).await,
            Err(QueueError::Closed)
        );
    }

    #[tokio::test]
    async fn shutdown_token_interrupts_dequeue() {
        let queue = JobQueue::new();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(queue.dequeue(&token).await, None);
    }
}
