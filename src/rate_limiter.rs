//! Dispatch gate shared by all workers: a minimum interval between dispatches
//! (token bucket with a burst of one) plus a cap on concurrently running jobs.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("dispatch gate is closed")]
pub struct GateClosed;

pub struct DispatchGate {
    limiter: Option<DirectLimiter>,
    slots: Arc<Semaphore>,
    max_in_flight: usize,
}

/// Held for the whole execution of one job; dropping it frees the slot.
#[derive(Debug)]
pub struct DispatchPermit {
    _slot: OwnedSemaphorePermit,
}

impl DispatchGate {
    /// A zero `min_interval` disables rate limiting and keeps only the concurrency cap.
    pub fn new(min_interval: Duration, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        let limiter = Quota::with_period(min_interval)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self {
            limiter,
            slots: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Wait for a free execution slot.
    pub async fn reserve_slot(&self) -> Result<DispatchPermit, GateClosed> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;
        Ok(DispatchPermit { _slot: slot })
    }

    /// Wait for the next dispatch token. Called after a job has been dequeued, so idle workers
    /// never bank tokens and release a burst when work arrives.
    pub async fn pace(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Slot and token in one step.
    pub async fn acquire(&self) -> Result<DispatchPermit, GateClosed> {
        let permit = self.reserve_slot().await?;
        self.pace().await;
        Ok(permit)
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.slots.available_permits())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Reject all pending and future acquisitions. Permits already handed out stay valid.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Instant, timeout};

    #[tokio::test]
    async fn dispatches_are_spaced_by_the_interval() {
        let gate = DispatchGate::new(Duration::from_millis(50), 8);
        let started = Instant::now();
        let mut permits = Vec::new();
        for _ in 0..3 {
            permits.push(gate.acquire().await.unwrap());
        }
        // First token is immediate, the next two wait one interval each.
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(gate.in_flight(), 3);
    }

    #[tokio::test]
    async fn concurrency_cap_blocks_until_a_permit_is_dropped() {
        let gate = DispatchGate::new(Duration::ZERO, 2);
        let first = gate.acquire().await.unwrap();
        let _second = gate.acquire().await.unwrap();

        assert!(
            timeout(Duration::from_millis(30), gate.acquire())
                .await
                .is_err()
        );

        drop(first);
        let third = timeout(Duration::from_millis(100), gate.acquire()).await;
        assert!(matches!(third, Ok(Ok(_))));
        assert_eq!(gate.in_flight(), 2);
    }

    #[tokio::test]
    async fn closed_gate_rejects_waiters() {
        let gate = DispatchGate::new(Duration::ZERO, 1);
        let held = gate.acquire().await.unwrap();
        gate.close();
        assert_eq!(gate.acquire().await.unwrap_err(), GateClosed);
        drop(held);
    }
}
