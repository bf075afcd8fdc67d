//! # Circuit Breaker
//!
//! Per-dependency breaker that fails fast after repeated downstream errors and
//! probes recovery with a single trial call once the cooldown has elapsed.
//!
//! State is held behind a mutex so that the Open to HalfOpen transition and
//! the admission of the trial call happen atomically: two workers can never
//! both win the HalfOpen trial.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// Returned instead of a permit while the breaker sheds load.
#[derive(Debug, Clone, Error)]
#[error("circuit for '{dependency}' is {state}; retry in {retry_in:?}")]
pub struct BreakerOpen {
    pub dependency: String,
    pub state: BreakerState,
    pub retry_in: Duration,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    dependency: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Point-in-time view of a breaker, exposed on the health endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    /// Milliseconds since the breaker last opened, while open or half-open
    pub open_for_ms: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(
        dependency: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            dependency: dependency.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned breaker still holds consistent counters; keep serving.
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Current state, applying the Open to HalfOpen timeout lazily.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at))
                if opened_at.elapsed() >= self.recovery_timeout =>
            {
                BreakerState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Ask to contact the dependency. Closed admits everyone; Open rejects until the recovery
    /// timeout elapses, after which exactly one caller receives the HalfOpen trial permit.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, BreakerOpen> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(CallPermit::new(Arc::clone(self), false)),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    gauge!("engine_breaker_state", "dependency" => self.dependency.clone())
                        .set(1.0);
                    info!(dependency = %self.dependency, "Circuit half-open; admitting trial call");
                    Ok(CallPermit::new(Arc::clone(self), true))
                } else {
                    Err(self.rejection(BreakerState::Open, self.recovery_timeout - elapsed))
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejection(BreakerState::HalfOpen, self.recovery_timeout))
                } else {
                    inner.trial_in_flight = true;
                    Ok(CallPermit::new(Arc::clone(self), true))
                }
            }
        }
    }

    fn rejection(&self, state: BreakerState, retry_in: Duration) -> BreakerOpen {
        counter!("engine_breaker_rejections_total", "dependency" => self.dependency.clone())
            .increment(1);
        BreakerOpen {
            dependency: self.dependency.clone(),
            state,
            retry_in,
        }
    }

    /// Reset the failure count and close the circuit. Outcomes of calls admitted before the
    /// circuit opened are ignored while it is open.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Open => {}
            BreakerState::HalfOpen => {
                info!(dependency = %self.dependency, "Trial call succeeded; circuit closed");
                self.close(&mut inner);
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
        }
    }

    /// Count a failure; trips the circuit at the threshold, and re-opens it when the HalfOpen
    /// trial fails.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        dependency = %self.dependency,
                        failures = inner.failure_count,
                        "Failure threshold reached; circuit opened"
                    );
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                inner.failure_count += 1;
                warn!(dependency = %self.dependency, "Trial call failed; circuit re-opened");
                self.open(&mut inner);
            }
            BreakerState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        counter!("engine_breaker_open_total", "dependency" => self.dependency.clone())
            .increment(1);
        gauge!("engine_breaker_state", "dependency" => self.dependency.clone()).set(2.0);
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        gauge!("engine_breaker_state", "dependency" => self.dependency.clone()).set(0.0);
    }

    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.lock();
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            open_for_ms: inner
                .opened_at
                .map(|at| at.elapsed().as_millis().min(u64::MAX as u128) as u64),
        }
    }
}

/// Admission to call the dependency. Settle it with [`CallPermit::success`] or
/// [`CallPermit::failure`]; dropping an unsettled trial permit frees the HalfOpen slot without
/// deciding the circuit.
#[must_use = "settle the permit with success() or failure()"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial();
        }
    }
}

/// One breaker per downstream dependency, created on first use with shared settings.
pub struct CircuitBreakers {
    failure_threshold: u32,
    recovery_timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        Arc::clone(breakers.entry(dependency.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                dependency,
                self.failure_threshold,
                self.recovery_timeout,
            ))
        }))
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().map(|breaker| breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, recovery: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("scraper", threshold, recovery))
    }

    fn fail_times(breaker: &Arc<CircuitBreaker>, times: usize) {
        for _ in 0..times {
            breaker.try_acquire().expect("closed breaker admits").failure();
        }
    }

    #[test]
    fn opens_after_threshold_and_rejects_without_calling() {
        let breaker = breaker(5, Duration::from_secs(30));
        let downstream_calls = AtomicUsize::new(0);

        for _ in 0..5 {
            let permit = breaker.try_acquire().expect("closed");
            downstream_calls.fetch_add(1, Ordering::SeqCst);
            permit.failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let started = Instant::now();
        let sixth = breaker.try_acquire();
        let elapsed = started.elapsed();
        if let Ok(permit) = sixth {
            downstream_calls.fetch_add(1, Ordering::SeqCst);
            permit.success();
            panic!("open breaker admitted a call");
        }

        assert_eq!(downstream_calls.load(Ordering::SeqCst), 5);
        assert!(elapsed < Duration::from_millis(1), "rejection took {elapsed:?}");
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(30));
        fail_times(&breaker, 2);
        breaker.try_acquire().unwrap().success();
        fail_times(&breaker, 2);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let breaker = breaker(1, Duration::from_millis(20));
        fail_times(&breaker, 1);
        assert!(breaker.try_acquire().is_err());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let trial = breaker.try_acquire().expect("trial admitted");
        assert!(trial.is_trial());
        let second = breaker.try_acquire();
        assert!(matches!(
            second,
            Err(BreakerOpen {
                state: BreakerState::HalfOpen,
                ..
            })
        ));

        trial.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok_and(|permit| !permit.is_trial()));
    }

    #[test]
    fn failed_trial_reopens_the_circuit() {
        let breaker = breaker(2, Duration::from_millis(20));
        fail_times(&breaker, 2);
        std::thread::sleep(Duration::from_millis(30));

        breaker.try_acquire().expect("trial").failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn dropped_trial_frees_the_slot() {
        let breaker = breaker(1, Duration::from_millis(10));
        fail_times(&breaker, 1);
        std::thread::sleep(Duration::from_millis(20));

        drop(breaker.try_acquire().expect("trial"));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().expect("new trial").is_trial());
    }

    #[test]
    fn concurrent_callers_race_for_a_single_trial() {
        let breaker = breaker(1, Duration::from_millis(10));
        fail_times(&breaker, 1);
        std::thread::sleep(Duration::from_millis(20));

        let admitted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    if let Ok(permit) = breaker.try_acquire() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        // Hold the slot until every thread has tried.
                        std::thread::sleep(Duration::from_millis(20));
                        permit.success();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn registry_shares_one_breaker_per_dependency() {
        let breakers = CircuitBreakers::new(5, Duration::from_secs(30));
        let a = breakers.get("ai");
        let b = breakers.get("ai");
        assert!(Arc::ptr_eq(&a, &b));
        breakers.get("scraper");
        let names: Vec<String> = breakers
            .snapshots()
            .into_iter()
            .map(|s| s.dependency)
            .collect();
        assert_eq!(names, vec!["ai".to_string(), "scraper".to_string()]);
    }
}
