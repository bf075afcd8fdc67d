//! Test utilities for engine integration tests.
//!
//! In-memory SQLite with migrations, configs with short timings and scripted
//! backends that record the order of calls and fail on demand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_engine::config::AppConfig;
use analysis_engine::engine::{JobEngine, SubmitRequest};
use analysis_engine::models::credit_reservation;
use analysis_engine::models::{CreditReservation, JobState, Priority};
use analysis_engine::tasks::{AnalysisBackend, JobPayload, MediaBackend, TaskError, TaskRegistry};
use anyhow::Result;
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, Statement,
};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    // Fixtures insert rows out of relation order.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// One worker, no pacing, no retry backoff, status cache off. Background scans stay out of the
/// way; tests call `scan` themselves.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.worker_count = 1;
    config.engine.max_concurrent_jobs = 1;
    config.engine.rate_limit_interval_ms = 0;
    config.engine.retry_attempts = 3;
    config.engine.retry_base_delay_s = 0;
    config.engine.retry_max_delay_s = 0;
    config.engine.retry_jitter_factor = 0.0;
    config.engine.job_timeout_s = 5;
    config.engine.circuit_failure_threshold = 5;
    config.engine.circuit_recovery_timeout_s = 30;
    config.engine.breaker_defer_ms = 50;
    config.engine.shutdown_drain_timeout_s = 1;
    config.lifecycle.hang_threshold_s = 300;
    config.lifecycle.status_cache_ttl_ms = 0;
    config.consistency.scan_interval_s = 3_600;
    config
}

/// What a scripted backend does for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Fail transiently this many times, then succeed
    TransientTimes(u32),
    /// Always fail transiently
    AlwaysTransient,
    /// Always fail permanently
    Permanent,
    /// Always fail with a local storage error
    Storage,
}

#[derive(Default)]
struct ScriptState {
    scripts: HashMap<String, Script>,
    failures: HashMap<String, u32>,
    calls: Vec<String>,
}

impl ScriptState {
    fn call(&mut self, key: &str) -> Result<(), TaskError> {
        self.calls.push(key.to_string());
        let Some(script) = self.scripts.get(key).copied() else {
            return Ok(());
        };
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        match script {
            Script::TransientTimes(times) if *failures < times => {
                *failures += 1;
                Err(TaskError::transient(format!("{key}: upstream 503")))
            }
            Script::TransientTimes(_) => Ok(()),
            Script::AlwaysTransient => {
                *failures += 1;
                Err(TaskError::transient(format!("{key}: upstream 503")))
            }
            Script::Permanent => Err(TaskError::permanent(format!("{key}: rejected"))),
            Script::Storage => Err(TaskError::internal(format!("{key}: database is locked"))),
        }
    }
}

/// Media and analysis backend driven by per-key scripts. Profile calls are keyed by username,
/// media calls by media id and analysis calls by unit key.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
    latency: Duration,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn script(&self, key: &str, script: Script) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(key.to_string(), script);
    }

    pub fn clear_script(&self, key: &str) {
        self.state.lock().unwrap().scripts.remove(key);
    }

    /// Every call in the order it reached the backend.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, key: &str) -> usize {
        self.calls().iter().filter(|call| call.as_str() == key).count()
    }

    pub fn registry(&self) -> TaskRegistry {
        TaskRegistry::with_backends(Arc::new(self.clone()), Arc::new(self.clone()))
    }

    async fn call(&self, key: &str) -> Result<(), TaskError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.state.lock().unwrap().call(key)
    }
}

#[async_trait]
impl MediaBackend for ScriptedBackend {
    async fn fetch_profile(&self, username: &str) -> Result<JsonValue, TaskError> {
        self.call(username).await?;
        Ok(json!({"username": username, "followers": 1_000}))
    }

    async fn process_media(&self, _profile_id: &str, media_id: &str) -> Result<(), TaskError> {
        self.call(media_id).await
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    async fn analyze_unit(
        &self,
        target_entity_id: &str,
        unit_key: &str,
    ) -> Result<JsonValue, TaskError> {
        self.call(unit_key).await?;
        Ok(json!({
            "target": target_entity_id,
            "unit_key": unit_key,
            "sentiment": 0.5,
        }))
    }
}

/// Engine over a fresh database and the given backend. Not started.
pub async fn setup_engine(
    config: &AppConfig,
    backend: &ScriptedBackend,
) -> Result<(Arc<JobEngine>, DatabaseConnection)> {
    let db = setup_test_db().await?;
    let engine = Arc::new(JobEngine::new(config, db.clone(), backend.registry()));
    Ok((engine, db))
}

pub fn scrape(owner_id: Uuid, username: &str, priority: Priority, cost: i64) -> SubmitRequest {
    SubmitRequest {
        owner_id,
        payload: JobPayload::ProfileScrape {
            username: username.to_string(),
        },
        priority,
        cost,
    }
}

pub fn analysis(owner_id: Uuid, target: &str, units: &[&str], cost: i64) -> SubmitRequest {
    SubmitRequest {
        owner_id,
        payload: JobPayload::ContentAnalysis {
            target_entity_id: target.to_string(),
            unit_keys: units.iter().map(|unit| unit.to_string()).collect(),
        },
        priority: Priority::Medium,
        cost,
    }
}

/// Polls until the job reaches `state` or the timeout elapses.
pub async fn wait_for_state(
    engine: &JobEngine,
    job_id: Uuid,
    state: JobState,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = engine.get_job(job_id).await?;
        if job.job_state() == Some(state) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "job {job_id} is {} after {:?}, expected {state}",
                job.state,
                timeout
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Polls until every job is terminal.
pub async fn wait_until_settled(engine: &JobEngine, job_ids: &[Uuid], timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut pending = 0;
        for job_id in job_ids {
            let job = engine.get_job(*job_id).await?;
            if !job.job_state().is_some_and(|state| state.is_terminal()) {
                pending += 1;
            }
        }
        if pending == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("{pending} jobs still active after {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Backdate a reservation so it looks `days` old to the expiry sweep.
pub async fn age_reservation(db: &DatabaseConnection, reservation_id: Uuid, days: i64) -> Result<()> {
    let created = (Utc::now() - ChronoDuration::days(days)).fixed_offset();
    CreditReservation::update_many()
        .col_expr(credit_reservation::Column::CreatedAt, Expr::value(created))
        .filter(credit_reservation::Column::Id.eq(reservation_id))
        .exec(db)
        .await?;
    Ok(())
}
