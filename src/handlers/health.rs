//! # Health API Handler

use std::collections::BTreeMap;

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;

use crate::circuit_breaker::{BreakerSnapshot, BreakerState};
use crate::db;
use crate::server::AppState;

/// Liveness and load of the engine
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the database is unreachable or a breaker is open
    #[schema(example = "ok")]
    pub status: String,
    pub database: bool,
    pub queue_depth: usize,
    pub in_flight: usize,
    /// Persisted jobs per state; empty when the database is unreachable
    pub jobs_by_state: BTreeMap<String, i64>,
    pub breakers: Vec<BreakerSnapshot>,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Engine is healthy", body = HealthResponse),
        (status = 503, description = "Engine is degraded", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match db::health_check(&state.db).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "Database health check failed");
            false
        }
    };
    let jobs_by_state = if database {
        state.engine.job_counts().await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Failed to count jobs");
            BTreeMap::new()
        })
    } else {
        BTreeMap::new()
    };
    let breakers = state.engine.breaker_snapshots();
    let any_open = breakers
        .iter()
        .any(|breaker| breaker.state == BreakerState::Open);

    let healthy = database && !any_open;
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        database,
        queue_depth: state.engine.queue_depth().await,
        in_flight: state.engine.in_flight(),
        jobs_by_state,
        breakers,
    };
    let code = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
