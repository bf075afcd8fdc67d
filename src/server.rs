//! # Server Configuration
//!
//! Router assembly, OpenAPI document and the serve loop for the analysis
//! engine API.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::engine::JobEngine;
use crate::handlers;
use crate::telemetry::trace_context_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub engine: Arc<JobEngine>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health::health))
        .route(
            "/jobs",
            post(handlers::jobs::submit_job).get(handlers::jobs::list_jobs),
        )
        .route("/jobs/{job_id}", get(handlers::jobs::get_job))
        .route("/jobs/{job_id}/status", get(handlers::jobs::job_status))
        .route("/jobs/{job_id}/cancel", post(handlers::jobs::cancel_job))
        .route("/consistency/scan", post(handlers::consistency::scan))
        .route("/consistency/repair", post(handlers::consistency::repair))
        .route("/consistency/issues", get(handlers::consistency::list_issues))
        .route("/credits/{owner_id}", get(handlers::credits::get_balance))
        .route(
            "/credits/{owner_id}/deposit",
            post(handlers::credits::deposit),
        )
        .route(
            "/credits/reservations/{reservation_id}",
            get(handlers::credits::get_reservation),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Start the engine, serve the API until Ctrl-C, then drain the engine.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
    engine: Arc<JobEngine>,
) -> Result<()> {
    let addr = config
        .bind_addr()
        .with_context(|| format!("Invalid server address '{}'", config.api_bind_addr))?;

    engine.start().await.context("Failed to start job engine")?;

    let state = AppState {
        config: Arc::new(config.clone()),
        db,
        engine: Arc::clone(&engine),
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, profile = %config.profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped; draining job engine");
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health::health,
        crate::handlers::jobs::submit_job,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::job_status,
        crate::handlers::jobs::cancel_job,
        crate::handlers::consistency::scan,
        crate::handlers::consistency::repair,
        crate::handlers::consistency::list_issues,
        crate::handlers::credits::get_balance,
        crate::handlers::credits::deposit,
        crate::handlers::credits::get_reservation,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::Priority,
            crate::models::AnalysisStatus,
            crate::models::JobState,
            crate::error::ApiError,
            crate::tasks::JobPayload,
            crate::engine::SubmitOutcome,
            crate::engine::CancelOutcome,
            crate::lifecycle::JobStatusView,
            crate::lifecycle::ProgressView,
            crate::lifecycle::TimingView,
            crate::lifecycle::HealthView,
            crate::consistency::ScanReport,
            crate::consistency::RepairReport,
            crate::consistency::RepairOutcome,
            crate::consistency::RepairAction,
            crate::circuit_breaker::BreakerSnapshot,
            crate::circuit_breaker::BreakerState,
            crate::handlers::health::HealthResponse,
            crate::handlers::types::SubmitJobRequest,
            crate::handlers::types::JobInfo,
            crate::handlers::types::JobsResponse,
            crate::handlers::types::IssueInfo,
            crate::handlers::types::IssuesResponse,
            crate::handlers::types::DepositRequest,
            crate::handlers::types::BalanceInfo,
            crate::handlers::types::ReservationInfo,
        )
    ),
    tags(
        (name = "jobs", description = "Job submission, status polling and cancellation"),
        (name = "consistency", description = "Validation and repair of analysis results"),
        (name = "credits", description = "Credit balances and reservations"),
        (name = "health", description = "Engine health"),
    ),
    info(
        title = "Analysis Engine API",
        description = "Background job engine for creator analytics",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
