//! # Jobs API Handlers
//!
//! Submission, status polling, listing and cancellation of jobs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::{CancelOutcome, SubmitOutcome, SubmitRequest};
use crate::error::{ApiError, validation_error};
use crate::handlers::types::{JobInfo, JobsResponse, SubmitJobRequest};
use crate::lifecycle::JobStatusView;
use crate::models::JobState;
use crate::repositories::JobListFilter;
use crate::server::AppState;

const DEFAULT_LIST_LIMIT: u64 = 50;
const MAX_LIST_LIMIT: u64 = 100;

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub owner_id: Option<Uuid>,
    /// One of queued, running, succeeded, failed, repairing
    pub state: Option<String>,
    /// Payload type, e.g. content_analysis
    pub kind: Option<String>,
    /// Default 50, max 100
    pub limit: Option<u64>,
}

/// Submit a job. Returns the id of the new job, or of the active job with the same payload.
#[utoipa::path(
    post,
    path = "/jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 202, description = "Job accepted", body = SubmitOutcome),
        (status = 200, description = "Identical job already active", body = SubmitOutcome),
        (status = 400, description = "Invalid payload", body = ApiError),
        (status = 402, description = "Not enough credits", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    let outcome = state
        .engine
        .submit(SubmitRequest {
            owner_id: request.owner_id,
            payload: request.payload,
            priority: request.priority,
            cost: request.cost,
        })
        .await?;

    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(outcome)))
}

/// Poll-friendly job status. Poll no more often than every 2 seconds.
#[utoipa::path(
    get,
    path = "/jobs/{job_id}/status",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Current job status", body = JobStatusView, example = json!({
            "job_id": "550e8400-e29b-41d4-a716-446655440000",
            "status": "running",
            "progress": { "percentage": 40.0, "units_done": 4, "units_total": 10 },
            "timing": {
                "started_at": "2026-01-05T09:00:00+00:00",
                "last_heartbeat_at": "2026-01-05T09:00:42+00:00"
            },
            "health": { "is_hung": false }
        })),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>, ApiError> {
    Ok(Json(state.engine.status(job_id).await?))
}

#[utoipa::path(
    get,
    path = "/jobs/{job_id}",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Persisted job record", body = JobInfo),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobInfo>, ApiError> {
    Ok(Json(state.engine.get_job(job_id).await?.into()))
}

#[utoipa::path(
    get,
    path = "/jobs",
    params(
        ("owner_id" = Option<Uuid>, Query, description = "Filter by owner"),
        ("state" = Option<String>, Query, description = "Filter by state (queued, running, succeeded, failed, repairing)"),
        ("kind" = Option<String>, Query, description = "Filter by payload type"),
        ("limit" = Option<u64>, Query, description = "Maximum number of jobs to return (default 50, max 100)")
    ),
    responses(
        (status = 200, description = "Jobs, newest first", body = JobsResponse),
        (status = 400, description = "Invalid filter", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, ApiError> {
    let job_state = match query.state.as_deref() {
        Some(raw) => Some(raw.parse::<JobState>().map_err(|message| {
            validation_error(
                "Invalid state filter",
                serde_json::json!({ "state": message }),
            )
        })?),
        None => None,
    };

    let filter = JobListFilter {
        owner_id: query.owner_id,
        state: job_state,
        kind: query.kind,
        limit: query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT),
    };
    let jobs = state.engine.list_jobs(&filter).await?;
    Ok(Json(JobsResponse {
        jobs: jobs.into_iter().map(JobInfo::from).collect(),
    }))
}

/// Cancel a job. Queued jobs fail at once; running jobs stop at their next sub-unit boundary.
/// Either way the reservation is refunded.
#[utoipa::path(
    post,
    path = "/jobs/{job_id}/cancel",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Cancellation result", body = CancelOutcome),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelOutcome>, ApiError> {
    Ok(Json(state.engine.cancel(job_id).await?))
}
