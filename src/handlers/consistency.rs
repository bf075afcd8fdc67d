//! # Consistency API Handlers
//!
//! Operator-triggered validation and repair.

use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

use crate::consistency::{RepairReport, RepairTarget, ScanReport};
use crate::error::{ApiError, validation_error};
use crate::handlers::types::{IssueInfo, IssuesResponse};
use crate::server::AppState;

const DEFAULT_ISSUE_LIMIT: u64 = 100;
const MAX_ISSUE_LIMIT: u64 = 500;

#[derive(Debug, Deserialize)]
pub struct RepairQuery {
    /// `all`, an analysis job id or a consistency issue id
    pub target: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IssuesQuery {
    /// Only unresolved issues (default true)
    pub open: Option<bool>,
    pub limit: Option<u64>,
}

/// Run one validation pass now.
#[utoipa::path(
    post,
    path = "/consistency/scan",
    responses(
        (status = 200, description = "Scan completed", body = ScanReport)
    ),
    tag = "consistency"
)]
pub async fn scan(State(state): State<AppState>) -> Result<Json<ScanReport>, ApiError> {
    Ok(Json(state.engine.scan().await?))
}

/// Repair one analysis or everything currently flagged. Safe to call repeatedly.
#[utoipa::path(
    post,
    path = "/consistency/repair",
    params(("target" = String, Query, description = "'all', an analysis job id or an issue id")),
    responses(
        (status = 200, description = "Repair pass result", body = RepairReport),
        (status = 400, description = "Missing or malformed target", body = ApiError),
        (status = 404, description = "Unknown analysis or issue", body = ApiError)
    ),
    tag = "consistency"
)]
pub async fn repair(
    State(state): State<AppState>,
    Query(query): Query<RepairQuery>,
) -> Result<Json<RepairReport>, ApiError> {
    let raw = query.target.unwrap_or_default();
    let target: RepairTarget = raw.parse().map_err(|message: String| {
        validation_error(
            "Invalid repair target",
            serde_json::json!({ "target": message }),
        )
    })?;
    Ok(Json(state.engine.repair(target).await?))
}

#[utoipa::path(
    get,
    path = "/consistency/issues",
    params(
        ("open" = Option<bool>, Query, description = "Only unresolved issues (default true)"),
        ("limit" = Option<u64>, Query, description = "Maximum number of issues (default 100, max 500)")
    ),
    responses(
        (status = 200, description = "Consistency issues, newest first", body = IssuesResponse)
    ),
    tag = "consistency"
)]
pub async fn list_issues(
    State(state): State<AppState>,
    Query(query): Query<IssuesQuery>,
) -> Result<Json<IssuesResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ISSUE_LIMIT)
        .clamp(1, MAX_ISSUE_LIMIT);
    let issues = state
        .engine
        .list_issues(query.open.unwrap_or(true), limit)
        .await?;
    Ok(Json(IssuesResponse {
        issues: issues.into_iter().map(IssueInfo::from).collect(),
    }))
}
