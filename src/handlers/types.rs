//! # Common API Types
//!
//! Request and response bodies shared by the handlers, plus the conversions
//! from the persisted models.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::consistency_issue::Model as IssueModel;
use crate::models::credit_balance::Model as BalanceModel;
use crate::models::credit_reservation::Model as ReservationModel;
use crate::models::job::Model as JobModel;
use crate::models::Priority;
use crate::tasks::JobPayload;

/// Request body for `POST /jobs`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitJobRequest {
    /// Account charged for the job
    pub owner_id: Uuid,
    pub payload: JobPayload,
    /// Defaults to `medium`
    #[serde(default)]
    pub priority: Priority,
    /// Credits reserved while the job runs (default 0)
    #[serde(default)]
    #[schema(example = 100)]
    pub cost: i64,
}

/// Persisted job as returned by the job endpoints
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobInfo {
    pub id: Uuid,
    pub owner_id: Uuid,
    #[schema(example = "content_analysis")]
    pub kind: String,
    pub payload: JsonValue,
    #[schema(example = "medium")]
    pub priority: Priority,
    /// One of queued, running, succeeded, failed, repairing
    #[schema(example = "queued")]
    pub state: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub cost: i64,
    pub reservation_id: Option<Uuid>,
    pub enqueued_at: String,
    pub retry_after: Option<String>,
    pub started_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

impl From<JobModel> for JobInfo {
    fn from(model: JobModel) -> Self {
        let priority = model.job_priority();
        Self {
            id: model.id,
            owner_id: model.owner_id,
            kind: model.kind,
            payload: model.payload,
            priority,
            state: model.state,
            attempt_count: model.attempt_count,
            max_attempts: model.max_attempts,
            cost: model.cost,
            reservation_id: model.reservation_id,
            enqueued_at: model.enqueued_at.to_rfc3339(),
            retry_after: model.retry_after.map(|dt| dt.to_rfc3339()),
            started_at: model.started_at.map(|dt| dt.to_rfc3339()),
            last_heartbeat_at: model.last_heartbeat_at.map(|dt| dt.to_rfc3339()),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
            error: model.error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    pub jobs: Vec<JobInfo>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IssueInfo {
    pub id: Uuid,
    /// Analysis job the issue was found on
    pub entity_id: Uuid,
    pub entity_type: String,
    #[schema(example = "aggregate_missing")]
    pub issue_type: String,
    pub details: Option<JsonValue>,
    pub detected_at: String,
    /// Null while open
    pub resolution: Option<String>,
    pub resolved_at: Option<String>,
}

impl From<IssueModel> for IssueInfo {
    fn from(model: IssueModel) -> Self {
        Self {
            id: model.id,
            entity_id: model.entity_id,
            entity_type: model.entity_type,
            issue_type: model.issue_type,
            details: model.details,
            detected_at: model.detected_at.to_rfc3339(),
            resolution: model.resolution,
            resolved_at: model.resolved_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IssuesResponse {
    pub issues: Vec<IssueInfo>,
}

/// Request body for `POST /credits/{owner_id}/deposit`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DepositRequest {
    #[schema(example = 500)]
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BalanceInfo {
    pub owner_id: Uuid,
    pub balance: i64,
    pub updated_at: String,
}

impl From<BalanceModel> for BalanceInfo {
    fn from(model: BalanceModel) -> Self {
        Self {
            owner_id: model.owner_id,
            balance: model.balance,
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReservationInfo {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub job_id: Uuid,
    pub amount: i64,
    /// One of reserved, committed, refunded
    #[schema(example = "reserved")]
    pub state: String,
    pub settle_reason: Option<String>,
    pub created_at: String,
    pub settled_at: Option<String>,
}

impl From<ReservationModel> for ReservationInfo {
    fn from(model: ReservationModel) -> Self {
        Self {
            id: model.id,
            owner_id: model.owner_id,
            job_id: model.job_id,
            amount: model.amount,
            state: model.state,
            settle_reason: model.settle_reason,
            created_at: model.created_at.to_rfc3339(),
            settled_at: model.settled_at.map(|dt| dt.to_rfc3339()),
        }
    }
}
