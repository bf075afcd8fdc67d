//! Job entity model
//!
//! This module contains the SeaORM entity model for the jobs table, which
//! persists every schedulable unit of work together with its priority, retry
//! budget and liveness timestamps.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Job entity representing a unit of schedulable work
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owner charged for the job
    pub owner_id: Uuid,

    /// Type tag of the payload (e.g. content_analysis)
    pub kind: String,

    /// Tagged payload describing the task and its target entity
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Payload identity used for duplicate suppression
    pub dedup_key: String,

    /// Priority class, see [`Priority::as_i16`]
    pub priority: i16,

    /// Current state, see [`JobState`]
    pub state: String,

    pub attempt_count: i32,

    pub max_attempts: i32,

    /// Credits held for this job
    pub cost: i64,

    pub reservation_id: Option<Uuid>,

    pub enqueued_at: DateTimeWithTimeZone,

    /// Earliest time a retried job may be dispatched again
    pub retry_after: Option<DateTimeWithTimeZone>,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub last_heartbeat_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    /// Last failure reason
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn job_state(&self) -> Option<JobState> {
        self.state.parse().ok()
    }

    pub fn job_priority(&self) -> Priority {
        Priority::from_i16(self.priority)
    }
}

/// Priority class of a job. Ordering follows dispatch order: `Critical` is greatest.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_i16(self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    /// Out-of-range values clamp to the nearest class.
    pub fn from_i16(value: i16) -> Self {
        match value {
            i16::MIN..=0 => Priority::Low,
            1 => Priority::Medium,
            2 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

/// Persisted job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Repairing,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Repairing => "repairing",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "repairing" => Ok(JobState::Repairing),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_first() {
        let mut classes = vec![
            Priority::Low,
            Priority::Critical,
            Priority::Medium,
            Priority::High,
        ];
        classes.sort();
        classes.reverse();
        assert_eq!(
            classes,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Medium,
                Priority::Low
            ]
        );
    }

    #[test]
    fn priority_storage_values_round_trip() {
        for p in [
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Critical,
        ] {
            assert_eq!(Priority::from_i16(p.as_i16()), p);
        }
        assert_eq!(Priority::from_i16(-4), Priority::Low);
        assert_eq!(Priority::from_i16(42), Priority::Critical);
    }

    #[test]
    fn job_state_parses_storage_strings() {
        assert_eq!("repairing".parse::<JobState>(), Ok(JobState::Repairing));
        assert!("done".parse::<JobState>().is_err());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Repairing.is_terminal());
    }
}
