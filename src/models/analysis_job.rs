//! AnalysisJob entity model
//!
//! Caller-visible record of a long-running content analysis. The row shares
//! its primary key with the [`super::job`] row that executes it.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "analysis_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: Uuid,

    pub owner_id: Uuid,

    /// Entity being analysed (profile, campaign, ...)
    pub target_entity_id: String,

    /// See [`AnalysisStatus`]
    pub status: String,

    pub units_total: i32,

    /// Units that reached a final outcome, successful or not
    pub units_done: i32,

    pub units_failed: i32,

    pub started_at: Option<DateTimeWithTimeZone>,

    /// Liveness signal written by the worker after every processed unit
    pub last_heartbeat_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "Text", nullable)]
    pub failure_reason: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::analysis_unit::Entity")]
    Units,
}

impl Related<super::analysis_unit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Units.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn analysis_status(&self) -> Option<AnalysisStatus> {
        self.status.parse().ok()
    }
}

/// Lifecycle status exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RepairNeeded,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::RepairNeeded => "repair_needed",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(AnalysisStatus::Pending),
            "running" => Ok(AnalysisStatus::Running),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            "repair_needed" => Ok(AnalysisStatus::RepairNeeded),
            other => Err(format!("unknown analysis status '{other}'")),
        }
    }
}
