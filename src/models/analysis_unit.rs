//! AnalysisUnit entity model
//!
//! One sub-unit (a media item, a post) of an analysis batch.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const UNIT_PENDING: &str = "pending";
pub const UNIT_SUCCEEDED: &str = "succeeded";
pub const UNIT_FAILED: &str = "failed";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "analysis_units")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub analysis_job_id: Uuid,

    pub unit_key: String,

    /// Processing order within the batch
    pub position: i32,

    /// One of `pending`, `succeeded`, `failed`
    pub status: String,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub result: Option<JsonValue>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    pub processed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::analysis_job::Entity",
        from = "Column::AnalysisJobId",
        to = "super::analysis_job::Column::JobId"
    )]
    AnalysisJob,
}

impl Related<super::analysis_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AnalysisJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_succeeded(&self) -> bool {
        self.status == UNIT_SUCCEEDED
    }

    pub fn is_pending(&self) -> bool {
        self.status == UNIT_PENDING
    }
}
