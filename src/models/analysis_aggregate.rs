//! AnalysisAggregate entity model
//!
//! The downstream artifact of a completed analysis: a summary computed from
//! the successful units. `unit_count` must equal the number of successful
//! units for the analysis to count as consistent.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "analysis_aggregates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub analysis_job_id: Uuid,

    pub unit_count: i32,

    #[sea_orm(column_type = "JsonBinary")]
    pub summary: JsonValue,

    pub computed_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
