//! ConsistencyIssue entity model

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// A detected mismatch between recorded state and the data behind it
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "consistency_issues")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Id of the inconsistent record (an analysis job id)
    pub entity_id: Uuid,

    pub entity_type: String,

    /// See [`IssueType`]
    pub issue_type: String,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub details: Option<JsonValue>,

    pub detected_at: DateTimeWithTimeZone,

    /// Null while the issue is open
    #[sea_orm(column_type = "Text", nullable)]
    pub resolution: Option<String>,

    pub resolved_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_open(&self) -> bool {
        self.resolution.is_none()
    }
}

pub const ENTITY_ANALYSIS_JOB: &str = "analysis_job";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// Completed analysis without an aggregate record
    AggregateMissing,
    /// Aggregate count differs from the number of successful units
    AggregateCountMismatch,
    /// Completed analysis with units that are not individually successful
    IncompleteUnits,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::AggregateMissing => "aggregate_missing",
            IssueType::AggregateCountMismatch => "aggregate_count_mismatch",
            IssueType::IncompleteUnits => "incomplete_units",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "aggregate_missing" => Ok(IssueType::AggregateMissing),
            "aggregate_count_mismatch" => Ok(IssueType::AggregateCountMismatch),
            "incomplete_units" => Ok(IssueType::IncompleteUnits),
            other => Err(format!("unknown issue type '{other}'")),
        }
    }
}
