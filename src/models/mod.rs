//! # Data Models
//!
//! SeaORM entities backing the job engine, plus the small response types
//! shared by the service endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod analysis_aggregate;
pub mod analysis_job;
pub mod analysis_unit;
pub mod consistency_issue;
pub mod credit_balance;
pub mod credit_reservation;
pub mod job;

pub use analysis_aggregate::Entity as AnalysisAggregate;
pub use analysis_job::{AnalysisStatus, Entity as AnalysisJob};
pub use analysis_unit::Entity as AnalysisUnit;
pub use consistency_issue::{Entity as ConsistencyIssue, IssueType};
pub use credit_balance::Entity as CreditBalance;
pub use credit_reservation::{Entity as CreditReservation, ReservationState};
pub use job::{Entity as Job, JobState, Priority};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "analysis-engine".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
