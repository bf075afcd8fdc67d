//! # API Handlers
//!
//! HTTP endpoints of the analysis engine: job submission and status,
//! consistency operations, credit accounts and health.

use crate::models::ServiceInfo;
use axum::response::Json;

pub mod consistency;
pub mod credits;
pub mod health;
pub mod jobs;
pub mod types;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

#[cfg(test)]
mod tests;
