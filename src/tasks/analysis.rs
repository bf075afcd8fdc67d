//! Content analysis handlers.
//!
//! An analysis is a batch of units processed one at a time. Each unit's
//! outcome is persisted before the next starts, so a retried attempt resumes
//! from the first pending unit instead of starting over.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::models::AnalysisStatus;
use crate::tasks::payload::{JobKind, JobPayload};
use crate::tasks::trait_::{JobContext, TaskError, TaskErrorKind, TaskHandler};

/// Breaker name for the AI analysis service.
pub const ANALYSIS_DEPENDENCY: &str = "ai_analysis";

/// Downstream AI analysis service.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn analyze_unit(
        &self,
        target_entity_id: &str,
        unit_key: &str,
    ) -> Result<JsonValue, TaskError>;
}

pub struct ContentAnalysisHandler {
    backend: Arc<dyn AnalysisBackend>,
}

impl ContentAnalysisHandler {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TaskHandler for ContentAnalysisHandler {
    fn kind(&self) -> JobKind {
        JobKind::ContentAnalysis
    }

    fn dependency(&self) -> &'static str {
        ANALYSIS_DEPENDENCY
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), TaskError> {
        let JobPayload::ContentAnalysis {
            target_entity_id, ..
        } = &ctx.payload
        else {
            return Err(TaskError::permanent("payload is not a content analysis"));
        };

        let pending = ctx.lifecycle().pending_units(ctx.job_id).await?;
        debug!(pending = pending.len(), attempt = ctx.attempt, "Resuming analysis");

        for unit in pending {
            ctx.checkpoint()?;
            match self
                .backend
                .analyze_unit(target_entity_id, &unit.unit_key)
                .await
            {
                Ok(result) => {
                    ctx.lifecycle()
                        .record_unit_success(ctx.job_id, &unit.unit_key, result)
                        .await?;
                }
                Err(err) if err.kind == TaskErrorKind::Permanent => {
                    warn!(unit_key = %unit.unit_key, error = %err, "Unit failed permanently");
                    ctx.lifecycle()
                        .record_unit_failure(ctx.job_id, &unit.unit_key, &err.message)
                        .await?;
                }
                // Unit stays pending for the next attempt.
                Err(err) => return Err(err),
            }
            ctx.heartbeat().await?;
        }

        match ctx.lifecycle().finalize_analysis(ctx.job_id).await? {
            AnalysisStatus::Completed => Ok(()),
            status => {
                let analysis = ctx.lifecycle().get_analysis(ctx.job_id).await?;
                let reason = analysis
                    .and_then(|analysis| analysis.failure_reason)
                    .unwrap_or_else(|| format!("analysis finished as {status}"));
                Err(TaskError::permanent(reason))
            }
        }
    }
}

/// Re-runs a single unit of a `repair_needed` analysis and completes the repair once every
/// unit has succeeded. Running it for a unit that already succeeded only re-checks completion.
pub struct UnitReprocessHandler {
    backend: Arc<dyn AnalysisBackend>,
}

impl UnitReprocessHandler {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TaskHandler for UnitReprocessHandler {
    fn kind(&self) -> JobKind {
        JobKind::UnitReprocess
    }

    fn dependency(&self) -> &'static str {
        ANALYSIS_DEPENDENCY
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), TaskError> {
        let JobPayload::UnitReprocess {
            analysis_job_id,
            unit_key,
        } = &ctx.payload
        else {
            return Err(TaskError::permanent("payload is not a unit reprocess"));
        };
        let analysis_job_id = *analysis_job_id;

        let Some(analysis) = ctx.lifecycle().get_analysis(analysis_job_id).await? else {
            return Err(TaskError::permanent(format!(
                "analysis {analysis_job_id} no longer exists"
            )));
        };
        if analysis.analysis_status() != Some(AnalysisStatus::RepairNeeded) {
            debug!(status = %analysis.status, "Analysis no longer needs repair");
            return Ok(());
        }

        let units = ctx.lifecycle().list_units(analysis_job_id).await?;
        let Some(unit) = units.iter().find(|unit| &unit.unit_key == unit_key) else {
            return Err(TaskError::permanent(format!(
                "unit '{unit_key}' does not belong to analysis {analysis_job_id}"
            )));
        };

        if !unit.is_succeeded() {
            ctx.checkpoint()?;
            match self
                .backend
                .analyze_unit(&analysis.target_entity_id, unit_key)
                .await
            {
                Ok(result) => {
                    ctx.lifecycle()
                        .record_unit_success(analysis_job_id, unit_key, result)
                        .await?;
                }
                Err(err) if err.kind == TaskErrorKind::Permanent => {
                    ctx.lifecycle()
                        .record_unit_failure(analysis_job_id, unit_key, &err.message)
                        .await?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
            ctx.heartbeat().await?;
        }

        if ctx
            .lifecycle()
            .complete_repair(analysis_job_id, "repaired: missing units reprocessed")
            .await?
        {
            info!(analysis_job_id = %analysis_job_id, "Repair completed by unit reprocess");
        }
        Ok(())
    }
}
