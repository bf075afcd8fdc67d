//! # Consistency Validator
//!
//! Periodic and on-demand pass that compares recorded state with the data
//! behind it:
//!
//! - running analyses and jobs whose heartbeat is overdue are forced to
//!   `failed` (reason `heartbeat timeout`) and their reservations refunded;
//! - every `completed` analysis must have all units succeeded and an aggregate
//!   whose `unit_count` matches; a mismatch is logged as a consistency issue
//!   and the analysis is downgraded to `repair_needed`;
//! - reservations still `reserved` past their TTL are settled from their job's
//!   outcome once the job is no longer active;
//! - terminal records past the retention window are purged.
//!
//! Repair either recomputes the aggregate from stored unit results or
//! resubmits the missing units as `unit_reprocess` jobs. Both paths converge
//! on the same final state when run more than once.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{ConsistencyConfig, LifecycleConfig};
use crate::credit_gate::CreditGate;
use crate::engine::{EngineError, JobSubmitter, SubmitRequest};
use crate::lifecycle::JobLifecycleTracker;
use crate::models::analysis_aggregate::Model as AggregateModel;
use crate::models::analysis_job::Model as AnalysisModel;
use crate::models::analysis_unit::Model as UnitModel;
use crate::models::{AnalysisStatus, IssueType, Priority};
use crate::repositories::ConsistencyIssueRepository;
use crate::tasks::JobPayload;

pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// What `POST /consistency/repair?target=` points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTarget {
    All,
    /// An analysis job id or a consistency issue id
    Id(Uuid),
}

impl FromStr for RepairTarget {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") {
            return Ok(RepairTarget::All);
        }
        Uuid::parse_str(value)
            .map(RepairTarget::Id)
            .map_err(|_| format!("repair target must be 'all' or a UUID, got '{value}'"))
    }
}

impl fmt::Display for RepairTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairTarget::All => f.write_str("all"),
            RepairTarget::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Counters of one validator pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ScanReport {
    /// Running jobs forced to failed for an overdue heartbeat
    pub hung_jobs_failed: u64,
    pub analyses_checked: u64,
    pub issues_detected: u64,
    /// Completed analyses downgraded to repair_needed
    pub analyses_downgraded: u64,
    /// repair_needed analyses that turned out consistent and were restored
    pub analyses_restored: u64,
    pub reservations_refunded: u64,
    /// Expired holds of succeeded jobs whose commit never landed
    pub reservations_committed: u64,
    pub records_purged: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Aggregate rebuilt from stored unit results; analysis completed again
    Recomputed,
    /// Missing units submitted as reprocess jobs
    UnitsResubmitted,
    /// Nothing to do; the analysis is consistent
    AlreadyConsistent,
    /// Not in a repairable state (pending, running or failed)
    NotRepairable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RepairOutcome {
    pub analysis_job_id: Uuid,
    pub action: RepairAction,
    /// Reprocess jobs covering the missing units, new or already in flight
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reprocess_job_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RepairReport {
    pub target: String,
    pub recomputed: u64,
    pub resubmitted: u64,
    pub already_consistent: u64,
    pub not_repairable: u64,
    pub outcomes: Vec<RepairOutcome>,
}

impl RepairReport {
    fn push(&mut self, outcome: RepairOutcome) {
        match outcome.action {
            RepairAction::Recomputed => self.recomputed += 1,
            RepairAction::UnitsResubmitted => self.resubmitted += 1,
            RepairAction::AlreadyConsistent => self.already_consistent += 1,
            RepairAction::NotRepairable => self.not_repairable += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// A detected mismatch for one analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub issue_type: IssueType,
    pub details: JsonValue,
}

/// Check a completed analysis against its units and aggregate.
pub fn check_analysis(
    analysis: &AnalysisModel,
    units: &[UnitModel],
    aggregate: Option<&AggregateModel>,
) -> Option<Finding> {
    let succeeded = units.iter().filter(|unit| unit.is_succeeded()).count() as i32;

    if units.len() as i32 != analysis.units_total || succeeded != analysis.units_total {
        let missing: Vec<&str> = units
            .iter()
            .filter(|unit| !unit.is_succeeded())
            .map(|unit| unit.unit_key.as_str())
            .collect();
        return Some(Finding {
            issue_type: IssueType::IncompleteUnits,
            details: json!({
                "units_total": analysis.units_total,
                "units_found": units.len(),
                "units_succeeded": succeeded,
                "unsuccessful_units": missing,
            }),
        });
    }

    match aggregate {
        None => Some(Finding {
            issue_type: IssueType::AggregateMissing,
            details: json!({ "units_succeeded": succeeded }),
        }),
        Some(aggregate) if aggregate.unit_count != succeeded => Some(Finding {
            issue_type: IssueType::AggregateCountMismatch,
            details: json!({
                "aggregate_unit_count": aggregate.unit_count,
                "units_succeeded": succeeded,
            }),
        }),
        Some(_) => None,
    }
}

pub struct ConsistencyValidator {
    lifecycle: Arc<JobLifecycleTracker>,
    credits: CreditGate,
    issues: ConsistencyIssueRepository,
    submitter: Arc<JobSubmitter>,
    scan_interval: Duration,
    batch_size: u64,
    reservation_ttl: Duration,
    retention: Duration,
    /// Serialises scheduled and operator-triggered passes.
    pass_lock: Mutex<()>,
}

impl ConsistencyValidator {
    pub fn new(
        config: &ConsistencyConfig,
        lifecycle_config: &LifecycleConfig,
        lifecycle: Arc<JobLifecycleTracker>,
        credits: CreditGate,
        issues: ConsistencyIssueRepository,
        submitter: Arc<JobSubmitter>,
    ) -> Self {
        Self {
            lifecycle,
            credits,
            issues,
            submitter,
            scan_interval: config.scan_interval(),
            batch_size: config.batch_size.max(1),
            reservation_ttl: config.reservation_ttl(),
            retention: Duration::from_secs(u64::from(lifecycle_config.retention_days) * 86_400),
            pass_lock: Mutex::new(()),
        }
    }

    /// Run scans on the configured interval until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_s = self.scan_interval.as_secs(),
            "Starting consistency validator"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Consistency validator shutdown requested");
                    break;
                }
                _ = sleep(self.scan_interval) => {
                    if let Err(err) = self.scan().await {
                        error!(error = %err, "Consistency scan failed");
                    }
                }
            }
        }
        info!("Consistency validator stopped");
    }

    /// One full validation pass.
    #[instrument(skip(self))]
    pub async fn scan(&self) -> Result<ScanReport, EngineError> {
        let _pass = self.pass_lock.lock().await;
        let started = Instant::now();
        let mut report = ScanReport::default();

        report.hung_jobs_failed = self.fail_hung_jobs().await?;
        self.check_completed(&mut report).await?;
        self.recheck_repair_needed(&mut report).await?;

        let expired = self
            .credits
            .settle_expired(self.reservation_ttl, self.batch_size)
            .await?;
        report.reservations_refunded = expired.refunded.len() as u64;
        report.reservations_committed = expired.committed.len() as u64;
        report.records_purged = self
            .lifecycle
            .purge_expired(self.retention, self.batch_size)
            .await?;

        let elapsed = started.elapsed();
        histogram!("consistency_scan_duration_ms").record(elapsed.as_secs_f64() * 1_000.0);
        report.duration_ms = elapsed.as_millis() as u64;

        debug!(
            hung = report.hung_jobs_failed,
            checked = report.analyses_checked,
            issues = report.issues_detected,
            downgraded = report.analyses_downgraded,
            restored = report.analyses_restored,
            refunded = report.reservations_refunded,
            committed = report.reservations_committed,
            purged = report.records_purged,
            "Consistency scan completed"
        );
        Ok(report)
    }

    /// Force overdue running jobs to failed and refund them. Hung analyses and stale plain jobs
    /// are both covered; an analysis job shows up in both lists and is handled once.
    async fn fail_hung_jobs(&self) -> Result<u64, EngineError> {
        let mut job_ids: BTreeSet<Uuid> = BTreeSet::new();
        for analysis in self.lifecycle.find_hung_analyses(self.batch_size).await? {
            job_ids.insert(analysis.job_id);
        }
        for job in self.lifecycle.find_stale_jobs(self.batch_size).await? {
            job_ids.insert(job.id);
        }

        let mut failed = 0;
        for job_id in job_ids {
            let Some(job) = self.lifecycle.find_job(job_id).await? else {
                continue;
            };
            if self
                .lifecycle
                .mark_job_failed(job_id, HEARTBEAT_TIMEOUT_REASON)
                .await?
            {
                failed += 1;
                warn!(job_id = %job_id, last_heartbeat_at = ?job.last_heartbeat_at, "Hung job failed");
            }
            if let Some(reservation_id) = job.reservation_id {
                self.credits
                    .settle_for_job(reservation_id, job_id, HEARTBEAT_TIMEOUT_REASON)
                    .await?;
            }
        }
        Ok(failed)
    }

    async fn check_completed(&self, report: &mut ScanReport) -> Result<(), EngineError> {
        let mut after: Option<(DateTime<FixedOffset>, Uuid)> = None;
        loop {
            let page = self
                .lifecycle
                .completed_analyses(after, self.batch_size)
                .await?;
            let page_len = page.len() as u64;

            for analysis in page {
                after = Some((analysis.created_at, analysis.job_id));
                report.analyses_checked += 1;

                let Some(finding) = self.inspect(&analysis).await? else {
                    continue;
                };
                let (_, created) = self
                    .issues
                    .record(analysis.job_id, finding.issue_type, Some(finding.details))
                    .await?;
                if created {
                    report.issues_detected += 1;
                    counter!("consistency_issues_detected_total", "issue_type" => finding.issue_type.as_str())
                        .increment(1);
                }
                if self
                    .lifecycle
                    .mark_repair_needed(analysis.job_id, &format!("consistency issue: {}", finding.issue_type))
                    .await?
                {
                    report.analyses_downgraded += 1;
                }
            }

            if page_len < self.batch_size {
                return Ok(());
            }
        }
    }

    /// `repair_needed` analyses either get an open issue (when none is tracked) or, when they
    /// check out as consistent, are restored to completed.
    async fn recheck_repair_needed(&self, report: &mut ScanReport) -> Result<(), EngineError> {
        let mut after: Option<(DateTime<FixedOffset>, Uuid)> = None;
        loop {
            let page = self
                .lifecycle
                .analyses_with_status(AnalysisStatus::RepairNeeded, after, self.batch_size)
                .await?;
            let page_len = page.len() as u64;

            for analysis in page {
                after = Some((analysis.created_at, analysis.job_id));
                match self.inspect(&analysis).await? {
                    None => {
                        if self
                            .lifecycle
                            .complete_repair(analysis.job_id, "revalidated: consistent")
                            .await?
                        {
                            report.analyses_restored += 1;
                        }
                    }
                    Some(finding) => {
                        if self.issues.has_open(analysis.job_id).await? {
                            continue;
                        }
                        let (_, created) = self
                            .issues
                            .record(analysis.job_id, finding.issue_type, Some(finding.details))
                            .await?;
                        if created {
                            report.issues_detected += 1;
                            counter!("consistency_issues_detected_total", "issue_type" => finding.issue_type.as_str())
                                .increment(1);
                        }
                    }
                }
            }

            if page_len < self.batch_size {
                return Ok(());
            }
        }
    }

    async fn inspect(&self, analysis: &AnalysisModel) -> Result<Option<Finding>, EngineError> {
        let units = self.lifecycle.list_units(analysis.job_id).await?;
        let aggregate = self.lifecycle.get_aggregate(analysis.job_id).await?;
        Ok(check_analysis(analysis, &units, aggregate.as_ref()))
    }

    /// Repair one analysis (by analysis or issue id) or everything currently flagged.
    #[instrument(skip(self), fields(target = %target))]
    pub async fn repair(&self, target: RepairTarget) -> Result<RepairReport, EngineError> {
        let _pass = self.pass_lock.lock().await;
        let mut report = RepairReport {
            target: target.to_string(),
            ..RepairReport::default()
        };

        match target {
            RepairTarget::Id(id) => {
                let analysis_job_id = match self.issues.find_by_id(id).await? {
                    Some(issue) => issue.entity_id,
                    None => id,
                };
                let Some(analysis) = self.lifecycle.get_analysis(analysis_job_id).await? else {
                    return Err(EngineError::NotFound(format!(
                        "no analysis or consistency issue with id {id}"
                    )));
                };
                report.push(self.repair_analysis(analysis).await?);
            }
            RepairTarget::All => {
                for analysis_job_id in self.repair_candidates().await? {
                    let Some(analysis) = self.lifecycle.get_analysis(analysis_job_id).await? else {
                        continue;
                    };
                    match self.repair_analysis(analysis).await {
                        Ok(outcome) => report.push(outcome),
                        Err(err) => {
                            error!(analysis_job_id = %analysis_job_id, error = %err, "Repair failed");
                        }
                    }
                }
            }
        }

        info!(
            recomputed = report.recomputed,
            resubmitted = report.resubmitted,
            already_consistent = report.already_consistent,
            not_repairable = report.not_repairable,
            "Repair pass completed"
        );
        Ok(report)
    }

    async fn repair_candidates(&self) -> Result<Vec<Uuid>, EngineError> {
        let mut candidates: BTreeSet<Uuid> = self
            .issues
            .open_entity_ids(self.batch_size.saturating_mul(4))
            .await?
            .into_iter()
            .collect();

        let mut after: Option<(DateTime<FixedOffset>, Uuid)> = None;
        loop {
            let page = self
                .lifecycle
                .analyses_with_status(AnalysisStatus::RepairNeeded, after, self.batch_size)
                .await?;
            let page_len = page.len() as u64;
            for analysis in page {
                after = Some((analysis.created_at, analysis.job_id));
                candidates.insert(analysis.job_id);
            }
            if page_len < self.batch_size {
                return Ok(candidates.into_iter().collect());
            }
        }
    }

    async fn repair_analysis(&self, analysis: AnalysisModel) -> Result<RepairOutcome, EngineError> {
        let analysis_job_id = analysis.job_id;
        let outcome = |action| RepairOutcome {
            analysis_job_id,
            action,
            reprocess_job_ids: Vec::new(),
        };

        match analysis.analysis_status() {
            Some(AnalysisStatus::Completed) => {
                // Not yet seen by a scan: classify it first.
                let Some(finding) = self.inspect(&analysis).await? else {
                    self.issues
                        .resolve_for_entity(analysis_job_id, "revalidated: consistent")
                        .await?;
                    return Ok(outcome(RepairAction::AlreadyConsistent));
                };
                self.issues
                    .record(analysis_job_id, finding.issue_type, Some(finding.details))
                    .await?;
                self.lifecycle
                    .mark_repair_needed(
                        analysis_job_id,
                        &format!("consistency issue: {}", finding.issue_type),
                    )
                    .await?;
            }
            Some(AnalysisStatus::RepairNeeded) => {}
            _ => return Ok(outcome(RepairAction::NotRepairable)),
        }

        // Cheap path: every unit has a stored result, only the aggregate is off.
        if self
            .lifecycle
            .complete_repair(analysis_job_id, "repaired: aggregate recomputed from unit data")
            .await?
        {
            info!(analysis_job_id = %analysis_job_id, "Aggregate recomputed");
            return Ok(outcome(RepairAction::Recomputed));
        }

        // Expensive path: recreate lost unit rows, then resubmit every unit without a
        // successful result.
        self.lifecycle
            .restore_missing_units(analysis_job_id)
            .await?;
        let units = self.lifecycle.list_units(analysis_job_id).await?;
        let mut reprocess_job_ids = Vec::new();
        for unit in units.iter().filter(|unit| !unit.is_succeeded()) {
            let submitted = self
                .submitter
                .submit(SubmitRequest {
                    owner_id: analysis.owner_id,
                    payload: JobPayload::UnitReprocess {
                        analysis_job_id,
                        unit_key: unit.unit_key.clone(),
                    },
                    priority: Priority::High,
                    cost: 0,
                })
                .await?;
            reprocess_job_ids.push(submitted.job_id);
        }

        if reprocess_job_ids.is_empty() {
            // Nothing left to rerun and still incomplete: the unit keys are gone with the payload.
            return Ok(outcome(RepairAction::NotRepairable));
        }
        info!(
            analysis_job_id = %analysis_job_id,
            units = reprocess_job_ids.len(),
            "Missing units resubmitted"
        );
        Ok(RepairOutcome {
            analysis_job_id,
            action: RepairAction::UnitsResubmitted,
            reprocess_job_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn analysis(units_total: i32) -> AnalysisModel {
        let now = Utc::now().fixed_offset();
        AnalysisModel {
            job_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            target_entity_id: "creator".to_string(),
            status: AnalysisStatus::Completed.as_str().to_string(),
            units_total,
            units_done: units_total,
            units_failed: 0,
            started_at: Some(now),
            last_heartbeat_at: Some(now),
            completed_at: Some(now),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn unit(job_id: Uuid, key: &str, status: &str) -> UnitModel {
        let now = Utc::now().fixed_offset();
        UnitModel {
            id: Uuid::new_v4(),
            analysis_job_id: job_id,
            unit_key: key.to_string(),
            position: 0,
            status: status.to_string(),
            result: Some(json!({ "unit_key": key })),
            error: None,
            processed_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    fn aggregate(job_id: Uuid, unit_count: i32) -> AggregateModel {
        AggregateModel {
            analysis_job_id: job_id,
            unit_count,
            summary: json!({}),
            computed_at: Utc::now().fixed_offset(),
        }
    }

    #[test]
    fn consistent_analysis_has_no_finding() {
        let record = analysis(2);
        let units = vec![
            unit(record.job_id, "a", "succeeded"),
            unit(record.job_id, "b", "succeeded"),
        ];
        let agg = aggregate(record.job_id, 2);
        assert_eq!(check_analysis(&record, &units, Some(&agg)), None);
    }

    #[test]
    fn missing_aggregate_is_detected() {
        let record = analysis(1);
        let units = vec![unit(record.job_id, "a", "succeeded")];
        let finding = check_analysis(&record, &units, None).unwrap();
        assert_eq!(finding.issue_type, IssueType::AggregateMissing);
    }

    #[test]
    fn count_mismatch_is_detected() {
        let record = analysis(2);
        let units = vec![
            unit(record.job_id, "a", "succeeded"),
            unit(record.job_id, "b", "succeeded"),
        ];
        let agg = aggregate(record.job_id, 1);
        let finding = check_analysis(&record, &units, Some(&agg)).unwrap();
        assert_eq!(finding.issue_type, IssueType::AggregateCountMismatch);
        assert_eq!(finding.details["aggregate_unit_count"], 1);
    }

    #[test]
    fn unsuccessful_or_missing_units_take_precedence() {
        let record = analysis(3);
        let units = vec![
            unit(record.job_id, "a", "succeeded"),
            unit(record.job_id, "b", "failed"),
        ];
        let agg = aggregate(record.job_id, 1);
        let finding = check_analysis(&record, &units, Some(&agg)).unwrap();
        assert_eq!(finding.issue_type, IssueType::IncompleteUnits);
        assert_eq!(finding.details["unsuccessful_units"], json!(["b"]));
        assert_eq!(finding.details["units_found"], 2);
    }

    #[test]
    fn repair_target_parses_all_and_ids() {
        assert_eq!("all".parse::<RepairTarget>().unwrap(), RepairTarget::All);
        assert_eq!(" ALL ".parse::<RepairTarget>().unwrap(), RepairTarget::All);
        let id = Uuid::new_v4();
        assert_eq!(
            id.to_string().parse::<RepairTarget>().unwrap(),
            RepairTarget::Id(id)
        );
        assert!("everything".parse::<RepairTarget>().is_err());
    }
}
