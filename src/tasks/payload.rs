//! Tagged job payloads and their identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use uuid::Uuid;

/// Upper bound on sub-units per analysis or media batch.
pub const MAX_UNITS_PER_JOB: usize = 1_000;

/// Work description, dispatched on its `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Fetch a creator profile.
    ProfileScrape { username: String },
    /// Push scraped media items of a profile through the processing pipeline.
    MediaProcessing {
        profile_id: String,
        media_ids: Vec<String>,
    },
    /// Multi-unit AI analysis of a creator's content; one unit per key.
    ContentAnalysis {
        target_entity_id: String,
        unit_keys: Vec<String>,
    },
    /// Re-run one unit of an existing analysis during repair.
    UnitReprocess {
        analysis_job_id: Uuid,
        unit_key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ProfileScrape,
    MediaProcessing,
    ContentAnalysis,
    UnitReprocess,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProfileScrape => "profile_scrape",
            JobKind::MediaProcessing => "media_processing",
            JobKind::ContentAnalysis => "content_analysis",
            JobKind::UnitReprocess => "unit_reprocess",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "profile_scrape" => Ok(JobKind::ProfileScrape),
            "media_processing" => Ok(JobKind::MediaProcessing),
            "content_analysis" => Ok(JobKind::ContentAnalysis),
            "unit_reprocess" => Ok(JobKind::UnitReprocess),
            other => Err(format!("unknown job kind '{other}'")),
        }
    }
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::ProfileScrape { .. } => JobKind::ProfileScrape,
            JobPayload::MediaProcessing { .. } => JobKind::MediaProcessing,
            JobPayload::ContentAnalysis { .. } => JobKind::ContentAnalysis,
            JobPayload::UnitReprocess { .. } => JobKind::UnitReprocess,
        }
    }

    /// Entity the job works on.
    pub fn target_entity_id(&self) -> String {
        match self {
            JobPayload::ProfileScrape { username } => username.clone(),
            JobPayload::MediaProcessing { profile_id, .. } => profile_id.clone(),
            JobPayload::ContentAnalysis {
                target_entity_id, ..
            } => target_entity_id.clone(),
            JobPayload::UnitReprocess {
                analysis_job_id, ..
            } => analysis_job_id.to_string(),
        }
    }

    /// Returns a list of human-readable problems; empty when the payload is acceptable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match self {
            JobPayload::ProfileScrape { username } => {
                if username.trim().is_empty() {
                    problems.push("username must not be empty".to_string());
                }
            }
            JobPayload::MediaProcessing {
                profile_id,
                media_ids,
            } => {
                if profile_id.trim().is_empty() {
                    problems.push("profile_id must not be empty".to_string());
                }
                check_units("media_ids", media_ids, &mut problems);
            }
            JobPayload::ContentAnalysis {
                target_entity_id,
                unit_keys,
            } => {
                if target_entity_id.trim().is_empty() {
                    problems.push("target_entity_id must not be empty".to_string());
                }
                check_units("unit_keys", unit_keys, &mut problems);
            }
            JobPayload::UnitReprocess { unit_key, .. } => {
                if unit_key.trim().is_empty() {
                    problems.push("unit_key must not be empty".to_string());
                }
            }
        }
        problems
    }

    /// Payload identity: hex SHA-256 over the owner id and the canonical payload JSON.
    /// `serde_json` maps serialize with sorted keys, so equal payloads hash equally.
    pub fn dedup_key(&self, owner_id: Uuid) -> String {
        let canonical = serde_json::to_value(self)
            .map(|value| value.to_string())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(owner_id.as_bytes());
        hasher.update(b":");
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn check_units(field: &str, keys: &[String], problems: &mut Vec<String>) {
    if keys.is_empty() {
        problems.push(format!("{field} must not be empty"));
    }
    if keys.len() > MAX_UNITS_PER_JOB {
        problems.push(format!(
            "{field} may hold at most {MAX_UNITS_PER_JOB} entries"
        ));
    }
    if keys.iter().any(|key| key.trim().is_empty()) {
        problems.push(format!("{field} must not contain blank entries"));
    }
    let mut seen = std::collections::HashSet::new();
    if keys.iter().any(|key| !seen.insert(key.as_str())) {
        problems.push(format!("{field} must not contain duplicates"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_uses_type_tag() {
        let payload: JobPayload = serde_json::from_value(json!({
            "type": "content_analysis",
            "target_entity_id": "creator-7",
            "unit_keys": ["post-1", "post-2"]
        }))
        .unwrap();
        assert_eq!(payload.kind(), JobKind::ContentAnalysis);
        assert_eq!(payload.target_entity_id(), "creator-7");

        let unknown = serde_json::from_value::<JobPayload>(json!({"type": "avatar_upload"}));
        assert!(unknown.is_err());
    }

    #[test]
    fn dedup_key_depends_on_owner_and_payload_only() {
        let owner = Uuid::new_v4();
        let a = JobPayload::ProfileScrape {
            username: "alice".into(),
        };
        let b = JobPayload::ProfileScrape {
            username: "alice".into(),
        };
        let c = JobPayload::ProfileScrape {
            username: "bob".into(),
        };

        assert_eq!(a.dedup_key(owner), b.dedup_key(owner));
        assert_ne!(a.dedup_key(owner), c.dedup_key(owner));
        assert_ne!(a.dedup_key(owner), a.dedup_key(Uuid::new_v4()));
        assert_eq!(a.dedup_key(owner).len(), 64);
    }

    #[test]
    fn validation_reports_each_problem() {
        let payload = JobPayload::ContentAnalysis {
            target_entity_id: " ".into(),
            unit_keys: vec!["a".into(), "a".into(), "".into()],
        };
        let problems = payload.validate();
        assert_eq!(problems.len(), 3, "{problems:?}");

        let ok = JobPayload::MediaProcessing {
            profile_id: "p1".into(),
            media_ids: vec!["m1".into()],
        };
        assert!(ok.validate().is_empty());
    }

    #[test]
    fn kind_round_trips_through_storage_string() {
        for kind in [
            JobKind::ProfileScrape,
            JobKind::MediaProcessing,
            JobKind::ContentAnalysis,
            JobKind::UnitReprocess,
        ] {
            assert_eq!(kind.as_str().parse::<JobKind>(), Ok(kind));
        }
    }
}
