//! Example backends
//!
//! Deterministic stand-ins for the scraping source and the AI analysis
//! service. Results are derived from a hash of the inputs so repeated runs
//! agree. Useful for local runs and as a reference for real backends.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};

use crate::tasks::analysis::AnalysisBackend;
use crate::tasks::media::MediaBackend;
use crate::tasks::trait_::TaskError;

fn fingerprint(parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

/// Scales a byte to `0.0..=1.0` with two decimals.
fn ratio(byte: u8) -> f64 {
    (f64::from(byte) / 255.0 * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default)]
pub struct ExampleMediaBackend {
    /// Simulated downstream latency per call
    pub latency: Duration,
}

#[async_trait]
impl MediaBackend for ExampleMediaBackend {
    async fn fetch_profile(&self, username: &str) -> Result<JsonValue, TaskError> {
        tokio::time::sleep(self.latency).await;
        let digest = fingerprint(&[username]);
        Ok(json!({
            "username": username,
            "followers": u32::from_be_bytes([0, digest[0], digest[1], digest[2]]),
            "posts": u16::from_be_bytes([digest[3], digest[4]]) % 2_000,
        }))
    }

    async fn process_media(&self, _profile_id: &str, media_id: &str) -> Result<(), TaskError> {
        tokio::time::sleep(self.latency).await;
        if media_id.trim().is_empty() {
            return Err(TaskError::permanent("media id is blank"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExampleAnalysisBackend {
    /// Simulated downstream latency per unit
    pub latency: Duration,
}

#[async_trait]
impl AnalysisBackend for ExampleAnalysisBackend {
    async fn analyze_unit(
        &self,
        target_entity_id: &str,
        unit_key: &str,
    ) -> Result<JsonValue, TaskError> {
        tokio::time::sleep(self.latency).await;
        let digest = fingerprint(&[target_entity_id, unit_key]);
        Ok(json!({
            "unit_key": unit_key,
            "sentiment": ratio(digest[0]),
            "engagement_rate": ratio(digest[1]),
            "brand_safety": ratio(digest[2]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn analysis_results_are_deterministic() {
        let backend = ExampleAnalysisBackend::default();
        let first = backend.analyze_unit("creator", "post-1").await.unwrap();
        let again = backend.analyze_unit("creator", "post-1").await.unwrap();
        let other = backend.analyze_unit("creator", "post-2").await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        let sentiment = first["sentiment"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&sentiment));
    }

    #[tokio::test]
    async fn blank_media_id_is_a_permanent_failure() {
        let backend = ExampleMediaBackend::default();
        let err = backend.process_media("p", " ").await.unwrap_err();
        assert!(!err.is_transient());
        assert!(backend.process_media("p", "m1").await.is_ok());
    }
}
