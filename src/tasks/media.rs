//! Profile scraping and media processing handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::tasks::payload::{JobKind, JobPayload};
use crate::tasks::trait_::{JobContext, TaskError, TaskErrorKind, TaskHandler};

/// Breaker name for the profile scraping source.
pub const SCRAPER_DEPENDENCY: &str = "instagram";
/// Breaker name for media storage and transcoding.
pub const MEDIA_DEPENDENCY: &str = "media_storage";

/// Downstream scraping and media pipeline.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn fetch_profile(&self, username: &str) -> Result<JsonValue, TaskError>;

    async fn process_media(&self, profile_id: &str, media_id: &str) -> Result<(), TaskError>;
}

pub struct ProfileScrapeHandler {
    backend: Arc<dyn MediaBackend>,
}

impl ProfileScrapeHandler {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TaskHandler for ProfileScrapeHandler {
    fn kind(&self) -> JobKind {
        JobKind::ProfileScrape
    }

    fn dependency(&self) -> &'static str {
        SCRAPER_DEPENDENCY
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), TaskError> {
        let JobPayload::ProfileScrape { username } = &ctx.payload else {
            return Err(TaskError::permanent("payload is not a profile scrape"));
        };
        ctx.checkpoint()?;
        let profile = self.backend.fetch_profile(username).await?;
        debug!(
            username = %username,
            fields = profile.as_object().map(|fields| fields.len()).unwrap_or(0),
            "Profile fetched"
        );
        ctx.heartbeat().await
    }
}

/// Processes every media item of a batch. A permanently failed item fails the job once the rest
/// of the batch has been attempted; a transient failure aborts the attempt for retry.
pub struct MediaProcessingHandler {
    backend: Arc<dyn MediaBackend>,
}

impl MediaProcessingHandler {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TaskHandler for MediaProcessingHandler {
    fn kind(&self) -> JobKind {
        JobKind::MediaProcessing
    }

    fn dependency(&self) -> &'static str {
        MEDIA_DEPENDENCY
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), TaskError> {
        let JobPayload::MediaProcessing {
            profile_id,
            media_ids,
        } = &ctx.payload
        else {
            return Err(TaskError::permanent("payload is not a media batch"));
        };

        let mut failed = Vec::new();
        for media_id in media_ids {
            ctx.checkpoint()?;
            match self.backend.process_media(profile_id, media_id).await {
                Ok(()) => {}
                Err(err) if err.kind == TaskErrorKind::Permanent => {
                    warn!(media_id = %media_id, error = %err, "Media item failed permanently");
                    failed.push(media_id.as_str());
                }
                Err(err) => return Err(err),
            }
            ctx.heartbeat().await?;
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(TaskError::permanent(format!(
                "{} of {} media items failed: {}",
                failed.len(),
                media_ids.len(),
                failed.join(", ")
            )))
        }
    }
}
