//! Task registry
//!
//! Instance-owned map from job kind to handler, built once at startup and
//! injected into the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::tasks::analysis::{AnalysisBackend, ContentAnalysisHandler, UnitReprocessHandler};
use crate::tasks::media::{MediaBackend, MediaProcessingHandler, ProfileScrapeHandler};
use crate::tasks::payload::JobKind;
use crate::tasks::trait_::TaskHandler;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("no handler registered for job kind '{kind}'")]
    HandlerNotFound { kind: JobKind },
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<JobKind, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in handlers over the given backends.
    pub fn with_backends(media: Arc<dyn MediaBackend>, analysis: Arc<dyn AnalysisBackend>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ProfileScrapeHandler::new(media.clone())));
        registry.register(Arc::new(MediaProcessingHandler::new(media)));
        registry.register(Arc::new(ContentAnalysisHandler::new(analysis.clone())));
        registry.register(Arc::new(UnitReprocessHandler::new(analysis)));
        registry
    }

    /// Register a handler, replacing any previous handler of the same kind.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let kind = handler.kind();
        debug!(kind = %kind, dependency = handler.dependency(), "Registered task handler");
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: JobKind) -> Result<Arc<dyn TaskHandler>, RegistryError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(RegistryError::HandlerNotFound { kind })
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::example::{ExampleAnalysisBackend, ExampleMediaBackend};

    #[test]
    fn built_in_registry_covers_every_kind() {
        let registry = TaskRegistry::with_backends(
            Arc::new(ExampleMediaBackend::default()),
            Arc::new(ExampleAnalysisBackend::default()),
        );
        assert_eq!(registry.kinds().len(), 4);
        for kind in registry.kinds() {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn empty_registry_reports_missing_handler() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.get(JobKind::ProfileScrape),
            Err(RegistryError::HandlerNotFound {
                kind: JobKind::ProfileScrape
            })
        ));
    }
}
