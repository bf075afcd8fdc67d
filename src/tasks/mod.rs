//! Tasks module
//!
//! Typed job payloads and the handlers that execute them:
//! - `payload`: the tagged `JobPayload` union and payload identity
//! - `trait_`: the `TaskHandler` interface, `JobContext` and the `TaskError` taxonomy
//! - `registry`: kind to handler lookup injected into the worker pool
//! - handler implementations for profile scraping, media processing and analysis

pub mod analysis;
pub mod example;
pub mod media;
pub mod payload;
pub mod registry;
pub mod trait_;

pub use analysis::{AnalysisBackend, ContentAnalysisHandler, UnitReprocessHandler};
pub use example::{ExampleAnalysisBackend, ExampleMediaBackend};
pub use media::{MediaBackend, MediaProcessingHandler, ProfileScrapeHandler};
pub use payload::{JobKind, JobPayload};
pub use registry::{RegistryError, TaskRegistry};
pub use trait_::{JobContext, TaskError, TaskErrorKind, TaskHandler};
