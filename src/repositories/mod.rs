//! # Repository Layer
//!
//! Read-side and bookkeeping queries that sit beside the engine components:
//! job listings for operators and the consistency issue log.

pub mod consistency_issue;
pub mod job;

pub use consistency_issue::ConsistencyIssueRepository;
pub use job::{JobListFilter, JobRepository};
