//! Task handler trait and execution context.
//!
//! Every downstream call made by a job goes through a [`TaskHandler`]. The
//! worker pool wraps `execute` with the dependency's circuit breaker, the job
//! timeout and the retry policy, so handlers only classify their failures.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lifecycle::{JobLifecycleTracker, LifecycleError};
use crate::tasks::payload::{JobKind, JobPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Downstream hiccup; retried with backoff and counted against the breaker.
    Transient,
    /// Bad input or a result that will not change on retry.
    Permanent,
    /// Cooperative stop (caller cancel, shutdown, or the job was failed elsewhere).
    Cancelled,
    /// Our own store failed. Retried like a transient error but never charged to the
    /// dependency's breaker.
    Internal,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskErrorKind::Transient => "transient",
            TaskErrorKind::Permanent => "permanent",
            TaskErrorKind::Cancelled => "cancelled",
            TaskErrorKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TaskErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TaskErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TaskErrorKind::Cancelled,
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TaskErrorKind::Internal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TaskErrorKind::Transient
    }
}

impl From<LifecycleError> for TaskError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Database(_) => TaskError::internal(err.to_string()),
            other => TaskError::permanent(other.to_string()),
        }
    }
}

/// What a handler sees of the job it runs. Owned by the worker, independent of any request.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub attempt: i32,
    pub payload: JobPayload,
    cancel: CancellationToken,
    lifecycle: Arc<JobLifecycleTracker>,
}

impl JobContext {
    pub fn new(
        job_id: Uuid,
        owner_id: Uuid,
        attempt: i32,
        payload: JobPayload,
        cancel: CancellationToken,
        lifecycle: Arc<JobLifecycleTracker>,
    ) -> Self {
        Self {
            job_id,
            owner_id,
            attempt,
            payload,
            cancel,
            lifecycle,
        }
    }

    pub fn lifecycle(&self) -> &JobLifecycleTracker {
        &self.lifecycle
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sub-unit boundary: fail with `Cancelled` if a stop was requested.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::cancelled("cancelled at sub-unit boundary"));
        }
        Ok(())
    }

    /// Record liveness. Fails with `Cancelled` when the job is no longer running, e.g. after the
    /// validator forced it to Failed.
    pub async fn heartbeat(&self) -> Result<(), TaskError> {
        if self.lifecycle.heartbeat(self.job_id).await? {
            Ok(())
        } else {
            Err(TaskError::cancelled("job is no longer running"))
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Name of the downstream dependency this handler contacts; one circuit breaker per name.
    fn dependency(&self) -> &'static str;

    async fn execute(&self, ctx: &JobContext) -> Result<(), TaskError>;
}
