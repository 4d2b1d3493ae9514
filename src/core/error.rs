//! Defines the error types shared by the task, cache and store layers.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::tasks::TaskId;

/// Bad task input, detected at construction or in `Task::validate`.
///
/// A `ValidationError` never reaches the worker pool: submission is aborted
/// before the task is handed over.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The task was given nothing to work on.
    #[error("No {0} given")]
    Empty(&'static str),

    /// A path that must be a directory is not one.
    #[error("Path is not a valid directory: {0}")]
    NotADirectory(PathBuf),

    /// A path that must exist does not.
    #[error("Path does not exist: {0}")]
    Missing(PathBuf),

    /// Thumbnail dimensions must both be non-zero.
    #[error("Invalid thumbnail size {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Two entries of one bulk operation would write the same target.
    #[error("Duplicate target path: {0}")]
    DuplicateTarget(PathBuf),

    /// Any other rule a concrete task enforces.
    #[error("{0}")]
    Invalid(String),
}

/// Why a task stopped before finishing its work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit `cancel`/`cancel_all` from the caller.
    User,
    /// A newer submission on the same coordinator replaced this task.
    Superseded,
    /// The memory circuit breaker opened.
    ResourceExhausted { used_mb: u64, limit_mb: u64 },
    /// The coordinator is shutting down.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::User => write!(f, "cancelled by the user"),
            CancelReason::Superseded => write!(f, "replaced by a newer task"),
            CancelReason::ResourceExhausted { used_mb, limit_mb } => write!(
                f,
                "stopped to protect memory: {} MB in use, limit is {} MB",
                used_mb, limit_mb
            ),
            CancelReason::Shutdown => write!(f, "stopped because the application is shutting down"),
        }
    }
}

/// How a task run ended when it did not finish normally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The cancellation flag was observed at a yield point.
    #[error("Task was cancelled: {0}")]
    Cancelled(CancelReason),

    /// The adaptive timeout elapsed. Reported apart from failures so callers can retry with more time.
    #[error("Task timed out after {elapsed:?} (budget {budget:?})")]
    TimedOut { elapsed: Duration, budget: Duration },

    /// Any error raised while running. Never propagates past the task boundary.
    #[error("Task failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        TaskError::Failed(error.to_string())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        TaskError::Failed(format!("{:#}", error))
    }
}

impl From<LockError> for TaskError {
    fn from(error: LockError) -> Self {
        TaskError::Failed(error.to_string())
    }
}

impl From<StoreError> for TaskError {
    fn from(error: StoreError) -> Self {
        TaskError::Failed(error.to_string())
    }
}

/// Errors returned synchronously by `TaskCoordinator::submit`.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid task input: {0}")]
    Validation(#[from] ValidationError),

    /// The previous task did not yield within the grace period.
    #[error("Task {active} is still running and did not stop within {grace:?}")]
    Busy { active: TaskId, grace: Duration },

    /// The memory circuit breaker is open.
    #[error("Memory limit reached ({used_mb} MB of {limit_mb} MB); try again once memory is freed")]
    ResourceExhausted { used_mb: u64, limit_mb: u64 },

    /// The worker pool was shut down or could not take the task.
    #[error("Worker pool unavailable: {0}")]
    PoolUnavailable(String),
}

/// Misuse of the named resource locks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// A thread asked for a second named lock while already holding one.
    #[error("Lock '{requested}' requested while '{held}' is held")]
    Nested {
        held: &'static str,
        requested: &'static str,
    },
}

/// Errors from the metadata store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error for path {1}: {0}")]
    Io(#[source] std::io::Error, PathBuf),

    #[error("Metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace metadata file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// A failed step of a `Transaction`, after the rollback has run.
#[derive(Debug, Error)]
#[error("Step '{step}' failed: {source:#}; {rollback}")]
pub struct TransactionError {
    pub step: String,
    #[source]
    pub source: anyhow::Error,
    pub rollback: crate::tasks::transaction::RollbackReport,
}

/// Errors from the thumbnail collaborator.
#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("Failed to decode {1}: {0}")]
    Decode(#[source] image::ImageError, PathBuf),

    #[error("Invalid thumbnail size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}
