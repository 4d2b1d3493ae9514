//! Background task execution.
//!
//! A [`Task`] is a unit of cancellable, timeout-bounded, progress-reporting
//! work. Tasks are handed to a [`TaskCoordinator`], which validates them, runs
//! them on its worker pool and delivers their [`TaskResult`]s to an
//! [`EventProxy`]. Cancellation is cooperative: tasks call
//! [`TaskContext::checkpoint`] between units of work.

pub mod bulk_delete;
pub mod bulk_move;
pub mod bulk_rename;
pub mod context;
pub mod coordinator;
pub mod events;
pub mod metadata;
pub mod scan;
pub mod thumbnails;
pub mod timeout;
pub mod transaction;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::{TaskError, ValidationError};

pub use bulk_delete::BulkDeleteTask;
pub use bulk_move::BulkMoveTask;
pub use bulk_rename::BulkRenameTask;
pub use context::{ProgressThrottle, TaskContext, TaskHandle};
pub use coordinator::{TaskCoordinator, TaskState, TaskStatus};
pub use events::{BatchItem, EventProxy, Progress, TaskCallbacks, TaskEvent, TaskOutput, TaskResult};
pub use metadata::{ApplyTagsTask, LoadMetadataTask, SaveMetadataTask};
pub use scan::ScanFolderTask;
pub use thumbnails::GenerateThumbnailsTask;
pub use timeout::TimeoutTable;
pub use transaction::{RollbackReport, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Task families; each has its own timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Scan,
    Thumbnails,
    BulkMove,
    BulkDelete,
    BulkRename,
    MetadataLoad,
    MetadataSave,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Scan,
        TaskKind::Thumbnails,
        TaskKind::BulkMove,
        TaskKind::BulkDelete,
        TaskKind::BulkRename,
        TaskKind::MetadataLoad,
        TaskKind::MetadataSave,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskKind::Scan => "scan",
            TaskKind::Thumbnails => "thumbnails",
            TaskKind::BulkMove => "bulk_move",
            TaskKind::BulkDelete => "bulk_delete",
            TaskKind::BulkRename => "bulk_rename",
            TaskKind::MetadataLoad => "metadata_load",
            TaskKind::MetadataSave => "metadata_save",
        }
    }
}

/// A unit of background work.
///
/// Inputs are validated when the task is constructed; `validate` is called
/// once more by the coordinator right before submission so that state that
/// may have changed in between (a directory being removed) is caught before
/// the task reaches the pool.
pub trait Task: Send + 'static {
    fn kind(&self) -> TaskKind;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Input size used for the adaptive timeout.
    fn work_items(&self) -> usize {
        1
    }

    /// A fixed timeout that replaces the adaptive one.
    fn timeout_override(&self) -> Option<Duration> {
        None
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Does the work. Must call `ctx.checkpoint()` between units of work.
    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError>;
}
