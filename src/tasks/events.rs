//! Results a task emits and the sinks that receive them.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use super::TaskId;
use crate::core::{CancelReason, FilePair, Metadata, OperationSummary, ScanReport, TaskError};

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub percent: u8,
    pub done: usize,
    pub total: usize,
    pub message: String,
}

/// An item delivered ahead of the final result.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    Pair(FilePair),
    Thumbnail {
        path: PathBuf,
        width: u32,
        height: u32,
    },
    Processed(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Scan(ScanReport),
    Summary(OperationSummary),
    Metadata(Metadata),
    Unit,
}

/// Everything a task can report. `Finished`, `Failed`, `TimedOut` and
/// `Cancelled` are terminal: exactly one is delivered per task and nothing
/// follows it.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Progress(Progress),
    PartialBatch(Vec<BatchItem>),
    Finished(TaskOutput),
    Failed(String),
    TimedOut { elapsed: Duration, budget: Duration },
    Cancelled(CancelReason),
}

impl TaskResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskResult::Progress(_) | TaskResult::PartialBatch(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub result: TaskResult,
}

/// Receives task events. "Fire-and-forget": delivery problems are logged, not returned.
pub trait EventProxy: Send + Sync + 'static {
    fn send_event(&self, event: TaskEvent);
}

impl EventProxy for mpsc::UnboundedSender<TaskEvent> {
    fn send_event(&self, event: TaskEvent) {
        if let Err(e) = self.send(event) {
            tracing::warn!("Failed to deliver task event, receiver dropped: {:?}", e.0.result);
        }
    }
}

impl EventProxy for std::sync::mpsc::Sender<TaskEvent> {
    fn send_event(&self, event: TaskEvent) {
        if let Err(e) = self.send(event) {
            tracing::warn!("Failed to deliver task event, receiver dropped: {:?}", e.0.result);
        }
    }
}

type Callback<T> = Box<dyn Fn(TaskId, T) + Send + Sync>;

/// Per-result-kind callbacks. Unset callbacks ignore their events.
#[derive(Default)]
pub struct TaskCallbacks {
    on_progress: Option<Callback<Progress>>,
    on_batch: Option<Callback<Vec<BatchItem>>>,
    on_finished: Option<Callback<TaskOutput>>,
    on_error: Option<Callback<TaskError>>,
    on_cancelled: Option<Callback<CancelReason>>,
}

impl TaskCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(TaskId, Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_batch(mut self, f: impl Fn(TaskId, Vec<BatchItem>) + Send + Sync + 'static) -> Self {
        self.on_batch = Some(Box::new(f));
        self
    }

    pub fn on_finished(mut self, f: impl Fn(TaskId, TaskOutput) + Send + Sync + 'static) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }

    /// Receives `Failed` and `TimedOut` results.
    pub fn on_error(mut self, f: impl Fn(TaskId, TaskError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_cancelled(
        mut self,
        f: impl Fn(TaskId, CancelReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_cancelled = Some(Box::new(f));
        self
    }
}

impl EventProxy for TaskCallbacks {
    fn send_event(&self, event: TaskEvent) {
        let id = event.task_id;
        match event.result {
            TaskResult::Progress(p) => {
                if let Some(f) = &self.on_progress {
                    f(id, p)
                }
            }
            TaskResult::PartialBatch(items) => {
                if let Some(f) = &self.on_batch {
                    f(id, items)
                }
            }
            TaskResult::Finished(output) => {
                if let Some(f) = &self.on_finished {
                    f(id, output)
                }
            }
            TaskResult::Failed(message) => {
                if let Some(f) = &self.on_error {
                    f(id, TaskError::Failed(message))
                }
            }
            TaskResult::TimedOut { elapsed, budget } => {
                if let Some(f) = &self.on_error {
                    f(id, TaskError::TimedOut { elapsed, budget })
                }
            }
            TaskResult::Cancelled(reason) => {
                if let Some(f) = &self.on_cancelled {
                    f(id, reason)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_terminal_classification() {
        assert!(!TaskResult::PartialBatch(vec![]).is_terminal());
        assert!(TaskResult::Finished(TaskOutput::Unit).is_terminal());
        assert!(TaskResult::Cancelled(CancelReason::User).is_terminal());
        assert!(TaskResult::TimedOut {
            elapsed: Duration::from_secs(2),
            budget: Duration::from_secs(1)
        }
        .is_terminal());
    }

    #[test]
    fn test_callbacks_route_by_result_kind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let callbacks = TaskCallbacks::new()
            .on_finished(move |id, _| a.lock().unwrap().push(format!("finished {}", id)))
            .on_error(move |id, e| b.lock().unwrap().push(format!("error {} {}", id, e)))
            .on_cancelled(move |id, r| c.lock().unwrap().push(format!("cancelled {} {}", id, r)));

        let id = TaskId(3);
        callbacks.send_event(TaskEvent {
            task_id: id,
            result: TaskResult::Progress(Progress {
                percent: 1,
                done: 1,
                total: 100,
                message: String::new(),
            }),
        });
        callbacks.send_event(TaskEvent {
            task_id: id,
            result: TaskResult::Failed("disk full".into()),
        });
        callbacks.send_event(TaskEvent {
            task_id: id,
            result: TaskResult::Cancelled(CancelReason::User),
        });
        callbacks.send_event(TaskEvent {
            task_id: id,
            result: TaskResult::Finished(TaskOutput::Unit),
        });

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "error #3 Task failed: disk full".to_string(),
                "cancelled #3 cancelled by the user".to_string(),
                "finished #3".to_string(),
            ]
        );
    }
}
