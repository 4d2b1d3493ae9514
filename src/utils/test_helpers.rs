use std::sync::mpsc::Receiver;
use std::sync::Once;
use std::time::{Duration, Instant};

use crate::core::TaskError;
use crate::tasks::{Priority, Task, TaskContext, TaskEvent, TaskId, TaskKind, TaskOutput, TaskResult};

static LOGGING_INIT: Once = Once::new();

/// Initializes the tracing subscriber for tests.
///
/// Wrapped in a `Once` so the global subscriber is set exactly one time,
/// even when tests run in parallel.
pub fn setup_test_logging() {
    LOGGING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A task whose body is a closure.
pub struct FnTask<F> {
    kind: TaskKind,
    priority: Priority,
    timeout: Option<Duration>,
    body: F,
}

impl<F> FnTask<F>
where
    F: FnMut(&mut TaskContext) -> Result<TaskOutput, TaskError> + Send + 'static,
{
    pub fn new(kind: TaskKind, body: F) -> Self {
        Self {
            kind,
            priority: Priority::Normal,
            timeout: None,
            body,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<F> Task for FnTask<F>
where
    F: FnMut(&mut TaskContext) -> Result<TaskOutput, TaskError> + Send + 'static,
{
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        (self.body)(ctx)
    }
}

/// A task that checks for cancellation every few milliseconds until stopped.
pub fn spinning_task() -> FnTask<impl FnMut(&mut TaskContext) -> Result<TaskOutput, TaskError> + Send + 'static> {
    FnTask::new(TaskKind::Scan, |ctx: &mut TaskContext| loop {
        ctx.checkpoint()?;
        std::thread::sleep(Duration::from_millis(5));
    })
}

/// Collects the results of `id` up to and including its terminal one.
///
/// Panics if no terminal result arrives within `timeout`.
pub fn results_until_terminal(
    rx: &Receiver<TaskEvent>,
    id: TaskId,
    timeout: Duration,
) -> Vec<TaskResult> {
    let deadline = Instant::now() + timeout;
    let mut results = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = rx
            .recv_timeout(remaining)
            .unwrap_or_else(|e| panic!("no terminal result for {}: {}", id, e));
        if event.task_id != id {
            continue;
        }
        let terminal = event.result.is_terminal();
        results.push(event.result);
        if terminal {
            return results;
        }
    }
}
