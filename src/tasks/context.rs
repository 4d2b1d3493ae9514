//! What a running task sees: its cancellation handle, throttled progress
//! reporting and chunked batch delivery.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::events::{BatchItem, EventProxy, Progress, TaskEvent, TaskResult};
use super::{Priority, TaskId, TaskKind};
use crate::config::TaskConfig;
use crate::context::AppContext;
use crate::core::{CancelReason, TaskError};

/// Shared cancellation token and timing for one task.
///
/// The coordinator keeps one clone, the running task another. `interrupt` is
/// idempotent and may be called from any thread.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    id: TaskId,
    kind: TaskKind,
    priority: Priority,
    started: Instant,
    timeout: Option<Duration>,
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    percent: AtomicU8,
}

impl TaskHandle {
    pub fn new(id: TaskId, kind: TaskKind, priority: Priority, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                kind,
                priority,
                started: Instant::now(),
                timeout,
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                percent: AtomicU8::new(0),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn percent(&self) -> u8 {
        self.inner.percent.load(Ordering::Relaxed)
    }

    /// Requests cancellation. The first reason wins.
    pub fn interrupt(&self, reason: CancelReason) {
        let mut slot = self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// True once the task has been cancelled or has run past its timeout.
    pub fn check_interruption(&self) -> bool {
        self.interruption().is_some()
    }

    /// The error a task should stop with, if any.
    pub fn interruption(&self) -> Option<TaskError> {
        if self.is_interrupted() {
            let reason = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or(CancelReason::User);
            return Some(TaskError::Cancelled(reason));
        }
        let budget = self.inner.timeout?;
        let elapsed = self.elapsed();
        (elapsed > budget).then_some(TaskError::TimedOut { elapsed, budget })
    }

    fn set_percent(&self, percent: u8) {
        self.inner.percent.store(percent, Ordering::Relaxed);
    }
}

type TerminalHook = Box<dyn Fn(TaskId, &TaskResult) + Send + Sync>;

struct Gate {
    proxy: Option<Arc<dyn EventProxy>>,
    terminated: bool,
}

/// Delivers one task's events and guarantees exactly one terminal result.
///
/// Progress and batches are dropped once the task is interrupted or
/// terminated. The terminal hook runs before the terminal event is sent, so
/// a receiver that reacts to `Finished` sees the coordinator already idle.
pub(crate) struct Reporter {
    task_id: TaskId,
    handle: TaskHandle,
    gate: Mutex<Gate>,
    on_terminal: TerminalHook,
}

impl Reporter {
    pub(crate) fn new(
        handle: TaskHandle,
        proxy: Arc<dyn EventProxy>,
        on_terminal: impl Fn(TaskId, &TaskResult) + Send + Sync + 'static,
    ) -> Self {
        Self {
            task_id: handle.id(),
            handle,
            gate: Mutex::new(Gate {
                proxy: Some(proxy),
                terminated: false,
            }),
            on_terminal: Box::new(on_terminal),
        }
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.gate().terminated
    }

    /// Sends a non-terminal result unless the task was stopped.
    pub(crate) fn emit(&self, result: TaskResult) {
        debug_assert!(!result.is_terminal());
        // Held across the send so nothing can slip in after the terminal event.
        let gate = self.gate();
        if gate.terminated || self.handle.is_interrupted() {
            tracing::trace!(task_id = %self.task_id, "dropping event from stopped task");
            return;
        }
        if let Some(proxy) = gate.proxy.as_ref() {
            proxy.send_event(TaskEvent {
                task_id: self.task_id,
                result,
            });
        }
    }

    /// Sends the terminal result. Returns false if one was already sent.
    pub(crate) fn terminate(&self, result: TaskResult) -> bool {
        debug_assert!(result.is_terminal());
        let proxy = {
            let mut gate = self.gate();
            if gate.terminated {
                return false;
            }
            gate.terminated = true;
            gate.proxy.take()
        };
        (self.on_terminal)(self.task_id, &result);
        if let Some(proxy) = proxy {
            proxy.send_event(TaskEvent {
                task_id: self.task_id,
                result,
            });
        }
        true
    }
}

/// Smallest batch used for `total` items.
pub fn batch_size_for(total: usize, table: &[(usize, usize)], beyond: usize) -> usize {
    table
        .iter()
        .find(|(max_items, _)| total <= *max_items)
        .map_or(beyond, |(_, size)| *size)
        .max(1)
}

/// Decides which progress updates are worth sending.
///
/// The first and the last unit are always reported; in between an update
/// goes out when the minimum interval has passed or `every` items were done
/// since the last one, whichever comes first.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    min_interval: Duration,
    every: usize,
    total: usize,
    last_emit: Option<Instant>,
    last_done: usize,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration, every: usize) -> Self {
        Self {
            min_interval,
            every: every.max(1),
            total: 0,
            last_emit: None,
            last_done: 0,
        }
    }

    /// Starts a new phase. A zero total means the size is not known yet and
    /// only the interval applies.
    pub fn reset(&mut self, total: usize, every: usize) {
        self.total = total;
        self.every = if total == 0 { usize::MAX } else { every.max(1) };
        self.last_emit = None;
        self.last_done = 0;
    }

    pub fn should_emit(&mut self, done: usize, now: Instant) -> bool {
        let first = self.last_emit.is_none();
        let last = self.total > 0 && done >= self.total;
        let due = self
            .last_emit
            .is_some_and(|at| now.saturating_duration_since(at) >= self.min_interval);
        let stride = done.saturating_sub(self.last_done) >= self.every;

        if first || last || due || stride {
            self.last_emit = Some(now);
            self.last_done = done;
            true
        } else {
            false
        }
    }
}

/// Handed to `Task::run`.
pub struct TaskContext {
    handle: TaskHandle,
    reporter: Arc<Reporter>,
    services: Arc<AppContext>,
    throttle: ProgressThrottle,
    batch_table: Vec<(usize, usize)>,
    batch_beyond: usize,
    batch_size: usize,
    batch: Vec<BatchItem>,
}

impl TaskContext {
    pub(crate) fn new(
        handle: TaskHandle,
        reporter: Arc<Reporter>,
        services: Arc<AppContext>,
        config: &TaskConfig,
    ) -> Self {
        let batch_size = batch_size_for(0, &config.batch_sizes, config.batch_size_beyond);
        let mut throttle = ProgressThrottle::new(config.progress_interval(), batch_size);
        throttle.reset(0, batch_size);
        Self {
            handle,
            reporter,
            services,
            throttle,
            batch_table: config.batch_sizes.clone(),
            batch_beyond: config.batch_size_beyond,
            batch_size,
            batch: Vec::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn services(&self) -> &Arc<AppContext> {
        &self.services
    }

    pub fn check_interruption(&self) -> bool {
        self.handle.check_interruption()
    }

    /// Yield point. Returns the cancellation or timeout error to stop with.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        match self.handle.interruption() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Declares the number of units in the next phase of work.
    pub fn set_total(&mut self, total: usize) {
        self.batch_size = batch_size_for(total, &self.batch_table, self.batch_beyond);
        self.throttle.reset(total, self.batch_size);
    }

    /// Reports `done` of the declared total, subject to throttling.
    pub fn progress(&mut self, done: usize, message: impl Into<String>) {
        let total = self.throttle.total;
        let percent = if total == 0 {
            0
        } else {
            (done.min(total) * 100 / total) as u8
        };
        self.handle.set_percent(percent);

        if self.throttle.should_emit(done, Instant::now()) {
            self.reporter.emit(TaskResult::Progress(Progress {
                percent,
                done,
                total,
                message: message.into(),
            }));
        }
    }

    /// Queues an item for the next partial batch. Batches shrink while
    /// memory use is high.
    pub fn push_batch_item(&mut self, item: BatchItem) {
        self.batch.push(item);
        if self.batch.len() >= self.effective_batch_size() {
            self.flush_batch();
        }
    }

    pub fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let items = std::mem::take(&mut self.batch);
        tracing::trace!(task_id = %self.id(), items = items.len(), "delivering partial batch");
        self.reporter.emit(TaskResult::PartialBatch(items));
    }

    fn effective_batch_size(&self) -> usize {
        if self.services.memory.is_high() {
            (self.batch_size / 2).max(1)
        } else {
            self.batch_size
        }
    }

    pub(crate) fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }
}
