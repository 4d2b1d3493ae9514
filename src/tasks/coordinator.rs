//! Runs tasks on a worker pool, at most one active task per coordinator.
//!
//! Each coordinator owns a fixed-size rayon pool and a registry of the tasks
//! it has run. Every state change goes through `Shared::transition`, which
//! rejects illegal moves and logs the rest. The terminal result of a task is
//! delivered after its cleanup, so a receiver can chain the next submission
//! from inside its `Finished` handler.

use anyhow::{Context, Result};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::context::{Reporter, TaskContext, TaskHandle};
use super::events::{EventProxy, TaskResult};
use super::timeout::TimeoutTable;
use super::{Priority, Task, TaskId, TaskKind};
use crate::config::TaskConfig;
use crate::context::AppContext;
use crate::core::{CancelReason, SubmitError, TaskError};
use crate::memory::BreakerTarget;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    #[default]
    Idle,
    Starting,
    Running,
    Cancelling,
    Finished,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Error)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Cancelling)
                | (Running, Finished)
                | (Running, Error)
                | (Cancelling, Finished)
                | (Cancelling, Error)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub elapsed: Duration,
    pub percent: u8,
}

struct ActiveTask {
    handle: TaskHandle,
    reporter: Arc<Reporter>,
}

struct TaskRecord {
    handle: TaskHandle,
    state: TaskState,
    ran_for: Option<Duration>,
}

#[derive(Default)]
struct Registry {
    /// State of the most recently submitted task.
    state: TaskState,
    latest: Option<TaskId>,
    active: HashMap<TaskId, ActiveTask>,
    records: HashMap<TaskId, TaskRecord>,
    order: VecDeque<TaskId>,
}

struct Shared {
    name: String,
    services: Arc<AppContext>,
    config: TaskConfig,
    timeouts: TimeoutTable,
    pool: Mutex<Option<Arc<rayon::ThreadPool>>>,
    registry: Mutex<Registry>,
    idle: Condvar,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, reg: &mut Registry, id: TaskId, to: TaskState, reason: &str) -> bool {
        let Some(record) = reg.records.get_mut(&id) else {
            tracing::warn!(coordinator = %self.name, task_id = %id, "transition for unknown task");
            return false;
        };
        let from = record.state;
        if !from.can_transition_to(to) {
            tracing::warn!(
                coordinator = %self.name,
                task_id = %id,
                from = ?from,
                to = ?to,
                reason,
                "illegal state transition ignored"
            );
            return false;
        }
        record.state = to;
        if to.is_terminal() {
            record.ran_for = Some(record.handle.elapsed());
        }
        if reg.latest == Some(id) {
            reg.state = to;
        }
        tracing::info!(
            coordinator = %self.name,
            task_id = %id,
            from = ?from,
            to = ?to,
            reason,
            "task state changed"
        );
        true
    }

    fn request_cancel(&self, reg: &mut Registry, id: TaskId, reason: CancelReason) -> bool {
        let Some(handle) = reg.active.get(&id).map(|a| a.handle.clone()) else {
            return false;
        };
        handle.interrupt(reason.clone());
        let running = reg
            .records
            .get(&id)
            .is_some_and(|r| r.state == TaskState::Running);
        if running {
            self.transition(reg, id, TaskState::Cancelling, &reason.to_string());
        }
        true
    }

    /// Cleanup for a task that reached its terminal result. Runs once per task.
    fn finish(&self, id: TaskId, result: &TaskResult) {
        let mut reg = self.registry();
        if reg.active.remove(&id).is_none() {
            tracing::debug!(coordinator = %self.name, task_id = %id, "cleanup already done");
            return;
        }
        let (to, reason) = match result {
            TaskResult::Finished(_) => (TaskState::Finished, "completed".to_string()),
            TaskResult::Cancelled(reason) => (TaskState::Finished, reason.to_string()),
            TaskResult::TimedOut { elapsed, budget } => (
                TaskState::Error,
                format!("timed out after {:?} (budget {:?})", elapsed, budget),
            ),
            TaskResult::Failed(message) => (TaskState::Error, message.clone()),
            TaskResult::Progress(_) | TaskResult::PartialBatch(_) => {
                (TaskState::Error, "ended without a terminal result".to_string())
            }
        };
        self.transition(&mut reg, id, to, &reason);
        self.trim_history(&mut reg);
        drop(reg);
        self.idle.notify_all();
    }

    fn trim_history(&self, reg: &mut Registry) {
        let limit = self.config.history_limit.max(1);
        while reg.order.len() > limit {
            let Some(&oldest) = reg.order.front() else {
                break;
            };
            if reg.active.contains_key(&oldest) {
                break;
            }
            reg.order.pop_front();
            reg.records.remove(&oldest);
        }
    }
}

/// Serializes background work for one area of the application.
///
/// Cloning yields another handle to the same coordinator.
#[derive(Clone)]
pub struct TaskCoordinator {
    shared: Arc<Shared>,
}

impl TaskCoordinator {
    pub fn new(name: impl Into<String>, services: Arc<AppContext>) -> Result<Self> {
        let name = name.into();
        let config = services.config.tasks.clone();
        let prefix = name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(move |i| format!("{}-worker-{}", prefix, i))
            .panic_handler(|_| tracing::error!("Worker thread panicked outside a task"))
            .build()
            .with_context(|| format!("Failed to build worker pool for '{}'", name))?;
        tracing::info!(
            "Coordinator '{}' started with {} worker thread(s)",
            name,
            pool.current_num_threads()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                timeouts: TimeoutTable::new(&config),
                name,
                services,
                config,
                pool: Mutex::new(Some(Arc::new(pool))),
                registry: Mutex::new(Registry::default()),
                idle: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn services(&self) -> &Arc<AppContext> {
        &self.shared.services
    }

    /// Validates `task` and starts it on the worker pool.
    ///
    /// If another task is active it is asked to cancel and given the grace
    /// period to stop; a task of higher priority than the submission is
    /// never replaced. Results go to `proxy`.
    pub fn submit<T: Task>(&self, task: T, proxy: impl EventProxy) -> Result<TaskId, SubmitError> {
        let kind = task.kind();
        if let Err(e) = task.validate() {
            tracing::warn!(coordinator = %self.shared.name, kind = kind.name(), "Rejected task: {}", e);
            return Err(e.into());
        }

        let memory = self.shared.services.memory.status();
        if memory.breaker_open {
            tracing::warn!(
                coordinator = %self.shared.name,
                kind = kind.name(),
                "Rejected task while the memory breaker is open"
            );
            return Err(SubmitError::ResourceExhausted {
                used_mb: memory.used_mb,
                limit_mb: memory.limit_mb,
            });
        }

        let mut reg = self.make_room(task.priority())?;
        let pool = self
            .shared
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let timeout = task
            .timeout_override()
            .unwrap_or_else(|| self.shared.timeouts.timeout_for(kind, task.work_items()));
        let handle = TaskHandle::new(id, kind, task.priority(), Some(timeout));
        reg.records.insert(
            id,
            TaskRecord {
                handle: handle.clone(),
                state: TaskState::Idle,
                ran_for: None,
            },
        );
        reg.order.push_back(id);
        reg.latest = Some(id);
        reg.state = TaskState::Idle;
        self.shared
            .transition(&mut reg, id, TaskState::Starting, "submitted");

        let Some(pool) = pool else {
            self.shared
                .transition(&mut reg, id, TaskState::Error, "worker pool unavailable");
            return Err(SubmitError::PoolUnavailable(format!(
                "coordinator '{}' has been shut down",
                self.shared.name
            )));
        };

        let weak = Arc::downgrade(&self.shared);
        let reporter = Arc::new(Reporter::new(handle.clone(), Arc::new(proxy), move |id, result| {
            if let Some(shared) = weak.upgrade() {
                shared.finish(id, result);
            }
        }));
        let ctx = TaskContext::new(
            handle.clone(),
            reporter.clone(),
            self.shared.services.clone(),
            &self.shared.config,
        );
        reg.active.insert(id, ActiveTask { handle, reporter });
        pool.spawn(move || run_task(task, ctx));
        self.shared
            .transition(&mut reg, id, TaskState::Running, "handed to worker pool");
        tracing::debug!(task_id = %id, timeout = ?timeout, "task timeout set");
        Ok(id)
    }

    /// Waits for the active task to go away, asking it to cancel first.
    fn make_room(&self, priority: Priority) -> Result<MutexGuard<'_, Registry>, SubmitError> {
        let grace = self.shared.config.grace_period();
        let deadline = Instant::now() + grace;
        let mut reg = self.shared.registry();
        let mut asked = false;
        loop {
            let Some((active, active_priority)) = reg
                .active
                .iter()
                .next()
                .map(|(id, a)| (*id, a.handle.priority()))
            else {
                return Ok(reg);
            };

            if !asked {
                if priority < active_priority {
                    tracing::info!(
                        coordinator = %self.shared.name,
                        task_id = %active,
                        "Active task outranks the submission; rejecting"
                    );
                    return Err(SubmitError::Busy {
                        active,
                        grace: Duration::ZERO,
                    });
                }
                self.shared
                    .request_cancel(&mut reg, active, CancelReason::Superseded);
                asked = true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    coordinator = %self.shared.name,
                    task_id = %active,
                    "Active task did not stop within {:?}",
                    grace
                );
                return Err(SubmitError::Busy { active, grace });
            }
            reg = self
                .shared
                .idle
                .wait_timeout(reg, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Requests cancellation of `id`. Returns false if it is not active.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut reg = self.shared.registry();
        let cancelled = self.shared.request_cancel(&mut reg, id, CancelReason::User);
        if !cancelled {
            tracing::debug!(task_id = %id, "cancel ignored, task not active");
        }
        cancelled
    }

    /// Requests cancellation of every active task. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let mut reg = self.shared.registry();
        let ids: Vec<TaskId> = reg.active.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.shared.request_cancel(&mut reg, *id, CancelReason::User))
            .count()
    }

    pub fn get_status(&self, id: TaskId) -> Option<TaskStatus> {
        let reg = self.shared.registry();
        reg.records.get(&id).map(|record| TaskStatus {
            id,
            kind: record.handle.kind(),
            state: record.state,
            elapsed: record.ran_for.unwrap_or_else(|| record.handle.elapsed()),
            percent: record.handle.percent(),
        })
    }

    /// State of the most recently submitted task, `Idle` before the first.
    pub fn state(&self) -> TaskState {
        self.shared.registry().state
    }

    pub fn active_task(&self) -> Option<TaskId> {
        self.shared.registry().active.keys().next().copied()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.registry().active.is_empty()
    }

    /// Blocks until no task is active. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let reg = self.shared.registry();
        let (reg, _) = self
            .shared
            .idle
            .wait_timeout_while(reg, timeout, |reg| !reg.active.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        reg.active.is_empty()
    }

    /// Stops accepting work and force-cancels the active task.
    pub fn shutdown(&self) {
        let pool = self
            .shared
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            tracing::info!("Coordinator '{}' shutting down", self.shared.name);
            self.force_cancel(CancelReason::Shutdown);
        }
    }

    /// Gives a force-cancelled task `abandon_after` to stop on its own, then
    /// reports it cancelled regardless. Its worker keeps running to the next
    /// yield point but can no longer emit anything.
    fn spawn_watchdog(&self, id: TaskId, reporter: Arc<Reporter>, reason: CancelReason) {
        let wait = self.shared.config.abandon_after();
        let name = self.shared.name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-watchdog", name))
            .spawn(move || {
                let deadline = Instant::now() + wait;
                while Instant::now() < deadline {
                    if reporter.is_terminated() {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                if reporter.terminate(TaskResult::Cancelled(reason)) {
                    tracing::error!(
                        coordinator = %name,
                        task_id = %id,
                        "Abnormal termination: task ignored cancellation for {:?} and was abandoned",
                        wait
                    );
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not start watchdog for task {}: {}", id, e);
        }
    }
}

impl BreakerTarget for TaskCoordinator {
    fn force_cancel(&self, reason: CancelReason) {
        let targets: Vec<(TaskId, Arc<Reporter>)> = {
            let mut reg = self.shared.registry();
            let ids: Vec<TaskId> = reg.active.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| {
                    let reporter = reg.active.get(&id)?.reporter.clone();
                    self.shared.request_cancel(&mut reg, id, reason.clone());
                    Some((id, reporter))
                })
                .collect()
        };
        for (id, reporter) in targets {
            tracing::warn!(coordinator = %self.shared.name, task_id = %id, "Force-cancelling: {}", reason);
            self.spawn_watchdog(id, reporter, reason.clone());
        }
    }
}

fn run_task<T: Task>(mut task: T, mut ctx: TaskContext) {
    let id = ctx.id();
    let kind = ctx.handle().kind();
    let reporter = ctx.reporter().clone();
    let span = tracing::info_span!("task", task_id = %id, kind = kind.name());
    let _entered = span.enter();
    tracing::debug!("started");

    let result = match ctx.handle().interruption() {
        Some(err) => result_from_error(err),
        None => match panic::catch_unwind(AssertUnwindSafe(|| task.run(&mut ctx))) {
            Ok(Ok(output)) => TaskResult::Finished(output),
            Ok(Err(err)) => result_from_error(err),
            Err(payload) => TaskResult::Failed(format!("task panicked: {}", panic_message(&*payload))),
        },
    };
    ctx.flush_batch();

    match &result {
        TaskResult::Finished(_) => tracing::info!("finished in {:?}", ctx.handle().elapsed()),
        TaskResult::Cancelled(reason) => tracing::info!("cancelled: {}", reason),
        TaskResult::TimedOut { elapsed, budget } => {
            tracing::warn!("timed out after {:?} (budget {:?})", elapsed, budget)
        }
        TaskResult::Failed(message) => tracing::error!("failed: {}", message),
        TaskResult::Progress(_) | TaskResult::PartialBatch(_) => {}
    }
    if !reporter.terminate(result) {
        tracing::debug!("task was already abandoned; result discarded");
    }
}

fn result_from_error(err: TaskError) -> TaskResult {
    match err {
        TaskError::Cancelled(reason) => TaskResult::Cancelled(reason),
        TaskError::TimedOut { elapsed, budget } => TaskResult::TimedOut { elapsed, budget },
        TaskError::Failed(message) => TaskResult::Failed(message),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::ValidationError;
    use crate::tasks::{TaskCallbacks, TaskOutput};
    use crate::utils::test_helpers::{
        results_until_terminal, setup_test_logging, spinning_task, FnTask,
    };
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn coordinator_with(tweak: impl FnOnce(&mut TaskConfig)) -> TaskCoordinator {
        setup_test_logging();
        let mut config = AppConfig::default();
        config.tasks.worker_threads = 2;
        tweak(&mut config.tasks);
        let services = Arc::new(AppContext::new(config).unwrap());
        TaskCoordinator::new("test", services).unwrap()
    }

    fn coordinator() -> TaskCoordinator {
        coordinator_with(|_| {})
    }

    fn quick_task() -> FnTask<impl FnMut(&mut TaskContext) -> Result<TaskOutput, TaskError> + Send + 'static> {
        FnTask::new(TaskKind::MetadataLoad, |ctx: &mut TaskContext| {
            ctx.set_total(3);
            for i in 1..=3 {
                ctx.checkpoint()?;
                ctx.progress(i, format!("step {}", i));
            }
            Ok(TaskOutput::Unit)
        })
    }

    #[test]
    fn test_transition_table() {
        use TaskState::*;
        assert!(Idle.can_transition_to(Starting));
        assert!(Running.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Error));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Finished.can_transition_to(Running));
        assert!(!Cancelling.can_transition_to(Running));
    }

    #[test]
    fn test_completed_task_reports_progress_then_finished() {
        let coordinator = coordinator();
        let (tx, rx) = mpsc::channel();
        let id = coordinator.submit(quick_task(), tx).unwrap();

        let results = results_until_terminal(&rx, id, WAIT);
        assert_eq!(results.last(), Some(&TaskResult::Finished(TaskOutput::Unit)));
        let percents: Vec<u8> = results
            .iter()
            .filter_map(|r| match r {
                TaskResult::Progress(p) => Some(p.percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents.first(), Some(&33));
        assert_eq!(percents.last(), Some(&100));

        assert!(coordinator.is_idle());
        assert_eq!(coordinator.state(), TaskState::Finished);
        let status = coordinator.get_status(id).unwrap();
        assert_eq!(status.state, TaskState::Finished);
        assert_eq!(status.percent, 100);
    }

    #[test]
    fn test_cancel_yields_cancelled_and_nothing_after() {
        let coordinator = coordinator();
        let (tx, rx) = mpsc::channel();
        let id = coordinator.submit(spinning_task(), tx).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert!(coordinator.cancel(id));
        let results = results_until_terminal(&rx, id, WAIT);
        assert_eq!(results.last(), Some(&TaskResult::Cancelled(CancelReason::User)));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(coordinator.state(), TaskState::Finished);
        assert!(!coordinator.cancel(id));
    }

    #[test]
    fn test_new_submission_supersedes_active_task() {
        let coordinator = coordinator();
        let (tx, rx) = mpsc::channel();
        let first = coordinator.submit(spinning_task(), tx.clone()).unwrap();
        let second = coordinator.submit(quick_task(), tx).unwrap();

        let mut terminals = HashMap::new();
        while terminals.len() < 2 {
            let event = rx.recv_timeout(WAIT).unwrap();
            if event.result.is_terminal() {
                terminals.insert(event.task_id, event.result);
            }
        }
        let terminal_of = |id| terminals.get(&id).cloned();
        assert_eq!(terminal_of(first), Some(TaskResult::Cancelled(CancelReason::Superseded)));
        assert_eq!(terminal_of(second), Some(TaskResult::Finished(TaskOutput::Unit)));
    }

    #[test]
    fn test_uncooperative_task_makes_submit_busy() {
        let coordinator = coordinator_with(|t| t.grace_period_ms = 50);
        let (tx, rx) = mpsc::channel();
        let stubborn = FnTask::new(TaskKind::Scan, |_: &mut TaskContext| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(TaskOutput::Unit)
        });
        let first = coordinator.submit(stubborn, tx.clone()).unwrap();

        let err = coordinator.submit(quick_task(), tx).unwrap_err();
        assert!(matches!(err, SubmitError::Busy { active, .. } if active == first));
        assert_eq!(coordinator.state(), TaskState::Cancelling);

        // It finishes anyway, but was asked to stop: reported as its own result.
        let results = results_until_terminal(&rx, first, WAIT);
        assert_eq!(results.last(), Some(&TaskResult::Finished(TaskOutput::Unit)));
        assert!(coordinator.wait_idle(WAIT));
    }

    #[test]
    fn test_higher_priority_task_is_not_replaced() {
        let coordinator = coordinator();
        let (tx, _rx) = mpsc::channel();
        let critical = spinning_task().with_priority(Priority::Critical);
        let active = coordinator.submit(critical, tx.clone()).unwrap();

        let err = coordinator.submit(quick_task(), tx).unwrap_err();
        assert!(matches!(err, SubmitError::Busy { grace, .. } if grace == Duration::ZERO));
        assert_eq!(coordinator.active_task(), Some(active));
        coordinator.cancel_all();
        assert!(coordinator.wait_idle(WAIT));
    }

    #[test]
    fn test_panic_is_reported_as_failure() {
        let coordinator = coordinator();
        let (tx, rx) = mpsc::channel();
        let task = FnTask::new(TaskKind::Thumbnails, |_: &mut TaskContext| -> Result<TaskOutput, TaskError> {
            panic!("decoder blew up")
        });
        let id = coordinator.submit(task, tx).unwrap();

        let results = results_until_terminal(&rx, id, WAIT);
        assert_eq!(
            results.last(),
            Some(&TaskResult::Failed("task panicked: decoder blew up".to_string()))
        );
        assert_eq!(coordinator.state(), TaskState::Error);
        assert!(coordinator.is_idle());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_timeout_is_distinct_from_failure() {
        let coordinator = coordinator();
        let (tx, rx) = mpsc::channel();
        let task = spinning_task().with_timeout(Duration::from_millis(30));
        let id = coordinator.submit(task, tx).unwrap();

        let results = results_until_terminal(&rx, id, WAIT);
        assert!(matches!(
            results.last(),
            Some(TaskResult::TimedOut { budget, .. }) if *budget == Duration::from_millis(30)
        ));
        assert_eq!(coordinator.get_status(id).unwrap().state, TaskState::Error);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_force_cancel_abandons_a_stuck_task() {
        let coordinator = coordinator_with(|t| t.abandon_after_ms = 50);
        let (tx, rx) = mpsc::channel();
        let stuck = FnTask::new(TaskKind::BulkMove, |_: &mut TaskContext| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(TaskOutput::Unit)
        });
        let id = coordinator.submit(stuck, tx).unwrap();

        let reason = CancelReason::ResourceExhausted {
            used_mb: 1900,
            limit_mb: 2000,
        };
        let started = Instant::now();
        coordinator.force_cancel(reason.clone());
        let results = results_until_terminal(&rx, id, WAIT);

        assert_eq!(results, vec![TaskResult::Cancelled(reason)]);
        assert!(started.elapsed() < Duration::from_millis(350));
        assert!(coordinator.is_idle());
        // The late Finished from the worker is discarded.
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_open_breaker_rejects_submissions() {
        let coordinator = coordinator();
        coordinator.services().memory.update(crate::memory::MemoryStatus {
            used_mb: 1950,
            limit_mb: 2048,
            breaker_open: true,
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel();
        let err = coordinator.submit(quick_task(), tx).unwrap_err();
        assert!(matches!(
            err,
            SubmitError::ResourceExhausted {
                used_mb: 1950,
                limit_mb: 2048
            }
        ));
        assert_eq!(coordinator.state(), TaskState::Idle);
    }

    struct Invalid;

    impl Task for Invalid {
        fn kind(&self) -> TaskKind {
            TaskKind::BulkDelete
        }

        fn validate(&self) -> Result<(), ValidationError> {
            Err(ValidationError::Empty("file pairs"))
        }

        fn run(&mut self, _: &mut TaskContext) -> Result<TaskOutput, TaskError> {
            unreachable!("invalid tasks never run")
        }
    }

    #[test]
    fn test_validation_failure_never_reaches_the_pool() {
        let coordinator = coordinator();
        let (tx, rx) = mpsc::channel();
        let err = coordinator.submit(Invalid, tx).unwrap_err();
        assert!(matches!(err, SubmitError::Validation(ValidationError::Empty(_))));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(coordinator.state(), TaskState::Idle);
    }

    #[test]
    fn test_shutdown_makes_the_pool_unavailable() {
        let coordinator = coordinator();
        coordinator.shutdown();
        let (tx, _rx) = mpsc::channel();
        let err = coordinator.submit(quick_task(), tx).unwrap_err();
        assert!(matches!(err, SubmitError::PoolUnavailable(_)));
        assert_eq!(coordinator.state(), TaskState::Error);
    }

    #[test]
    fn test_finished_handler_can_chain_the_next_task() {
        let coordinator = coordinator();
        let (tx, rx) = mpsc::channel();
        let (chain_tx, chain_rx) = mpsc::channel();
        let chained = coordinator.clone();
        let chained_events = tx.clone();
        let callbacks = TaskCallbacks::new().on_finished(move |_, _| {
            let next = chained
                .submit(quick_task(), chained_events.clone())
                .map_err(|e| e.to_string());
            chain_tx.send(next).unwrap();
        });
        coordinator.submit(quick_task(), callbacks).unwrap();

        let next = chain_rx.recv_timeout(WAIT).unwrap().unwrap();
        let results = results_until_terminal(&rx, next, WAIT);
        assert_eq!(results.last(), Some(&TaskResult::Finished(TaskOutput::Unit)));
    }

    #[test]
    fn test_history_is_bounded() {
        let coordinator = coordinator_with(|t| t.history_limit = 2);
        let (tx, rx) = mpsc::channel();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = coordinator.submit(quick_task(), tx.clone()).unwrap();
            results_until_terminal(&rx, id, WAIT);
            ids.push(id);
        }
        assert!(coordinator.get_status(ids[0]).is_none());
        assert!(coordinator.get_status(ids[2]).is_some());
    }
}
