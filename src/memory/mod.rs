//! Periodic process-memory sampling with a circuit breaker.
//!
//! The monitor runs on its own low-frequency tick, independent of any task.
//! Each sample updates the shared [`MemoryGauge`]; when the breaker trips,
//! every registered [`BreakerTarget`] is asked to force-cancel its active task.

pub mod breaker;

pub use breaker::{BreakerEvent, CircuitBreaker, MemoryStatus};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;

use crate::config::MemoryConfig;
use crate::core::CancelReason;

/// Source of resident memory readings.
pub trait MemorySampler: Send + 'static {
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Reads this process's resident memory through `sysinfo`.
pub struct SysinfoSampler {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Memory sampling unavailable: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid).map(|process| process.memory())
    }
}

/// Latest memory status, shared with coordinators and batch delivery.
#[derive(Debug, Default)]
pub struct MemoryGauge {
    status: Mutex<MemoryStatus>,
}

impl MemoryGauge {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> MemoryStatus {
        *self.lock()
    }

    pub fn update(&self, status: MemoryStatus) {
        *self.lock() = status;
    }

    pub fn is_open(&self) -> bool {
        self.lock().breaker_open
    }

    pub fn is_high(&self) -> bool {
        self.lock().high
    }
}

/// Something that can be told to drop its active work.
pub trait BreakerTarget: Send + Sync + 'static {
    fn force_cancel(&self, reason: CancelReason);
}

pub struct MemoryMonitor {
    interval: Duration,
    breaker: Mutex<CircuitBreaker>,
    sampler: Mutex<Box<dyn MemorySampler>>,
    gauge: Arc<MemoryGauge>,
    targets: Mutex<Vec<Weak<dyn BreakerTarget>>>,
}

impl MemoryMonitor {
    pub fn new(config: &MemoryConfig, gauge: Arc<MemoryGauge>) -> Self {
        Self::with_sampler(config, gauge, Box::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(
        config: &MemoryConfig,
        gauge: Arc<MemoryGauge>,
        sampler: Box<dyn MemorySampler>,
    ) -> Self {
        Self {
            interval: Duration::from_secs(config.sample_interval_secs.max(1)),
            breaker: Mutex::new(CircuitBreaker::new(config)),
            sampler: Mutex::new(sampler),
            gauge,
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn gauge(&self) -> &Arc<MemoryGauge> {
        &self.gauge
    }

    /// Registers a target without keeping it alive.
    pub fn register<T: BreakerTarget>(&self, target: &Arc<T>) {
        let weak: Weak<T> = Arc::downgrade(target);
        let weak: Weak<dyn BreakerTarget> = weak;
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(weak);
    }

    /// Takes one sample and applies the breaker policy.
    pub fn sample_once(&self) -> Option<MemoryStatus> {
        let bytes = self
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resident_bytes()?;
        let used_mb = bytes / (1024 * 1024);

        let (status, event) = self
            .breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(used_mb);
        self.gauge.update(status);
        tracing::trace!(
            used_mb = status.used_mb,
            percent = status.percent,
            strikes = status.strikes,
            "memory sample"
        );

        match event {
            BreakerEvent::Tripped => {
                tracing::warn!(
                    used_mb = status.used_mb,
                    limit_mb = status.limit_mb,
                    "Memory circuit breaker opened; force-cancelling active tasks"
                );
                self.trip(CancelReason::ResourceExhausted {
                    used_mb: status.used_mb,
                    limit_mb: status.limit_mb,
                });
            }
            BreakerEvent::Reset => {
                tracing::info!(
                    used_mb = status.used_mb,
                    "Memory circuit breaker closed; accepting work again"
                );
            }
            BreakerEvent::None => {
                if status.high {
                    tracing::debug!("Memory usage high: {:.1}% of limit", status.percent);
                }
            }
        }
        Some(status)
    }

    fn trip(&self, reason: CancelReason) {
        let targets: Vec<Arc<dyn BreakerTarget>> = {
            let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
            targets.retain(|t| t.strong_count() > 0);
            targets.iter().filter_map(Weak::upgrade).collect()
        };
        for target in targets {
            target.force_cancel(reason.clone());
        }
    }

    /// Starts sampling on the tokio runtime every configured interval.
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            tracing::info!("Memory monitor started, sampling every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let monitor = self.clone();
                // sysinfo refreshes read /proc and may block briefly.
                if let Err(e) = tokio::task::spawn_blocking(move || monitor.sample_once()).await {
                    tracing::warn!("Memory sample panicked: {}", e);
                }
            }
        });
        MonitorHandle { handle }
    }
}

pub struct MonitorHandle {
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        self.handle.abort();
        tracing::info!("Memory monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::VecDeque;

    struct ScriptedSampler(VecDeque<u64>);

    impl MemorySampler for ScriptedSampler {
        fn resident_bytes(&mut self) -> Option<u64> {
            self.0.pop_front().map(|mb| mb * 1024 * 1024)
        }
    }

    #[derive(Default)]
    struct RecordingTarget(Mutex<Vec<CancelReason>>);

    impl BreakerTarget for RecordingTarget {
        fn force_cancel(&self, reason: CancelReason) {
            self.0.lock().unwrap().push(reason);
        }
    }

    fn monitor(samples: &[u64]) -> MemoryMonitor {
        let config = MemoryConfig {
            limit_mb: 1000,
            ..MemoryConfig::default()
        };
        MemoryMonitor::with_sampler(
            &config,
            Arc::new(MemoryGauge::new()),
            Box::new(ScriptedSampler(samples.iter().copied().collect())),
        )
    }

    #[test]
    fn test_trip_force_cancels_registered_targets_once() {
        let monitor = monitor(&[950, 950, 950, 950, 600]);
        let target = Arc::new(RecordingTarget::default());
        monitor.register(&target);

        for _ in 0..4 {
            monitor.sample_once().unwrap();
        }
        assert!(monitor.gauge().is_open());
        assert_eq!(
            *target.0.lock().unwrap(),
            vec![CancelReason::ResourceExhausted {
                used_mb: 950,
                limit_mb: 1000
            }]
        );

        let status = monitor.sample_once().unwrap();
        assert!(!status.breaker_open);
        assert!(!monitor.gauge().is_open());
        assert!(monitor.sample_once().is_none());
    }

    #[test]
    fn test_dropped_targets_are_skipped() {
        let monitor = monitor(&[950, 950, 950]);
        let target = Arc::new(RecordingTarget::default());
        monitor.register(&target);
        drop(target);

        for _ in 0..3 {
            monitor.sample_once();
        }
        assert!(monitor.gauge().is_open());
        assert!(monitor.targets.lock().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_sysinfo_sampler_reads_this_process() {
        let mut sampler = SysinfoSampler::new();
        let bytes = sampler.resident_bytes().unwrap();
        assert!(bytes > 0);
    }

    #[tokio::test]
    async fn test_spawned_monitor_updates_gauge() {
        let config = MemoryConfig {
            limit_mb: 1000,
            sample_interval_secs: 1,
            ..MemoryConfig::default()
        };
        let gauge = Arc::new(MemoryGauge::new());
        let monitor = Arc::new(MemoryMonitor::with_sampler(
            &config,
            gauge.clone(),
            Box::new(ScriptedSampler(VecDeque::from(vec![850]))),
        ));

        let handle = monitor.spawn();
        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop();

        let status = gauge.status();
        assert_eq!(status.used_mb, 850);
        assert!(status.high);
        assert!(!status.critical);
    }
}
