//! Three-strikes circuit breaker over sampled process memory.

use serde::Serialize;

use crate::config::MemoryConfig;

/// One memory sample, as seen by the breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryStatus {
    pub used_mb: u64,
    pub limit_mb: u64,
    /// Percentage of the configured limit.
    pub percent: f64,
    pub high: bool,
    pub critical: bool,
    /// Consecutive critical samples so far.
    pub strikes: u32,
    pub breaker_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    None,
    /// The strike limit was reached; the active task must be force-cancelled.
    Tripped,
    /// Usage fell below the recovery ratio; work may resume.
    Reset,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    limit_mb: u64,
    high_ratio: f64,
    critical_ratio: f64,
    recovery_ratio: f64,
    strikes_to_trip: u32,
    strikes: u32,
    open: bool,
}

impl CircuitBreaker {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            limit_mb: config.limit_mb,
            high_ratio: config.high_ratio,
            critical_ratio: config.critical_ratio,
            recovery_ratio: config.recovery_ratio,
            strikes_to_trip: config.strikes_to_trip,
            strikes: 0,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn observe(&mut self, used_mb: u64) -> (MemoryStatus, BreakerEvent) {
        let ratio = used_mb as f64 / self.limit_mb as f64;
        let critical = ratio >= self.critical_ratio;

        let event = if self.open {
            if ratio < self.recovery_ratio {
                self.open = false;
                self.strikes = 0;
                BreakerEvent::Reset
            } else {
                BreakerEvent::None
            }
        } else if critical {
            self.strikes += 1;
            if self.strikes >= self.strikes_to_trip {
                self.open = true;
                BreakerEvent::Tripped
            } else {
                BreakerEvent::None
            }
        } else {
            self.strikes = 0;
            BreakerEvent::None
        };

        let status = MemoryStatus {
            used_mb,
            limit_mb: self.limit_mb,
            percent: ratio * 100.0,
            high: ratio >= self.high_ratio,
            critical,
            strikes: self.strikes,
            breaker_open: self.open,
        };
        (status, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&MemoryConfig {
            limit_mb: 1000,
            ..MemoryConfig::default()
        })
    }

    #[test]
    fn test_three_consecutive_critical_samples_trip() {
        let mut b = breaker();
        assert_eq!(b.observe(950).1, BreakerEvent::None);
        assert_eq!(b.observe(960).1, BreakerEvent::None);
        let (status, event) = b.observe(970);
        assert_eq!(event, BreakerEvent::Tripped);
        assert!(status.breaker_open);
        assert_eq!(status.strikes, 3);
        assert!(status.high && status.critical);
    }

    #[test]
    fn test_non_critical_sample_resets_strikes() {
        let mut b = breaker();
        b.observe(950);
        b.observe(950);
        let (status, _) = b.observe(850);
        assert_eq!(status.strikes, 0);
        assert!(status.high);
        assert!(!status.critical);
        b.observe(950);
        assert_eq!(b.observe(950).1, BreakerEvent::None);
        assert!(!b.is_open());
    }

    #[test]
    fn test_breaker_closes_only_below_recovery_ratio() {
        let mut b = breaker();
        for _ in 0..3 {
            b.observe(990);
        }
        assert!(b.is_open());

        // Between recovery and critical: still open, no new trip.
        assert_eq!(b.observe(800).1, BreakerEvent::None);
        assert_eq!(b.observe(700).1, BreakerEvent::None);
        assert!(b.is_open());
        assert_eq!(b.observe(990).1, BreakerEvent::None);

        let (status, event) = b.observe(699);
        assert_eq!(event, BreakerEvent::Reset);
        assert!(!status.breaker_open);
        assert_eq!(status.strikes, 0);
    }
}
