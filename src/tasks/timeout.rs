use std::collections::BTreeMap;
use std::time::Duration;

use super::TaskKind;
use crate::config::{TaskConfig, TimeoutPolicy};

/// Used for kinds missing from the configured table.
const FALLBACK: TimeoutPolicy = TimeoutPolicy::new(30_000, 30_000, 50);

/// Per-kind adaptive timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutTable {
    policies: BTreeMap<TaskKind, TimeoutPolicy>,
}

impl TimeoutTable {
    pub fn new(config: &TaskConfig) -> Self {
        Self {
            policies: config.timeouts.clone(),
        }
    }

    pub fn timeout_for(&self, kind: TaskKind, items: usize) -> Duration {
        let policy = self.policies.get(&kind).copied().unwrap_or_else(|| {
            tracing::warn!("No timeout policy for {:?}, using the fallback", kind);
            FALLBACK
        });
        adaptive_timeout(&policy, items)
    }
}

pub fn adaptive_timeout(policy: &TimeoutPolicy, items: usize) -> Duration {
    let scaled = policy
        .base_ms
        .saturating_add((items as u64).saturating_mul(policy.per_item_ms));
    Duration::from_millis(scaled.max(policy.minimum_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bulk_move_scales_with_item_count() {
        let table = TimeoutTable::new(&TaskConfig::default());
        let small = table.timeout_for(TaskKind::BulkMove, 100);
        let large = table.timeout_for(TaskKind::BulkMove, 1400);
        assert_eq!(small, Duration::from_millis(35_000));
        assert_eq!(large, Duration::from_millis(100_000));
        assert!(large > small);
    }

    #[test]
    fn test_minimum_applies_to_small_inputs() {
        let table = TimeoutTable::new(&TaskConfig::default());
        assert_eq!(
            table.timeout_for(TaskKind::Thumbnails, 1),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            table.timeout_for(TaskKind::Scan, 1_000_000),
            Duration::from_millis(300_000)
        );
    }

    #[test]
    fn test_missing_kind_uses_fallback() {
        let config = TaskConfig {
            timeouts: BTreeMap::new(),
            ..TaskConfig::default()
        };
        let table = TimeoutTable::new(&config);
        assert_eq!(
            table.timeout_for(TaskKind::BulkRename, 0),
            Duration::from_millis(30_000)
        );
    }

    proptest! {
        #[test]
        fn test_timeout_never_shrinks_as_items_grow(
            base in 0u64..100_000,
            minimum in 0u64..100_000,
            per_item in 0u64..1_000,
            a in 0usize..1_000_000,
            b in 0usize..1_000_000,
        ) {
            let policy = TimeoutPolicy::new(base, minimum, per_item);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(adaptive_timeout(&policy, lo) <= adaptive_timeout(&policy, hi));
            prop_assert!(adaptive_timeout(&policy, lo) >= Duration::from_millis(minimum));
        }
    }
}
