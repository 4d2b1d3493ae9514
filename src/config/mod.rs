pub mod settings;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::tasks::TaskKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub tasks: TaskConfig,
    pub pairing: PairingConfig,
}

impl AppConfig {
    /// Loads the config from the platform config directory (or `path`), falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        settings::load_config(path)
    }

    /// Rejects settings the services cannot work with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.cache;
        ensure!(c.max_entries > 0, "cache.max_entries must be greater than 0");
        ensure!(c.max_memory_mb > 0, "cache.max_memory_mb must be greater than 0");
        ensure!(
            0.0 < c.target_ratio && c.target_ratio < c.cleanup_threshold,
            "cache.target_ratio must be between 0 and cache.cleanup_threshold"
        );
        ensure!(
            c.cleanup_threshold <= c.critical_threshold && c.critical_threshold <= 1.0,
            "cache thresholds must satisfy cleanup <= critical <= 1.0"
        );
        ensure!(c.compression_factor > 0.0, "cache.compression_factor must be positive");

        let m = &self.memory;
        ensure!(m.limit_mb > 0, "memory.limit_mb must be greater than 0");
        ensure!(
            m.recovery_ratio < m.critical_ratio && m.high_ratio <= m.critical_ratio,
            "memory ratios must satisfy recovery < critical and high <= critical"
        );
        ensure!(m.strikes_to_trip > 0, "memory.strikes_to_trip must be greater than 0");

        ensure!(
            self.tasks.batch_sizes.windows(2).all(|w| w[0].0 < w[1].0),
            "tasks.batch_sizes thresholds must be ascending"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailFormat {
    Jpeg,
    Png,
    Webp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_memory_mb: usize,
    /// Soft ratio of either limit at which a debounced cleanup is scheduled.
    pub cleanup_threshold: f64,
    /// Ratio at which cleanup runs synchronously inside `put`.
    pub critical_threshold: f64,
    /// Both entry count and bytes are brought down to this ratio by a cleanup pass.
    pub target_ratio: f64,
    pub cleanup_debounce_ms: u64,
    /// In-memory images are rarely raw bitmaps; scales the `w*h*channels` estimate.
    pub compression_factor: f64,
    pub channels: u32,
    pub format: ThumbnailFormat,
    pub quality: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_memory_mb: 256,
            cleanup_threshold: 0.90,
            critical_threshold: 0.95,
            target_ratio: 0.70,
            cleanup_debounce_ms: 5000,
            compression_factor: 0.5,
            channels: 4,
            format: ThumbnailFormat::Jpeg,
            quality: 85,
        }
    }
}

impl CacheConfig {
    pub fn max_bytes(&self) -> usize {
        self.max_memory_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub limit_mb: u64,
    pub high_ratio: f64,
    pub critical_ratio: f64,
    /// The breaker closes again once usage drops below this ratio.
    pub recovery_ratio: f64,
    pub strikes_to_trip: u32,
    pub sample_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_mb: 2048,
            high_ratio: 0.80,
            critical_ratio: 0.90,
            recovery_ratio: 0.70,
            strikes_to_trip: 3,
            sample_interval_secs: 10,
        }
    }
}

/// `timeout = max(minimum, base + items * per_item)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub base_ms: u64,
    pub minimum_ms: u64,
    pub per_item_ms: u64,
}

impl TimeoutPolicy {
    pub const fn new(base_ms: u64, minimum_ms: u64, per_item_ms: u64) -> Self {
        Self {
            base_ms,
            minimum_ms,
            per_item_ms,
        }
    }

    pub const fn flat(base_ms: u64) -> Self {
        Self::new(base_ms, base_ms, 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskConfig {
    /// 0 uses the available parallelism.
    pub worker_threads: usize,
    pub progress_interval_ms: u64,
    /// How long a new submission waits for the previous task to yield.
    pub grace_period_ms: u64,
    /// How long a force-cancelled task may keep running before it is abandoned.
    pub abandon_after_ms: u64,
    /// `(max_items, batch_size)` ascending; inputs above the last threshold use `batch_size_beyond`.
    pub batch_sizes: Vec<(usize, usize)>,
    pub batch_size_beyond: usize,
    pub history_limit: usize,
    pub summary_detail_limit: usize,
    pub timeouts: BTreeMap<TaskKind, TimeoutPolicy>,
}

/// Per-item unit cost for bulk file work.
const BASE_ITEM_MS: u64 = 50;

impl Default for TaskConfig {
    fn default() -> Self {
        let timeouts = BTreeMap::from([
            (TaskKind::Scan, TimeoutPolicy::flat(300_000)),
            (
                TaskKind::Thumbnails,
                TimeoutPolicy::new(10_000, 30_000, 10 * BASE_ITEM_MS),
            ),
            (
                TaskKind::BulkMove,
                TimeoutPolicy::new(30_000, 30_000, BASE_ITEM_MS),
            ),
            (
                TaskKind::BulkDelete,
                TimeoutPolicy::new(30_000, 30_000, BASE_ITEM_MS),
            ),
            (
                TaskKind::BulkRename,
                TimeoutPolicy::new(15_000, 15_000, BASE_ITEM_MS),
            ),
            (TaskKind::MetadataLoad, TimeoutPolicy::flat(15_000)),
            (TaskKind::MetadataSave, TimeoutPolicy::flat(30_000)),
        ]);
        Self {
            worker_threads: 0,
            progress_interval_ms: 100,
            grace_period_ms: 2000,
            abandon_after_ms: 5000,
            batch_sizes: vec![(50, 5), (500, 20), (2000, 50)],
            batch_size_beyond: 100,
            history_limit: 128,
            summary_detail_limit: crate::core::summary::DEFAULT_DETAIL_LIMIT,
            timeouts,
        }
    }
}

impl TaskConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn abandon_after(&self) -> Duration {
        Duration::from_millis(self.abandon_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PairingConfig {
    pub archive_extensions: Vec<String>,
    pub preview_extensions: Vec<String>,
    pub recursive: bool,
}

impl Default for PairingConfig {
    fn default() -> Self {
        let to_vec = |exts: &[&str]| exts.iter().map(|e| e.to_string()).collect();
        Self {
            archive_extensions: to_vec(&["zip", "rar", "7z", "cbz", "cbr", "tar", "gz"]),
            preview_extensions: to_vec(&["jpg", "jpeg", "png", "webp", "gif", "bmp"]),
            recursive: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_every_task_kind_has_a_timeout_policy() {
        let config = TaskConfig::default();
        for kind in TaskKind::ALL {
            assert!(config.timeouts.contains_key(&kind), "{:?} missing", kind);
        }
    }

    #[test]
    fn test_validate_rejects_inverted_cache_ratios() {
        let mut config = AppConfig::default();
        config.cache.target_ratio = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_in_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "cache": { "max_entries": 10 } }"#).unwrap();
        assert_eq!(config.cache.max_entries, 10);
        assert_eq!(config.cache.max_memory_mb, 256);
        assert_eq!(config.memory, MemoryConfig::default());
    }
}
