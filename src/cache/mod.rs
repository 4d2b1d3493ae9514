//! Memory-bounded LRU cache of decoded thumbnails.
//!
//! Entries are keyed by normalized path, requested size and the encode
//! parameters, so changing the thumbnail format or quality can never return an
//! image rendered with the old settings.
//!
//! Eviction has two triggers over both the entry count and the byte total:
//! crossing the soft threshold schedules one debounced background pass, and
//! crossing the critical threshold cleans up synchronously inside `put`. A pass
//! evicts least-recently-used entries until both totals are at or below the
//! target ratio of their limits.
//!
//! All state access happens under `Resource::ThumbnailCache`.

mod key;

pub use key::{normalize_path, CacheKey, EncodeParams};

use image::DynamicImage;
use lru::LruCache;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::core::LockError;
use crate::locks::{Resource, ResourceLocks};

pub type ThumbnailImage = Arc<DynamicImage>;

#[derive(Debug)]
struct CacheEntry {
    image: ThumbnailImage,
    bytes: usize,
    inserted_at: Instant,
}

struct CacheState {
    entries: LruCache<CacheKey, CacheEntry>,
    total_bytes: usize,
    params: EncodeParams,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Clone)]
struct Limits {
    max_entries: usize,
    max_bytes: usize,
    soft_ratio: f64,
    critical_ratio: f64,
    target_ratio: f64,
    debounce: Duration,
    compression_factor: f64,
    channels: u32,
}

impl Limits {
    fn reached(&self, state: &CacheState, ratio: f64) -> bool {
        state.entries.len() as f64 >= self.max_entries as f64 * ratio
            || state.total_bytes as f64 >= self.max_bytes as f64 * ratio
    }

    fn target_entries(&self) -> usize {
        (self.max_entries as f64 * self.target_ratio).floor() as usize
    }

    fn target_bytes(&self) -> usize {
        (self.max_bytes as f64 * self.target_ratio).floor() as usize
    }
}

struct Shared {
    locks: Arc<ResourceLocks>,
    state: Mutex<CacheState>,
    limits: Limits,
    cleanup_pending: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the process-wide thumbnail cache. Cloning shares the same cache.
#[derive(Clone)]
pub struct ThumbnailCache {
    shared: Arc<Shared>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache: {}/{} thumbnails, {:.1}MB/{:.1}MB, {:.1}% hit ratio",
            self.entries,
            self.max_entries,
            self.bytes as f64 / (1024.0 * 1024.0),
            self.max_bytes as f64 / (1024.0 * 1024.0),
            self.hit_ratio() * 100.0
        )
    }
}

enum AfterPut {
    Nothing,
    ScheduleCleanup,
}

impl ThumbnailCache {
    pub fn new(config: &CacheConfig, locks: Arc<ResourceLocks>) -> Self {
        let limits = Limits {
            max_entries: config.max_entries,
            max_bytes: config.max_bytes(),
            soft_ratio: config.cleanup_threshold,
            critical_ratio: config.critical_threshold,
            target_ratio: config.target_ratio,
            debounce: Duration::from_millis(config.cleanup_debounce_ms),
            compression_factor: config.compression_factor,
            channels: config.channels,
        };
        tracing::debug!(
            "Thumbnail cache: max_entries={} max_bytes={}",
            limits.max_entries,
            limits.max_bytes
        );
        Self {
            shared: Arc::new(Shared {
                locks,
                state: Mutex::new(CacheState {
                    entries: LruCache::unbounded(),
                    total_bytes: 0,
                    params: EncodeParams {
                        format: config.format,
                        quality: config.quality,
                    },
                    hits: 0,
                    misses: 0,
                    evictions: 0,
                }),
                limits,
                cleanup_pending: AtomicBool::new(false),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> Result<R, LockError> {
        self.shared
            .locks
            .with_lock(Resource::ThumbnailCache, || f(&mut self.shared.state()))
    }

    /// Estimated in-memory size of an image of the given dimensions.
    pub fn estimate_bytes(&self, width: u32, height: u32) -> usize {
        let limits = &self.shared.limits;
        let raw = width as f64 * height as f64 * limits.channels as f64;
        ((raw * limits.compression_factor).ceil() as usize).max(1)
    }

    pub fn encode_params(&self) -> Result<EncodeParams, LockError> {
        self.with_state(|state| state.params)
    }

    /// Switches the parameters used for subsequent lookups and inserts.
    /// Entries rendered with the old parameters are simply never hit again
    /// and age out through normal eviction.
    pub fn set_encode_params(&self, params: EncodeParams) -> Result<(), LockError> {
        self.with_state(|state| state.params = params)
    }

    /// Looks up a thumbnail and promotes it to most recently used.
    pub fn get(
        &self,
        path: &Path,
        width: u32,
        height: u32,
    ) -> Result<Option<ThumbnailImage>, LockError> {
        let path = normalize_path(path);
        self.with_state(|state| {
            let key = CacheKey::from_normalized(path, width, height, state.params);
            match state.entries.get(&key).map(|entry| entry.image.clone()) {
                Some(image) => {
                    state.hits += 1;
                    Some(image)
                }
                None => {
                    state.misses += 1;
                    None
                }
            }
        })
    }

    /// Checks for an entry without touching its recency.
    pub fn contains(&self, path: &Path, width: u32, height: u32) -> Result<bool, LockError> {
        let path = normalize_path(path);
        self.with_state(|state| {
            let key = CacheKey::from_normalized(path, width, height, state.params);
            state.entries.contains(&key)
        })
    }

    /// Inserts or replaces a thumbnail as most recently used.
    ///
    /// Returns `false` when the image alone is larger than the whole cache.
    pub fn put(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        image: ThumbnailImage,
    ) -> Result<bool, LockError> {
        let bytes = self.estimate_bytes(image.width(), image.height());
        let limits = self.shared.limits.clone();
        let path = normalize_path(path);
        if bytes > limits.max_bytes {
            tracing::warn!(
                "Thumbnail for {:?} needs ~{} bytes, more than the whole cache ({}); not cached",
                path,
                bytes,
                limits.max_bytes
            );
            // The replaced image must not be served in place of the new one.
            self.with_state(|state| {
                let key = CacheKey::from_normalized(path, width, height, state.params);
                if let Some(previous) = state.entries.pop(&key) {
                    state.total_bytes -= previous.bytes;
                }
            })?;
            return Ok(false);
        }

        let after = self.with_state(|state| {
            let key = CacheKey::from_normalized(path, width, height, state.params);
            let entry = CacheEntry {
                image,
                bytes,
                inserted_at: Instant::now(),
            };
            if let Some(previous) = state.entries.put(key, entry) {
                state.total_bytes -= previous.bytes;
            }
            state.total_bytes += bytes;

            if limits.reached(state, limits.critical_ratio) {
                let evicted = evict_to_target(state, &limits);
                tracing::info!(
                    "Thumbnail cache over critical threshold; evicted {} entries synchronously",
                    evicted
                );
                AfterPut::Nothing
            } else if limits.reached(state, limits.soft_ratio) {
                AfterPut::ScheduleCleanup
            } else {
                AfterPut::Nothing
            }
        })?;

        if let AfterPut::ScheduleCleanup = after {
            self.schedule_cleanup();
        }
        Ok(true)
    }

    /// Removes one size/format variant of a path.
    pub fn remove(&self, path: &Path, width: u32, height: u32) -> Result<bool, LockError> {
        let path = normalize_path(path);
        self.with_state(|state| {
            let key = CacheKey::from_normalized(path, width, height, state.params);
            match state.entries.pop(&key) {
                Some(entry) => {
                    state.total_bytes -= entry.bytes;
                    true
                }
                None => false,
            }
        })
    }

    /// Removes every cached variant of a path. Returns how many were dropped.
    pub fn invalidate(&self, path: &Path) -> Result<usize, LockError> {
        let path = normalize_path(path);
        self.with_state(|state| {
            let stale: Vec<CacheKey> = state
                .entries
                .iter()
                .filter(|(key, _)| key.path == path)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                if let Some(entry) = state.entries.pop(key) {
                    state.total_bytes -= entry.bytes;
                }
            }
            stale.len()
        })
    }

    pub fn clear(&self) -> Result<(), LockError> {
        self.with_state(|state| {
            state.entries.clear();
            state.total_bytes = 0;
        })?;
        tracing::debug!("Thumbnail cache cleared");
        Ok(())
    }

    /// Runs a cleanup pass now. Returns the number of evicted entries.
    pub fn cleanup(&self) -> Result<usize, LockError> {
        let limits = self.shared.limits.clone();
        self.with_state(|state| evict_to_target(state, &limits))
    }

    pub fn stats(&self) -> Result<CacheStats, LockError> {
        let limits = &self.shared.limits;
        self.with_state(|state| CacheStats {
            entries: state.entries.len(),
            bytes: state.total_bytes,
            max_entries: limits.max_entries,
            max_bytes: limits.max_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        })
    }

    /// Age of the oldest entry, for diagnostics.
    pub fn oldest_entry_age(&self) -> Result<Option<Duration>, LockError> {
        self.with_state(|state| {
            state
                .entries
                .iter()
                .map(|(_, entry)| entry.inserted_at.elapsed())
                .max()
        })
    }

    /// Schedules a single debounced cleanup; a burst of inserts triggers only one pass.
    fn schedule_cleanup(&self) {
        if self.shared.cleanup_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let delay = self.shared.limits.debounce;
        tracing::debug!("Thumbnail cache cleanup scheduled in {:?}", delay);

        let spawned = std::thread::Builder::new()
            .name("thumbnail-cache-cleanup".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                if let Some(shared) = weak.upgrade() {
                    ThumbnailCache { shared }.run_scheduled_cleanup();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Could not spawn cache cleanup thread: {}", e);
            self.shared.cleanup_pending.store(false, Ordering::Release);
        }
    }

    fn run_scheduled_cleanup(&self) {
        self.shared.cleanup_pending.store(false, Ordering::Release);
        let limits = self.shared.limits.clone();
        match self.with_state(|state| {
            if limits.reached(state, limits.soft_ratio) {
                evict_to_target(state, &limits)
            } else {
                0
            }
        }) {
            Ok(evicted) if evicted > 0 => {
                tracing::debug!("Debounced cache cleanup evicted {} entries", evicted)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Debounced cache cleanup skipped: {}", e),
        }
    }

    #[cfg(test)]
    fn cleanup_pending(&self) -> bool {
        self.shared.cleanup_pending.load(Ordering::Acquire)
    }
}

/// Pops least-recently-used entries until both totals are at or below target.
fn evict_to_target(state: &mut CacheState, limits: &Limits) -> usize {
    let target_entries = limits.target_entries();
    let target_bytes = limits.target_bytes();
    let mut evicted = 0;
    while state.entries.len() > target_entries || state.total_bytes > target_bytes {
        let Some((key, entry)) = state.entries.pop_lru() else {
            break;
        };
        state.total_bytes -= entry.bytes;
        evicted += 1;
        tracing::trace!("Evicted thumbnail {:?}", key.path);
    }
    state.evictions += evicted as u64;
    evicted
}
