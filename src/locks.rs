//! Process-wide named locks guarding the shared resources.
//!
//! Every acquisition goes through [`ResourceLocks::with_lock`], so lock scope
//! is visible at each call site. A thread may hold at most one named lock at a
//! time; asking for a second one is rejected with [`LockError::Nested`]. The
//! locks are never nested, so no lock ordering is needed.

use std::cell::Cell;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::core::LockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Metadata,
    ThumbnailCache,
    FileSystem,
}

impl Resource {
    pub fn name(self) -> &'static str {
        match self {
            Resource::Metadata => "metadata",
            Resource::ThumbnailCache => "thumbnail_cache",
            Resource::FileSystem => "file_system",
        }
    }
}

thread_local! {
    static HELD: Cell<Option<Resource>> = const { Cell::new(None) };
}

/// Clears the held marker even if the closure panics.
struct HeldMarker;

impl Drop for HeldMarker {
    fn drop(&mut self) {
        HELD.with(|held| held.set(None));
    }
}

#[derive(Debug, Default)]
pub struct ResourceLocks {
    metadata: Mutex<()>,
    thumbnail_cache: Mutex<()>,
    file_system: Mutex<()>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, resource: Resource) -> &Mutex<()> {
        match resource {
            Resource::Metadata => &self.metadata,
            Resource::ThumbnailCache => &self.thumbnail_cache,
            Resource::FileSystem => &self.file_system,
        }
    }

    /// Runs `f` while holding the named lock for `resource`.
    ///
    /// Keep `f` to the read/modify/write that needs the resource; never do
    /// unrelated I/O inside it.
    pub fn with_lock<R>(&self, resource: Resource, f: impl FnOnce() -> R) -> Result<R, LockError> {
        if let Some(held) = HELD.with(Cell::get) {
            return Err(LockError::Nested {
                held: held.name(),
                requested: resource.name(),
            });
        }

        let wait_started = Instant::now();
        // A panic while holding a `()` guard leaves nothing inconsistent behind.
        let _guard = self
            .mutex(resource)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        HELD.with(|held| held.set(Some(resource)));
        let _marker = HeldMarker;

        let acquired = Instant::now();
        tracing::trace!(
            lock = resource.name(),
            waited_us = wait_started.elapsed().as_micros() as u64,
            "lock acquired"
        );
        let result = f();
        tracing::trace!(
            lock = resource.name(),
            held_us = acquired.elapsed().as_micros() as u64,
            "lock released"
        );
        Ok(result)
    }

    /// The named lock the current thread holds, if any.
    pub fn held_by_current_thread() -> Option<Resource> {
        HELD.with(Cell::get)
    }
}
