//! Services shared by every coordinator and task.
//!
//! Built once at startup and passed around as `Arc<AppContext>`; nothing in
//! the crate reaches for a global instance.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::cache::ThumbnailCache;
use crate::config::AppConfig;
use crate::core::{
    ImageThumbnailer, JsonMetadataStore, LockError, Metadata, MetadataStore, StoreError,
    Thumbnailer,
};
use crate::locks::{Resource, ResourceLocks};
use crate::memory::{MemoryGauge, MemoryMonitor};

pub struct AppContext {
    pub config: AppConfig,
    pub locks: Arc<ResourceLocks>,
    pub cache: ThumbnailCache,
    pub metadata: Arc<dyn MetadataStore>,
    pub thumbnailer: Arc<dyn Thumbnailer>,
    pub memory: Arc<MemoryGauge>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let locks = Arc::new(ResourceLocks::new());
        let cache = ThumbnailCache::new(&config.cache, locks.clone());
        Ok(Self {
            config,
            locks,
            cache,
            metadata: Arc::new(JsonMetadataStore),
            thumbnailer: Arc::new(ImageThumbnailer),
            memory: Arc::new(MemoryGauge::new()),
        })
    }

    pub fn with_metadata_store(mut self, store: impl MetadataStore) -> Self {
        self.metadata = Arc::new(store);
        self
    }

    pub fn with_thumbnailer(mut self, thumbnailer: impl Thumbnailer) -> Self {
        self.thumbnailer = Arc::new(thumbnailer);
        self
    }

    /// A monitor that feeds this context's memory gauge.
    pub fn memory_monitor(&self) -> MemoryMonitor {
        MemoryMonitor::new(&self.config.memory, self.memory.clone())
    }

    /// Loads a directory's metadata while holding the metadata lock.
    pub fn load_metadata(&self, directory: &Path) -> Result<Metadata, MetadataAccessError> {
        Ok(self
            .locks
            .with_lock(Resource::Metadata, || self.metadata.load(directory))??)
    }

    /// Load, modify and save as one critical section.
    pub fn update_metadata<R>(
        &self,
        directory: &Path,
        f: impl FnOnce(&mut Metadata) -> R,
    ) -> Result<(R, Metadata), MetadataAccessError> {
        let result = self.locks.with_lock(Resource::Metadata, || {
            let mut metadata = self.metadata.load(directory)?;
            let out = f(&mut metadata);
            metadata.updated_at = Some(chrono::Utc::now());
            self.metadata.save(directory, &metadata)?;
            Ok::<_, StoreError>((out, metadata))
        })??;
        Ok(result)
    }

    pub fn save_metadata(
        &self,
        directory: &Path,
        metadata: &Metadata,
    ) -> Result<(), MetadataAccessError> {
        Ok(self
            .locks
            .with_lock(Resource::Metadata, || self.metadata.save(directory, metadata))??)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(AppConfig::default()).expect("default config is valid")
    }
}

/// Either the lock or the store refused.
#[derive(Debug, thiserror::Error)]
pub enum MetadataAccessError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<MetadataAccessError> for crate::core::TaskError {
    fn from(error: MetadataAccessError) -> Self {
        crate::core::TaskError::failed(error)
    }
}
