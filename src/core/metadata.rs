//! The per-directory metadata store collaborator.
//!
//! The task layer only needs `load`/`save`; callers wrap every call in the
//! `Resource::Metadata` lock. `JsonMetadataStore` gives the durability the
//! tasks rely on by writing to a temp file in the same directory and
//! atomically replacing the target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::error::StoreError;

pub const METADATA_VERSION: u32 = 1;
pub const METADATA_FILE: &str = ".pairview.json";

/// Tags keyed by pair stem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeMap<String, BTreeSet<String>>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            updated_at: None,
            tags: BTreeMap::new(),
        }
    }
}

impl Metadata {
    /// Adds tags to a stem. Returns how many were new.
    pub fn add_tags<I, S>(&mut self, stem: &str, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.tags.entry(stem.to_string()).or_default();
        tags.into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.trim().is_empty())
            .filter(|t| entry.insert(t.clone()))
            .count()
    }

    pub fn tags_for(&self, stem: &str) -> Option<&BTreeSet<String>> {
        self.tags.get(stem)
    }
}

pub trait MetadataStore: Send + Sync + 'static {
    /// Loads the metadata of `directory`; a directory without a store file yields defaults.
    fn load(&self, directory: &Path) -> Result<Metadata, StoreError>;

    /// Persists the metadata of `directory` durably.
    fn save(&self, directory: &Path, metadata: &Metadata) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct JsonMetadataStore;

impl JsonMetadataStore {
    pub fn file_path(directory: &Path) -> PathBuf {
        directory.join(METADATA_FILE)
    }
}

impl MetadataStore for JsonMetadataStore {
    fn load(&self, directory: &Path) -> Result<Metadata, StoreError> {
        let path = Self::file_path(directory);
        if !path.exists() {
            return Ok(Metadata::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| StoreError::Io(e, path.clone()))?;
        let metadata = serde_json::from_str(&content)?;
        tracing::debug!("Loaded metadata from {:?}", path);
        Ok(metadata)
    }

    fn save(&self, directory: &Path, metadata: &Metadata) -> Result<(), StoreError> {
        let path = Self::file_path(directory);
        let mut stamped = metadata.clone();
        stamped.updated_at = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&stamped)?;

        let mut tmp = NamedTempFile::new_in(directory)
            .map_err(|e| StoreError::Io(e, directory.to_path_buf()))?;
        tmp.write_all(&json)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StoreError::Io(e, tmp.path().to_path_buf()))?;
        tmp.persist(&path)?;

        tracing::debug!("Saved metadata to {:?}", path);
        Ok(())
    }
}
