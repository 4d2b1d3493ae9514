//! Tasks that read and write the per-directory metadata store.
//!
//! Every store access happens inside the metadata lock; `ApplyTagsTask`
//! holds it across its whole load, modify and save.

use std::path::{Path, PathBuf};

use super::events::TaskOutput;
use super::{Priority, Task, TaskContext, TaskKind};
use crate::core::{Metadata, TaskError, ValidationError};

fn require_directory(directory: &Path) -> Result<(), ValidationError> {
    if !directory.is_dir() {
        return Err(ValidationError::NotADirectory(directory.to_path_buf()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LoadMetadataTask {
    directory: PathBuf,
}

impl LoadMetadataTask {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, ValidationError> {
        let task = Self {
            directory: directory.into(),
        };
        task.validate()?;
        Ok(task)
    }
}

impl Task for LoadMetadataTask {
    fn kind(&self) -> TaskKind {
        TaskKind::MetadataLoad
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_directory(&self.directory)
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        ctx.checkpoint()?;
        let metadata = ctx.services().load_metadata(&self.directory)?;
        Ok(TaskOutput::Metadata(metadata))
    }
}

/// Replaces the stored metadata of a directory.
#[derive(Debug, Clone)]
pub struct SaveMetadataTask {
    directory: PathBuf,
    metadata: Metadata,
}

impl SaveMetadataTask {
    pub fn new(directory: impl Into<PathBuf>, metadata: Metadata) -> Result<Self, ValidationError> {
        let task = Self {
            directory: directory.into(),
            metadata,
        };
        task.validate()?;
        Ok(task)
    }
}

impl Task for SaveMetadataTask {
    fn kind(&self) -> TaskKind {
        TaskKind::MetadataSave
    }

    // A newer scan must not supersede a pending save.
    fn priority(&self) -> Priority {
        Priority::High
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_directory(&self.directory)
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        ctx.checkpoint()?;
        ctx.services()
            .save_metadata(&self.directory, &self.metadata)?;
        tracing::info!("Saved metadata for {:?}", self.directory);
        Ok(TaskOutput::Unit)
    }
}

/// Adds tags to pairs, keyed by stem.
#[derive(Debug, Clone)]
pub struct ApplyTagsTask {
    directory: PathBuf,
    tags: Vec<(String, Vec<String>)>,
}

impl ApplyTagsTask {
    pub fn new(
        directory: impl Into<PathBuf>,
        tags: Vec<(String, Vec<String>)>,
    ) -> Result<Self, ValidationError> {
        let task = Self {
            directory: directory.into(),
            tags,
        };
        task.validate()?;
        Ok(task)
    }
}

impl Task for ApplyTagsTask {
    fn kind(&self) -> TaskKind {
        TaskKind::MetadataSave
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn work_items(&self) -> usize {
        self.tags.len()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.tags.is_empty() {
            return Err(ValidationError::Empty("tags"));
        }
        require_directory(&self.directory)
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        ctx.checkpoint()?;
        let tags = &self.tags;
        let (added, metadata) = ctx.services().update_metadata(&self.directory, |metadata| {
            tags.iter()
                .map(|(stem, new_tags)| metadata.add_tags(stem, new_tags.iter().cloned()))
                .sum::<usize>()
        })?;
        tracing::info!("Added {} tag(s) in {:?}", added, self.directory);
        Ok(TaskOutput::Metadata(metadata))
    }
}
