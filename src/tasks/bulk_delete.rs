//! Deletes file pairs.
//!
//! Read-only files are refused unless `force` is set, and a pair is only
//! touched once every one of its files is known to be deletable. Pairs whose
//! files are already gone count as skipped.

use std::fs;
use std::path::PathBuf;

use super::events::{BatchItem, TaskOutput};
use super::{Task, TaskContext, TaskKind};
use crate::core::file_ops::{delete_file, ensure_deletable};
use crate::core::{FilePair, OperationSummary, TaskError, ValidationError};
use crate::locks::Resource;

#[derive(Debug, Clone)]
pub struct BulkDeleteTask {
    pairs: Vec<FilePair>,
    force: bool,
}

impl BulkDeleteTask {
    pub fn new(pairs: Vec<FilePair>) -> Result<Self, ValidationError> {
        let task = Self { pairs, force: false };
        task.validate()?;
        Ok(task)
    }

    /// Deletes read-only files too.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

impl Task for BulkDeleteTask {
    fn kind(&self) -> TaskKind {
        TaskKind::BulkDelete
    }

    fn work_items(&self) -> usize {
        self.pairs.len()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.pairs.is_empty() {
            return Err(ValidationError::Empty("file pairs"));
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        let services = ctx.services().clone();
        let mut summary = OperationSummary::with_detail_limit(services.config.tasks.summary_detail_limit);
        let total = self.pairs.len();
        let force = self.force;

        ctx.set_total(total);
        for (i, pair) in self.pairs.iter().enumerate() {
            ctx.checkpoint()?;
            let label = pair.display_path();
            let existing: Vec<(PathBuf, fs::Metadata)> = pair
                .files()
                .filter_map(|path| Some((path.clone(), fs::symlink_metadata(path).ok()?)))
                .collect();

            if existing.is_empty() {
                summary.record_skip(&label, "already deleted");
            } else {
                if let Some(preview) = &pair.preview {
                    services.cache.invalidate(preview)?;
                }
                let deleted = services.locks.with_lock(Resource::FileSystem, || {
                    for (path, metadata) in &existing {
                        ensure_deletable(path, metadata, force)?;
                    }
                    for (path, _) in &existing {
                        delete_file(path, force)?;
                    }
                    anyhow::Ok(())
                })?;
                match deleted {
                    Ok(()) => {
                        summary.record_success();
                        ctx.push_batch_item(BatchItem::Processed(label));
                    }
                    Err(e) => {
                        tracing::debug!("Not deleting {:?}: {:#}", label, e);
                        summary.record_failure(&label, format!("{:#}", e));
                    }
                }
            }
            ctx.progress(i + 1, format!("Deleted {} of {}", i + 1, total));
        }

        tracing::info!("Delete: {}", summary);
        Ok(TaskOutput::Summary(summary))
    }
}
