//! Moves file pairs into a destination directory.
//!
//! Each pair moves as a unit: if its second file cannot be moved, the first
//! is moved back. A pair whose files already exist at the destination is
//! skipped, never overwritten.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::events::{BatchItem, TaskOutput};
use super::transaction::Transaction;
use super::{Task, TaskContext, TaskKind};
use crate::core::file_ops::move_file;
use crate::core::{FilePair, OperationSummary, TaskError, TransactionError, ValidationError};
use crate::locks::Resource;

#[derive(Debug, Clone)]
pub struct BulkMoveTask {
    pairs: Vec<FilePair>,
    destination: PathBuf,
}

impl BulkMoveTask {
    pub fn new(pairs: Vec<FilePair>, destination: impl Into<PathBuf>) -> Result<Self, ValidationError> {
        let task = Self {
            pairs,
            destination: destination.into(),
        };
        task.validate()?;
        Ok(task)
    }

    fn moves_for(&self, pair: &FilePair) -> Vec<(PathBuf, PathBuf)> {
        pair.files()
            .filter_map(|src| Some((src.clone(), target_in(&self.destination, src)?)))
            .collect()
    }
}

impl Task for BulkMoveTask {
    fn kind(&self) -> TaskKind {
        TaskKind::BulkMove
    }

    fn work_items(&self) -> usize {
        self.pairs.len()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.pairs.is_empty() {
            return Err(ValidationError::Empty("file pairs"));
        }
        if !self.destination.is_dir() {
            return Err(ValidationError::NotADirectory(self.destination.clone()));
        }
        let mut targets = HashSet::new();
        for pair in &self.pairs {
            for (_, target) in self.moves_for(pair) {
                if !targets.insert(target.clone()) {
                    return Err(ValidationError::DuplicateTarget(target));
                }
            }
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        let services = ctx.services().clone();
        let mut summary = OperationSummary::with_detail_limit(services.config.tasks.summary_detail_limit);
        let total = self.pairs.len();

        ctx.set_total(total);
        for (i, pair) in self.pairs.iter().enumerate() {
            ctx.checkpoint()?;
            let label = pair.display_path();
            let moves: Vec<(PathBuf, PathBuf)> = self
                .moves_for(pair)
                .into_iter()
                .filter(|(src, _)| src.exists())
                .collect();

            if moves.is_empty() {
                summary.record_skip(&label, "no files left to move");
            } else if let Some((_, taken)) = moves.iter().find(|(_, dst)| dst.exists()) {
                summary.record_skip(&label, format!("{} already exists", taken.display()));
            } else {
                if let Some(preview) = &pair.preview {
                    services.cache.invalidate(preview)?;
                }
                let moved = services
                    .locks
                    .with_lock(Resource::FileSystem, || move_pair(&pair.stem, &moves))?;
                match moved {
                    Ok(()) => {
                        summary.record_success();
                        ctx.push_batch_item(BatchItem::Processed(label));
                    }
                    Err(e) => {
                        tracing::warn!("Moving {:?} failed: {}", label, e);
                        summary.record_failure(&label, e);
                    }
                }
            }
            ctx.progress(i + 1, format!("Moved {} of {}", i + 1, total));
        }

        tracing::info!("Move to {:?}: {}", self.destination, summary);
        Ok(TaskOutput::Summary(summary))
    }
}

fn move_pair(stem: &str, moves: &[(PathBuf, PathBuf)]) -> Result<(), TransactionError> {
    let mut tx = Transaction::new(format!("move {}", stem));
    for (src, dst) in moves {
        tx.execute_with_rollback(
            format!("move {}", src.display()),
            format!("move back {}", dst.display()),
            |(src, dst): &(PathBuf, PathBuf)| move_file(src, dst),
            |moved: &PathBuf, (src, _): &(PathBuf, PathBuf)| move_file(moved, src).map(drop),
            (src.clone(), dst.clone()),
        )?;
    }
    tx.commit();
    Ok(())
}

/// Target path for `file` inside `destination`.
pub fn target_in(destination: &Path, file: &Path) -> Option<PathBuf> {
    file.file_name().map(|name| destination.join(name))
}
