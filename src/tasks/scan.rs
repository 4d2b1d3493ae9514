//! Scans a folder and pairs archives with their previews.

use std::path::PathBuf;
use walkdir::WalkDir;

use super::events::{BatchItem, TaskOutput};
use super::{Task, TaskContext, TaskKind};
use crate::core::{Classifier, FileKind, Pairer, ScanReport, TaskError, ValidationError};

/// Check cancellation every N entries while walking.
const CANCELLATION_CHECK_INTERVAL: usize = 10;

#[derive(Debug, Clone)]
pub struct ScanFolderTask {
    root: PathBuf,
    recursive: Option<bool>,
}

impl ScanFolderTask {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ValidationError> {
        let task = Self {
            root: root.into(),
            recursive: None,
        };
        task.validate()?;
        Ok(task)
    }

    /// Overrides the configured recursion setting.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = Some(recursive);
        self
    }
}

impl Task for ScanFolderTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Scan
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if !self.root.is_dir() {
            return Err(ValidationError::NotADirectory(self.root.clone()));
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        let pairing = &ctx.services().config.pairing;
        let classifier = Classifier::new(pairing);
        let recursive = self.recursive.unwrap_or(pairing.recursive);
        let max_depth = if recursive { usize::MAX } else { 1 };

        tracing::info!("Scanning {:?} (recursive: {})", self.root, recursive);
        ctx.set_total(0);
        ctx.progress(0, "Collecting entries...");

        let mut candidates = Vec::new();
        let mut ignored = 0;
        for (seen, entry) in WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .enumerate()
        {
            if seen % CANCELLATION_CHECK_INTERVAL == 0 {
                ctx.checkpoint()?;
                ctx.progress(seen, format!("Collecting entries... {} found", seen));
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry: {}", e);
                    ignored += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match classifier.classify(entry.path()) {
                FileKind::Other => ignored += 1,
                kind => candidates.push((entry.into_path(), kind)),
            }
        }
        ctx.checkpoint()?;

        let mut pairer = Pairer::new();
        for (path, kind) in candidates {
            pairer.add(path, kind);
        }
        let pairs = pairer.into_pairs();

        ctx.set_total(pairs.len());
        for (i, pair) in pairs.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.push_batch_item(BatchItem::Pair(pair.clone()));
            ctx.progress(i + 1, format!("Paired {}", pair.stem));
        }

        let report = ScanReport {
            root: self.root.clone(),
            archives_only: pairs
                .iter()
                .filter(|p| p.archive.is_some() && p.preview.is_none())
                .count(),
            previews_only: pairs
                .iter()
                .filter(|p| p.archive.is_none() && p.preview.is_some())
                .count(),
            pairs,
            ignored,
        };
        tracing::info!(
            "Scan of {:?} found {} complete pair(s), {} archive(s) and {} preview(s) without a partner",
            report.root,
            report.complete_pairs(),
            report.archives_only,
            report.previews_only
        );
        Ok(TaskOutput::Scan(report))
    }
}
