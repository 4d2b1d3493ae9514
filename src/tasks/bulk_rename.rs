//! All-or-nothing renaming.
//!
//! Every rename is recorded in one [`Transaction`]. A failing rename,
//! a cancellation or a timeout undoes the renames already done, newest
//! first, before the task ends.

use std::collections::HashSet;
use std::path::PathBuf;

use super::events::{BatchItem, TaskOutput};
use super::transaction::Transaction;
use super::{Task, TaskContext, TaskKind};
use crate::core::file_ops::move_file;
use crate::core::{OperationSummary, TaskError, ValidationError};
use crate::locks::Resource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BulkRenameTask {
    renames: Vec<Rename>,
}

impl BulkRenameTask {
    pub fn new(renames: Vec<Rename>) -> Result<Self, ValidationError> {
        let task = Self { renames };
        task.validate()?;
        Ok(task)
    }

    /// Renames each file to `to_name` in its own directory.
    pub fn in_place<I, S>(entries: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (PathBuf, S)>,
        S: AsRef<str>,
    {
        let renames = entries
            .into_iter()
            .map(|(from, name)| {
                let to = from.with_file_name(name.as_ref());
                Rename { from, to }
            })
            .collect();
        Self::new(renames)
    }
}

impl Task for BulkRenameTask {
    fn kind(&self) -> TaskKind {
        TaskKind::BulkRename
    }

    fn work_items(&self) -> usize {
        self.renames.len()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.renames.is_empty() {
            return Err(ValidationError::Empty("renames"));
        }
        let mut targets = HashSet::new();
        for rename in &self.renames {
            if rename.from == rename.to {
                return Err(ValidationError::Invalid(format!(
                    "{} would be renamed to itself",
                    rename.from.display()
                )));
            }
            if !targets.insert(&rename.to) {
                return Err(ValidationError::DuplicateTarget(rename.to.clone()));
            }
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        let services = ctx.services().clone();
        let total = self.renames.len();
        let mut tx = Transaction::new(format!("rename {} file(s)", total));

        ctx.set_total(total);
        for (i, rename) in self.renames.iter().enumerate() {
            if let Err(stop) = ctx.checkpoint() {
                let report = services
                    .locks
                    .with_lock(Resource::FileSystem, || tx.rollback())?;
                tracing::info!("Rename stopped after {} of {}: {}", i, total, report);
                return Err(stop);
            }

            // Thumbnails follow paths, not files: both names change content.
            services.cache.invalidate(&rename.from)?;
            services.cache.invalidate(&rename.to)?;
            services
                .locks
                .with_lock(Resource::FileSystem, || {
                    tx.execute_with_rollback(
                        format!("rename {}", rename.from.display()),
                        format!("rename back {}", rename.to.display()),
                        |r: &Rename| move_file(&r.from, &r.to),
                        |renamed: &PathBuf, r: &Rename| move_file(renamed, &r.from).map(drop),
                        rename.clone(),
                    )
                })?
                .map_err(|e| TaskError::Failed(e.to_string()))?;

            ctx.push_batch_item(BatchItem::Processed(rename.to.clone()));
            ctx.progress(i + 1, format!("Renamed {} of {}", i + 1, total));
        }

        let committed = tx.commit();
        let mut summary = OperationSummary::with_detail_limit(services.config.tasks.summary_detail_limit);
        for _ in 0..committed {
            summary.record_success();
        }
        tracing::info!("Rename: {}", summary);
        Ok(TaskOutput::Summary(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AppContext;
    use crate::core::CancelReason;
    use crate::tasks::{TaskCoordinator, TaskResult};
    use crate::utils::test_helpers::results_until_terminal;
    use std::fs;
    use std::sync::{mpsc, Arc};
    use std::time::Duration;
    use tempfile::tempdir;

    fn files(dir: &std::path::Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|n| {
                let p = dir.join(n);
                fs::write(&p, n).unwrap();
                p
            })
            .collect()
    }

    #[test]
    fn test_rejects_duplicate_and_identity_renames() {
        let a = PathBuf::from("/x/a.zip");
        let b = PathBuf::from("/x/b.zip");
        let dup = BulkRenameTask::in_place([(a.clone(), "c.zip"), (b, "c.zip")]).unwrap_err();
        assert_eq!(dup, ValidationError::DuplicateTarget("/x/c.zip".into()));
        assert!(matches!(
            BulkRenameTask::in_place([(a, "a.zip")]).unwrap_err(),
            ValidationError::Invalid(_)
        ));
    }

    #[test]
    fn test_failure_rolls_back_completed_renames() {
        let dir = tempdir().unwrap();
        let paths = files(dir.path(), &["a.zip", "b.zip", "taken.zip"]);
        // The second rename collides with an existing file.
        let task = BulkRenameTask::in_place([
            (paths[0].clone(), "a2.zip"),
            (paths[1].clone(), "taken.zip"),
        ])
        .unwrap();

        let services = Arc::new(AppContext::for_tests());
        let coordinator = TaskCoordinator::new("rename", services).unwrap();
        let (tx, rx) = mpsc::channel();
        let id = coordinator.submit(task, tx).unwrap();
        let results = results_until_terminal(&rx, id, Duration::from_secs(5));

        let Some(TaskResult::Failed(message)) = results.last() else {
            panic!("unexpected results {:?}", results);
        };
        assert!(message.contains("rolled back 1 step(s)"), "{}", message);
        assert!(paths[0].exists());
        assert!(!dir.path().join("a2.zip").exists());
        assert_eq!(fs::read_to_string(&paths[2]).unwrap(), "taken.zip");
    }

    #[test]
    fn test_all_renames_commit() {
        let dir = tempdir().unwrap();
        let paths = files(dir.path(), &["a.zip", "a.jpg"]);
        let task =
            BulkRenameTask::in_place([(paths[0].clone(), "b.zip"), (paths[1].clone(), "b.jpg")])
                .unwrap();

        let services = Arc::new(AppContext::for_tests());
        let coordinator = TaskCoordinator::new("rename", services).unwrap();
        let (tx, rx) = mpsc::channel();
        let id = coordinator.submit(task, tx).unwrap();
        let results = results_until_terminal(&rx, id, Duration::from_secs(5));

        let Some(TaskResult::Finished(TaskOutput::Summary(summary))) = results.last() else {
            panic!("unexpected results {:?}", results);
        };
        assert_eq!(summary.succeeded, 2);
        assert!(dir.path().join("b.zip").exists());
        assert!(dir.path().join("b.jpg").exists());
    }

    #[test]
    fn test_reused_name_does_not_serve_the_old_thumbnail() {
        let dir = tempdir().unwrap();
        let paths = files(dir.path(), &["a.png", "c.png"]);
        let (a, c) = (paths[0].clone(), paths[1].clone());
        let b = dir.path().join("b.png");

        let services = Arc::new(AppContext::for_tests());
        let thumbnail = Arc::new(image::DynamicImage::new_rgb8(64, 64));
        assert!(services.cache.put(&a, 64, 64, thumbnail).unwrap());

        let coordinator = TaskCoordinator::new("rename", services.clone()).unwrap();
        let (tx, rx) = mpsc::channel();
        for (from, name) in [(a.clone(), "b.png"), (c, "a.png")] {
            let task = BulkRenameTask::in_place([(from, name)]).unwrap();
            let id = coordinator.submit(task, tx.clone()).unwrap();
            let results = results_until_terminal(&rx, id, Duration::from_secs(5));
            assert!(matches!(results.last(), Some(TaskResult::Finished(_))));
        }

        assert_eq!(fs::read_to_string(&a).unwrap(), "c.png");
        assert!(services.cache.get(&a, 64, 64).unwrap().is_none());
        assert!(services.cache.get(&b, 64, 64).unwrap().is_none());
    }

    #[test]
    fn test_cancellation_rolls_back() {
        let dir = tempdir().unwrap();
        let names: Vec<String> = (0..200).map(|i| format!("f{}.zip", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let paths = files(dir.path(), &refs);
        let task = BulkRenameTask::in_place(
            paths.iter().map(|p| (p.clone(), format!("renamed-{}", p.file_name().unwrap().to_string_lossy()))),
        )
        .unwrap();

        let services = Arc::new(AppContext::for_tests());
        let coordinator = TaskCoordinator::new("rename", services).unwrap();
        let (tx, rx) = mpsc::channel();
        let id = coordinator.submit(task, tx).unwrap();
        coordinator.cancel(id);
        let results = results_until_terminal(&rx, id, Duration::from_secs(5));

        match results.last() {
            Some(TaskResult::Cancelled(CancelReason::User)) => {
                assert!(paths.iter().all(|p| p.exists()));
            }
            // The whole batch can finish before the cancel lands.
            Some(TaskResult::Finished(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }
}
