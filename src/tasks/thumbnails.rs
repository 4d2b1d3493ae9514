use std::path::PathBuf;
use std::sync::Arc;

use super::events::{BatchItem, TaskOutput};
use super::{Task, TaskContext, TaskKind};
use crate::core::{OperationSummary, TaskError, ValidationError};

/// Generates and caches thumbnails for preview images.
#[derive(Debug, Clone)]
pub struct GenerateThumbnailsTask {
    paths: Vec<PathBuf>,
    width: u32,
    height: u32,
}

impl GenerateThumbnailsTask {
    pub fn new(paths: Vec<PathBuf>, width: u32, height: u32) -> Result<Self, ValidationError> {
        let task = Self {
            paths,
            width,
            height,
        };
        task.validate()?;
        Ok(task)
    }
}

impl Task for GenerateThumbnailsTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Thumbnails
    }

    fn work_items(&self) -> usize {
        self.paths.len()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.paths.is_empty() {
            return Err(ValidationError::Empty("preview paths"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ValidationError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut TaskContext) -> Result<TaskOutput, TaskError> {
        let services = ctx.services().clone();
        let (width, height) = (self.width, self.height);
        let mut summary = OperationSummary::with_detail_limit(services.config.tasks.summary_detail_limit);

        ctx.set_total(self.paths.len());
        for (i, path) in self.paths.iter().enumerate() {
            ctx.checkpoint()?;

            if services.cache.contains(path, width, height)? {
                summary.record_skip(path, "already cached");
            } else {
                match services.thumbnailer.generate(path, width, height) {
                    Ok(image) => {
                        if services.cache.put(path, width, height, Arc::new(image))? {
                            summary.record_success();
                            ctx.push_batch_item(BatchItem::Thumbnail {
                                path: path.clone(),
                                width,
                                height,
                            });
                        } else {
                            summary.record_failure(path, "too large for the thumbnail cache");
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Thumbnail failed for {:?}: {}", path, e);
                        summary.record_failure(path, e);
                    }
                }
            }
            ctx.progress(i + 1, format!("Thumbnail {} of {}", i + 1, self.paths.len()));
        }

        tracing::info!("Thumbnails: {}", summary);
        Ok(TaskOutput::Summary(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AppContext;
    use crate::tasks::{TaskCoordinator, TaskResult};
    use crate::utils::test_helpers::results_until_terminal;
    use image::DynamicImage;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(
            GenerateThumbnailsTask::new(vec![], 64, 64).unwrap_err(),
            ValidationError::Empty("preview paths")
        );
        assert_eq!(
            GenerateThumbnailsTask::new(vec!["a.png".into()], 0, 64).unwrap_err(),
            ValidationError::InvalidDimensions {
                width: 0,
                height: 64
            }
        );
    }

    #[test]
    fn test_generates_caches_and_skips_cached() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.png");
        DynamicImage::new_rgb8(120, 80).save(&good).unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not an image").unwrap();

        let services = Arc::new(AppContext::for_tests());
        let coordinator = TaskCoordinator::new("thumbs", services.clone()).unwrap();
        let (tx, rx) = mpsc::channel();

        let task = GenerateThumbnailsTask::new(vec![good.clone(), broken.clone()], 64, 64).unwrap();
        let id = coordinator.submit(task, tx.clone()).unwrap();
        let results = results_until_terminal(&rx, id, Duration::from_secs(5));
        let Some(TaskResult::Finished(TaskOutput::Summary(summary))) = results.last() else {
            panic!("unexpected results {:?}", results);
        };
        assert_eq!((summary.succeeded, summary.failed, summary.skipped), (1, 1, 0));
        assert_eq!(summary.details[0].path, broken);
        assert!(services.cache.contains(&good, 64, 64).unwrap());

        let again = GenerateThumbnailsTask::new(vec![good], 64, 64).unwrap();
        let id = coordinator.submit(again, tx).unwrap();
        let results = results_until_terminal(&rx, id, Duration::from_secs(5));
        let Some(TaskResult::Finished(TaskOutput::Summary(summary))) = results.last() else {
            panic!("unexpected results {:?}", results);
        };
        assert_eq!(summary.skipped, 1);
    }
}
