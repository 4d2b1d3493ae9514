use anyhow::{bail, Context, Result};
use pairview::config;
use pairview::context::AppContext;
use pairview::tasks::{
    GenerateThumbnailsTask, ScanFolderTask, TaskCoordinator, TaskEvent, TaskOutput, TaskResult,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

const USAGE: &str = "usage: pairview <directory> [--thumbnails]";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let Some(directory) = args.next().map(PathBuf::from) else {
        bail!(USAGE);
    };
    let thumbnails = match args.next().as_deref() {
        None => false,
        Some("--thumbnails") => true,
        Some(other) => bail!("unknown argument '{}'\n{}", other, USAGE),
    };

    let config = config::settings::load_config(None)?;
    let services = Arc::new(AppContext::new(config)?);
    let monitor = Arc::new(services.memory_monitor());
    let coordinator = Arc::new(TaskCoordinator::new("library", services.clone())?);
    monitor.register(&coordinator);
    let monitor_handle = monitor.clone().spawn();

    let (tx, mut rx) = mpsc::unbounded_channel::<TaskEvent>();
    let scan = ScanFolderTask::new(&directory).context("cannot scan this path")?;
    let scan_id = coordinator.submit(scan, tx.clone())?;

    while let Some(event) = rx.recv().await {
        match event.result {
            TaskResult::Progress(p) => tracing::debug!("[{}%] {}", p.percent, p.message),
            TaskResult::PartialBatch(items) => tracing::debug!("{} item(s) streamed", items.len()),
            TaskResult::Finished(TaskOutput::Scan(report)) if event.task_id == scan_id => {
                println!(
                    "{}: {} pair(s), {} complete, {} archive(s) alone, {} preview(s) alone, {} ignored",
                    report.root.display(),
                    report.pairs.len(),
                    report.complete_pairs(),
                    report.archives_only,
                    report.previews_only,
                    report.ignored
                );
                let previews: Vec<PathBuf> =
                    report.pairs.into_iter().filter_map(|p| p.preview).collect();
                if !thumbnails || previews.is_empty() {
                    break;
                }
                let task = GenerateThumbnailsTask::new(previews, 256, 256)?;
                coordinator.submit(task, tx.clone())?;
            }
            TaskResult::Finished(TaskOutput::Summary(summary)) => {
                println!("thumbnails: {}", summary);
                println!("{}", services.cache.stats()?);
                break;
            }
            TaskResult::Finished(_) => break,
            TaskResult::Cancelled(reason) => {
                eprintln!("stopped: {}", reason);
                break;
            }
            TaskResult::TimedOut { elapsed, budget } => {
                eprintln!("timed out after {:?} (budget {:?})", elapsed, budget);
                break;
            }
            TaskResult::Failed(message) => {
                eprintln!("failed: {}", message);
                break;
            }
        }
    }

    monitor_handle.stop();
    coordinator.shutdown();
    Ok(())
}

