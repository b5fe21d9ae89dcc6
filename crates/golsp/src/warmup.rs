//
// warmup.rs
//
// Background warm-up of the workspace index after initialization
//

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::loader::UnitLoader;
use crate::unit::UnitKey;
use crate::workspace_index::WorkspaceIndex;

#[derive(Debug, Clone, Copy)]
pub struct WarmupOptions {
    pub max_parallel: usize,
    pub timeout: Duration,
    /// Also fully check every unit, not only summarize it
    pub check_units: bool,
}

/// What a warm-up run got through before it finished or was stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub packages: usize,
    pub summaries: usize,
    pub units: usize,
    pub failures: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct Progress {
    packages: AtomicUsize,
    summaries: AtomicUsize,
    units: AtomicUsize,
    failures: AtomicUsize,
}

impl Progress {
    fn report(&self) -> WarmupReport {
        WarmupReport {
            packages: self.packages.load(Ordering::Relaxed),
            summaries: self.summaries.load(Ordering::Relaxed),
            units: self.units.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timed_out: false,
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Summaries,
    Units,
}

/// A running warm-up. Dropping the handle does not stop the task; call
/// [`Warmup::cancel`].
pub struct Warmup {
    cancel: CancellationToken,
    task: JoinHandle<WarmupReport>,
}

impl Warmup {
    /// Spawn a warm-up that loads the summary (and, optionally, the checked
    /// unit) of every package in the workspace, stopping at the deadline.
    pub fn start(loader: UnitLoader, index: Arc<WorkspaceIndex>, options: WarmupOptions) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(loader, index, options, cancel.clone()));
        Self { cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to end. `None` if it panicked.
    pub async fn finish(self) -> Option<WarmupReport> {
        match self.task.await {
            Ok(report) => Some(report),
            Err(err) => {
                log::error!("Warm-up task failed: {}", err);
                None
            }
        }
    }
}

async fn run(
    loader: UnitLoader,
    index: Arc<WorkspaceIndex>,
    options: WarmupOptions,
    cancel: CancellationToken,
) -> WarmupReport {
    let timing = crate::perf::TimingGuard::new("workspace warm-up");
    let deadline = Instant::now() + options.timeout;
    let progress = Arc::new(Progress::default());

    let work = warm(&loader, &index, options, &cancel, &progress);
    let (timed_out, cancelled) = tokio::select! {
        biased;
        _ = cancel.cancelled() => (false, true),
        _ = tokio::time::sleep_until(deadline) => (true, false),
        _ = work => (false, false),
    };
    // Loads still in flight observe this and leave no cache entry behind
    cancel.cancel();

    let report = WarmupReport {
        timed_out,
        cancelled,
        ..progress.report()
    };
    let elapsed = timing.finish();
    if timed_out {
        log::warn!(
            "Workspace warm-up stopped at its {:?} deadline ({} of {} packages summarized)",
            options.timeout,
            report.summaries,
            report.packages
        );
    } else if cancelled {
        log::debug!("Workspace warm-up cancelled");
    } else {
        log::info!(
            "Workspace warm-up: {} packages, {} summaries, {} units, {} failures in {:?}",
            report.packages,
            report.summaries,
            report.units,
            report.failures,
            elapsed
        );
    }
    report
}

async fn warm(
    loader: &UnitLoader,
    index: &WorkspaceIndex,
    options: WarmupOptions,
    cancel: &CancellationToken,
    progress: &Arc<Progress>,
) {
    let keys = index.all_keys(loader).await;
    progress.packages.store(keys.len(), Ordering::Relaxed);
    log::debug!("Warming {} units", keys.len());

    load_all(loader, &keys, Phase::Summaries, options.max_parallel, cancel, progress).await;
    if options.check_units {
        load_all(loader, &keys, Phase::Units, options.max_parallel, cancel, progress).await;
    }
}

async fn load_all(
    loader: &UnitLoader,
    keys: &[UnitKey],
    phase: Phase,
    max_parallel: usize,
    cancel: &CancellationToken,
    progress: &Arc<Progress>,
) {
    let permits = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut tasks = JoinSet::new();
    for key in keys {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let loader = loader.clone();
        let key = key.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let result = match phase {
                Phase::Summaries => loader.summary(&key, &cancel).await.map(|_| ()),
                Phase::Units => loader.unit(&key, &cancel).await.map(|_| ()),
            };
            match result {
                Ok(()) => {
                    let counter = match phase {
                        Phase::Summaries => &progress.summaries,
                        Phase::Units => &progress.units,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                Err(crate::error::LoadError::Cancelled) => {}
                Err(err) => {
                    log::trace!("Warm-up could not load {}: {}", key, err);
                    progress.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::import_resolve::ImportResolver;
    use crate::build::BuildContext;
    use crate::overlay::OverlayStore;
    use crate::toolchain::GoToolchain;
    use crate::unit_cache::UnitCache;
    use std::fs;
    use std::path::Path;

    fn loader() -> UnitLoader {
        UnitLoader::new(
            Arc::new(OverlayStore::new()),
            Arc::new(GoToolchain),
            Arc::new(ImportResolver::new(Arc::new(BuildContext::default()))),
            Arc::new(UnitCache::new("units", 64)),
            Arc::new(UnitCache::new("summaries", 64)),
        )
    }

    fn write_module(root: &Path) {
        fs::write(root.join("go.mod"), "module example.com/w\n").unwrap();
        for (dir, text) in [
            ("a", "package a\n\nfunc A() {}\n"),
            ("b", "package b\n\nimport \"example.com/w/a\"\n\nfunc B() { a.A() }\n"),
        ] {
            fs::create_dir_all(root.join(dir)).unwrap();
            fs::write(root.join(dir).join(format!("{}.go", dir)), text).unwrap();
        }
    }

    #[tokio::test]
    async fn test_warmup_loads_every_package() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        write_module(&root);
        let loader = loader();
        let index = Arc::new(WorkspaceIndex::new(Some(root)));

        let warmup = Warmup::start(
            loader.clone(),
            index,
            WarmupOptions {
                max_parallel: 2,
                timeout: Duration::from_secs(30),
                check_units: true,
            },
        );
        let report = warmup.finish().await.unwrap();
        assert_eq!(report.packages, 2);
        assert_eq!(report.summaries, 2);
        assert_eq!(report.units, 2);
        assert!(!report.timed_out && !report.cancelled);
        assert_eq!(loader.units().ready_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_warmup_reports_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        write_module(&root);

        let warmup = Warmup::start(
            loader(),
            Arc::new(WorkspaceIndex::new(Some(root))),
            WarmupOptions {
                max_parallel: 1,
                timeout: Duration::from_secs(30),
                check_units: true,
            },
        );
        warmup.cancel();
        let report = warmup.finish().await.unwrap();
        assert!(report.cancelled);
    }

    #[tokio::test]
    async fn test_zero_deadline_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        write_module(&root);

        let warmup = Warmup::start(
            loader(),
            Arc::new(WorkspaceIndex::new(Some(root))),
            WarmupOptions {
                max_parallel: 1,
                timeout: Duration::ZERO,
                check_units: false,
            },
        );
        let report = warmup.finish().await.unwrap();
        assert!(report.timed_out || report.summaries == 2);
    }
}
