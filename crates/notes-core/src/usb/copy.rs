//! Parallel copy engine
//!
//! Owns a rayon thread pool and runs every entry of a [`BackupPlan`] through
//! it. Entries are independent: a failure is recorded in that entry's outcome
//! and the rest of the batch keeps going. The batch reports exactly once, on a
//! fresh oneshot per run, after every entry has finished.
//!
//! ```text
//! CopyEngine::start(plan)
//!     │
//!     │ par_iter() over entries (fan-out)
//!     ▼
//! Per-entry worker:
//!   1. source still there?
//!   2. create destination parent
//!   3. sanitize file name
//!   4. remove stale destination
//!   5. copy bytes ── CopyProgress (crossbeam)
//!     │
//!     │ collect() (fan-in)
//!     ▼
//! BackupReport ── oneshot ── BackupHandle
//! ```

use super::error::{BackupError, BackupResult, CopyError};
use super::plan::{sanitize_component, BackupEntry, BackupPlan};
use crossbeam::channel::{unbounded, Receiver};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Default number of copy workers
///
/// Small on purpose: USB sticks slow down under many concurrent writers.
pub const DEFAULT_COPY_THREADS: usize = 4;

/// Shared cancellation flag for one batch
///
/// Checked before each entry starts; entries already copying finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of copying one entry: bytes written, or why it was skipped
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub entry: BackupEntry,
    pub result: Result<u64, CopyError>,
}

impl CopyOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-entry progress while a batch runs
#[derive(Debug, Clone)]
pub enum CopyProgress {
    /// An entry was copied
    Copied {
        destination: PathBuf,
        bytes: u64,
    },
    /// An entry failed; the batch continues
    Failed {
        source: PathBuf,
        error: CopyError,
    },
}

/// Aggregate result of one batch
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub destination_root: PathBuf,
    /// One outcome per plan entry, in plan order
    pub outcomes: Vec<CopyOutcome>,
    pub duration: Duration,
}

impl BackupReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn copied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.copied()
    }

    pub fn bytes_copied(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }

    /// Failed entries with their errors
    pub fn failures(&self) -> impl Iterator<Item = (&BackupEntry, &CopyError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.entry, e)))
    }

    /// Short user-facing status text
    pub fn status_line(&self) -> String {
        match self.failed() {
            0 => "Backup to USB complete".to_string(),
            n => format!("Backup to USB complete ({} of {} files failed)", n, self.total()),
        }
    }
}

/// Handle to a running batch
///
/// Created fresh for every batch, so a finished or abandoned run can never
/// report into a later one.
pub struct BackupHandle {
    progress_rx: Receiver<CopyProgress>,
    completion: oneshot::Receiver<BackupReport>,
    cancel: CancelToken,
}

impl BackupHandle {
    /// Per-entry progress messages (copied/failed)
    pub fn progress(&self) -> &Receiver<CopyProgress> {
        &self.progress_rx
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Non-blocking completion check
    ///
    /// Returns `None` while any entry is still running.
    pub fn try_report(&mut self) -> Option<BackupReport> {
        self.completion.try_recv().ok()
    }

    /// Block until every entry has reported
    ///
    /// Must not be called from inside an async runtime; use [`BackupHandle::finished`] there.
    pub fn wait(self) -> BackupResult<BackupReport> {
        self.completion
            .blocking_recv()
            .map_err(|_| BackupError::CompletionLost)
    }

    /// Await completion from async code
    pub async fn finished(self) -> BackupResult<BackupReport> {
        self.completion.await.map_err(|_| BackupError::CompletionLost)
    }
}

/// Thread pool service for backup copies
///
/// The pool is reusable: create once at startup, not per backup.
pub struct CopyEngine {
    thread_pool: Arc<rayon::ThreadPool>,
}

impl CopyEngine {
    pub fn new(num_threads: usize) -> BackupResult<Self> {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("backup-copy-{}", i))
            .build()
            .map_err(|e| BackupError::WorkerPool(e.to_string()))?;

        Ok(Self {
            thread_pool: Arc::new(thread_pool),
        })
    }

    /// Start copying every entry of `plan`
    ///
    /// Returns immediately; the batch runs on the pool.
    pub fn start(&self, plan: BackupPlan) -> BackupHandle {
        self.start_with(plan, copy_entry)
    }

    /// Start a batch with a custom per-entry copy step
    pub fn start_with<F>(&self, plan: BackupPlan, copy: F) -> BackupHandle
    where
        F: Fn(&BackupEntry) -> Result<u64, CopyError> + Send + Sync + 'static,
    {
        let (progress_tx, progress_rx) = unbounded();
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();

        log::info!("Copy engine: starting {}", plan.summary());

        self.thread_pool.spawn(move || {
            let start_time = Instant::now();
            let BackupPlan {
                destination_root,
                entries,
                ..
            } = plan;

            let outcomes: Vec<CopyOutcome> = entries
                .into_par_iter()
                .map(|entry| {
                    let result = if worker_cancel.is_cancelled() {
                        Err(CopyError::Cancelled)
                    } else {
                        copy(&entry)
                    };

                    let progress = match &result {
                        Ok(bytes) => CopyProgress::Copied {
                            destination: entry.destination.clone(),
                            bytes: *bytes,
                        },
                        Err(error) => {
                            log::warn!("Copy engine: {} not backed up: {}", entry.source.display(), error);
                            CopyProgress::Failed {
                                source: entry.source.clone(),
                                error: error.clone(),
                            }
                        }
                    };
                    let _ = progress_tx.send(progress);

                    CopyOutcome { entry, result }
                })
                .collect();

            let report = BackupReport {
                destination_root,
                outcomes,
                duration: start_time.elapsed(),
            };

            log::info!(
                "Copy engine: {} of {} files copied in {:.1}s",
                report.copied(),
                report.total(),
                report.duration.as_secs_f64()
            );

            let _ = done_tx.send(report);
        });

        BackupHandle {
            progress_rx,
            completion: done_rx,
            cancel,
        }
    }
}

/// Copy one planned entry, overwriting any previous copy
///
/// Each step's failure maps to its own [`CopyError`] variant.
pub fn copy_entry(entry: &BackupEntry) -> Result<u64, CopyError> {
    if !entry.source.is_file() {
        return Err(CopyError::SourceMissing(entry.source.clone()));
    }

    if let Some(parent) = entry.destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CopyError::DirectoryCreateFailed {
            path: parent.to_path_buf(),
            reason: e.to_string(),
        })?;
    }

    let destination = match entry.destination.file_name() {
        Some(name) => entry.destination.with_file_name(sanitize_component(name)),
        None => entry.destination.clone(),
    };

    if destination.exists() {
        if let Err(e) = std::fs::remove_file(&destination) {
            log::debug!("copy_entry: could not remove stale {}: {}", destination.display(), e);
        }
    }

    std::fs::copy(&entry.source, &destination).map_err(|e| CopyError::CopyFailed {
        path: destination.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::plan::build_backup_plan;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn sample_tree(root: &Path) -> PathBuf {
        let notes = root.join("notes");
        write(&notes.join("Math/a.txt"), "alpha");
        write(&notes.join("Math/sub/b.txt"), "beta");
        write(&notes.join("History/c.txt"), "gamma");
        notes
    }

    fn files_under(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_copies_sample_tree() {
        let dir = tempfile::tempdir().unwrap();
        let notes = sample_tree(dir.path());
        let dest = dir.path().join("usb/Backup Notes - 2024-01-01");
        let plan = build_backup_plan(&notes, &dest).unwrap();

        let engine = CopyEngine::new(2).unwrap();
        let report = engine.start(plan).wait().unwrap();

        assert_eq!(report.total(), 3);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.bytes_copied(), 14);
        assert_eq!(report.status_line(), "Backup to USB complete");
        for relative in ["Math/a.txt", "Math/sub/b.txt", "History/c.txt"] {
            assert_eq!(
                fs::read(notes.join(relative)).unwrap(),
                fs::read(dest.join(relative)).unwrap()
            );
        }
    }

    #[test]
    fn test_completion_awaited_from_async() {
        let dir = tempfile::tempdir().unwrap();
        let notes = sample_tree(dir.path());
        let plan = build_backup_plan(&notes, &dir.path().join("dest")).unwrap();

        let engine = CopyEngine::new(2).unwrap();
        let handle = engine.start(plan);

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let report = runtime.block_on(handle.finished()).unwrap();
        assert_eq!(report.copied(), 3);
    }

    #[test]
    fn test_rerun_overwrites_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let notes = sample_tree(dir.path());
        let dest = dir.path().join("usb/backup");
        let engine = CopyEngine::new(2).unwrap();

        let first = engine.start(build_backup_plan(&notes, &dest).unwrap()).wait().unwrap();
        let after_first = files_under(&dest);

        write(&notes.join("Math/a.txt"), "alpha, revised");
        let second = engine.start(build_backup_plan(&notes, &dest).unwrap()).wait().unwrap();

        assert_eq!(first.failed(), 0);
        assert_eq!(second.failed(), 0);
        assert_eq!(files_under(&dest), after_first);
        assert_eq!(fs::read_to_string(dest.join("Math/a.txt")).unwrap(), "alpha, revised");
    }

    #[test]
    fn test_missing_source_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let notes = sample_tree(dir.path());
        let dest = dir.path().join("dest");
        let plan = build_backup_plan(&notes, &dest).unwrap();

        fs::remove_file(notes.join("Math/a.txt")).unwrap();

        let engine = CopyEngine::new(2).unwrap();
        let report = engine.start(plan).wait().unwrap();

        assert_eq!(report.total(), 3);
        assert_eq!(report.failed(), 1);
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures[0].0.source, notes.join("Math/a.txt"));
        assert!(matches!(failures[0].1, CopyError::SourceMissing(_)));
        assert!(dest.join("Math/sub/b.txt").exists());
        assert!(dest.join("History/c.txt").exists());
        assert!(!dest.join("Math/a.txt").exists());
        assert_eq!(report.status_line(), "Backup to USB complete (1 of 3 files failed)");
    }

    #[test]
    fn test_directory_create_failure() {
        let dir = tempfile::tempdir().unwrap();
        let notes = sample_tree(dir.path());
        let dest = dir.path().join("dest");
        let plan = build_backup_plan(&notes, &dest).unwrap();

        // A plain file where the "Math" directory should go
        write(&dest.join("Math"), "in the way");

        let report = CopyEngine::new(1).unwrap().start(plan).wait().unwrap();

        assert_eq!(report.failed(), 2);
        assert!(report
            .failures()
            .all(|(_, e)| matches!(e, CopyError::DirectoryCreateFailed { .. })));
        assert!(dest.join("History/c.txt").exists());
    }

    #[test]
    fn test_completion_waits_for_slow_entries() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes");
        for i in 0..8 {
            let name = if i % 3 == 0 { format!("slow-{}.txt", i) } else { format!("fast-{}.txt", i) };
            write(&notes.join(name), "x");
        }
        let plan = build_backup_plan(&notes, &dir.path().join("dest")).unwrap();
        let total = plan.len();

        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let engine = CopyEngine::new(4).unwrap();
        let mut handle = engine.start_with(plan, move |entry| {
            let name = entry.source.file_name().unwrap().to_string_lossy().to_string();
            if name.starts_with("slow") {
                std::thread::sleep(Duration::from_millis(300));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });

        assert!(handle.try_report().is_none());

        let progress = handle.progress().clone();
        let report = handle.wait().unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), total);
        assert_eq!(report.total(), total);
        assert_eq!(progress.try_iter().count(), total);
    }

    #[test]
    fn test_cancel_before_start_skips_entries() {
        let dir = tempfile::tempdir().unwrap();
        let notes = sample_tree(dir.path());
        let dest = dir.path().join("dest");
        let plan = build_backup_plan(&notes, &dest).unwrap();

        let gate = Arc::new(std::sync::Barrier::new(2));
        let blocker = CopyEngine::new(1).unwrap();
        // Occupy the single worker so the real batch cannot start yet
        let worker_gate = gate.clone();
        blocker.thread_pool.spawn(move || {
            worker_gate.wait();
        });

        let handle = CopyEngine {
            thread_pool: blocker.thread_pool.clone(),
        }
        .start(plan);
        handle.cancel_token().cancel();
        gate.wait();

        let report = handle.wait().unwrap();
        assert_eq!(report.copied(), 0);
        assert!(report.failures().all(|(_, e)| *e == CopyError::Cancelled));
        assert!(!dest.exists());
    }

    #[test]
    fn test_empty_plan_still_completes() {
        let engine = CopyEngine::new(1).unwrap();
        let report = engine.start(BackupPlan::default()).wait().unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(report.status_line(), "Backup to USB complete");
    }
}
