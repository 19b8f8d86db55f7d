//! Timer-driven reconciliation: enumerate, diff against the last snapshot,
//! dispatch the deltas, commit.
//!
//! The scan loop is the safety net under the live watcher: anything the OS
//! notifications missed - including everything that happened while the
//! process was down - is caught by diffing a full enumeration against the
//! previous tick's snapshot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::processor::FileProcessor;
use crate::record::FileRecord;
use crate::scan::source::FileSource;

/// A point-in-time set of known files, shared between the scheduler (which
/// owns commits) and the live watcher (which folds in observed events so
/// the next tick does not re-dispatch them). The lock is held only for the
/// duration of a copy or assignment, never across I/O.
#[derive(Clone, Debug, Default)]
pub struct SharedSnapshot {
    inner: Arc<Mutex<HashSet<FileRecord>>>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashSet<FileRecord> {
        self.inner.lock().expect("snapshot lock").clone()
    }

    pub fn replace(&self, set: HashSet<FileRecord>) {
        *self.inner.lock().expect("snapshot lock") = set;
    }

    pub fn insert(&self, record: FileRecord) {
        self.inner.lock().expect("snapshot lock").insert(record);
    }

    pub fn remove(&self, record: &FileRecord) {
        self.inner.lock().expect("snapshot lock").remove(record);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("snapshot lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scan cadence and dispatch width.
#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Time between reconciliation ticks.
    pub interval: Duration,
    /// Bounded-parallel dispatch degree within a tick; 1 is sequential.
    pub parallelism: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            parallelism: num_cpus::get(),
        }
    }
}

/// What one tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Tick was dropped because a previous one is still in flight.
    pub skipped: bool,
    pub new_files: usize,
    pub deleted_files: usize,
    pub cleanup_candidates: usize,
    pub units_of_work: u64,
}

impl ScanSummary {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Periodic reconciliation service.
///
/// Runs one tick immediately on start, then on the configured interval.
/// Overlapping ticks are dropped, not queued. Whether dispatch runs
/// sequentially or bounded-parallel, the committed snapshots are the same.
pub struct PeriodicScanService {
    processor: Arc<dyn FileProcessor>,
    source: Arc<dyn FileSource>,
    options: ScanOptions,
    process_set: SharedSnapshot,
    cleanup_set: SharedSnapshot,
    scanning: AtomicBool,
}

impl PeriodicScanService {
    pub fn new(
        processor: Arc<dyn FileProcessor>,
        source: Arc<dyn FileSource>,
        options: ScanOptions,
    ) -> Self {
        Self {
            processor,
            source,
            options,
            process_set: SharedSnapshot::new(),
            cleanup_set: SharedSnapshot::new(),
            scanning: AtomicBool::new(false),
        }
    }

    /// Handle to the "process" snapshot, for wiring a live watcher.
    pub fn process_snapshot(&self) -> SharedSnapshot {
        self.process_set.clone()
    }

    /// Tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            root = %self.processor.root_folder().display(),
            interval_secs = self.options.interval.as_secs(),
            parallelism = self.options.parallelism,
            "reconciliation scan loop started"
        );

        if let Err(err) = self.tick(&cancel).await {
            error!(error = %err, "reconciliation scan failed");
        }

        let mut ticker = time::interval_at(
            time::Instant::now() + self.options.interval,
            self.options.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick(&cancel).await {
                        error!(error = %err, "reconciliation scan failed");
                    }
                }
            }
        }

        info!("reconciliation scan loop stopped");
    }

    /// Run a single reconciliation tick. Returns a skipped summary when a
    /// previous tick is still in flight.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<ScanSummary> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("previous scan still in flight, dropping tick");
            return Ok(ScanSummary::skipped());
        }
        let outcome = self.guarded_tick(cancel).await;
        self.scanning.store(false, Ordering::SeqCst);
        outcome
    }

    async fn guarded_tick(&self, cancel: &CancellationToken) -> Result<ScanSummary> {
        let started = Instant::now();
        if let Err(err) = self.processor.on_scan_start().await {
            warn!(error = %err, "scan-start hook failed");
        }
        let outcome = self.reconcile(cancel).await;
        if let Err(err) = self.processor.on_scan_end().await {
            warn!(error = %err, "scan-end hook failed");
        }

        if let Ok(summary) = &outcome {
            info!(
                new = summary.new_files,
                deleted = summary.deleted_files,
                cleanup = summary.cleanup_candidates,
                units = summary.units_of_work,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "reconciliation scan complete"
            );
        }
        outcome
    }

    async fn reconcile(&self, cancel: &CancellationToken) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();

        // New files: anything enumerated now that the last committed
        // snapshot did not contain.
        let previous = self.process_set.snapshot();
        let mut current: HashSet<FileRecord> =
            self.source.files_to_process().await?.into_iter().collect();
        let new_files: Vec<FileRecord> = current.difference(&previous).cloned().collect();
        summary.new_files = new_files.len();

        let processor = Arc::clone(&self.processor);
        let (units, failed) = self
            .dispatch(new_files, cancel, "created (scan)", move |file| {
                let processor = Arc::clone(&processor);
                Box::pin(async move { processor.on_ensure_process(&file).await })
            })
            .await;
        summary.units_of_work += units;
        // A failed file is withheld from the commit so the next tick sees
        // it as new again and retries, instead of marking it seen.
        for file in &failed {
            current.remove(file);
        }

        // Deleted files: anything the last snapshot had that the
        // enumeration no longer contains.
        let deleted: Vec<FileRecord> = previous.difference(&current).cloned().collect();
        summary.deleted_files = deleted.len();

        let processor = Arc::clone(&self.processor);
        let (units, _) = self
            .dispatch(deleted, cancel, "deleted (scan)", move |file| {
                let processor = Arc::clone(&processor);
                Box::pin(async move { processor.on_file_deleted(&file).await })
            })
            .await;
        summary.units_of_work += units;

        self.process_set.replace(current);

        // Cleanup candidates diff against their own snapshot, so a skip
        // file whose cleanup already ran is not re-processed every tick.
        let previous_cleanup = self.cleanup_set.snapshot();
        let mut current_cleanup: HashSet<FileRecord> =
            self.source.files_to_clean().await?.into_iter().collect();
        let new_cleanup: Vec<FileRecord> =
            current_cleanup.difference(&previous_cleanup).cloned().collect();
        summary.cleanup_candidates = new_cleanup.len();

        let processor = Arc::clone(&self.processor);
        let (units, failed) = self
            .dispatch(new_cleanup, cancel, "cleanup (scan)", move |file| {
                let processor = Arc::clone(&processor);
                Box::pin(async move { processor.on_ensure_cleanup(&file).await })
            })
            .await;
        summary.units_of_work += units;
        for file in &failed {
            current_cleanup.remove(file);
        }

        self.cleanup_set.replace(current_cleanup);

        Ok(summary)
    }

    /// Dispatch one batch with bounded parallelism. Returns the units of
    /// work performed and the files whose handler failed (or was skipped by
    /// cancellation) - the caller decides what withholding them means.
    async fn dispatch(
        &self,
        files: Vec<FileRecord>,
        cancel: &CancellationToken,
        operation: &'static str,
        f: impl Fn(FileRecord) -> BoxFuture<'static, Result<u32>>,
    ) -> (u64, Vec<FileRecord>) {
        if files.is_empty() {
            return (0, Vec::new());
        }
        let degree = self.options.parallelism.max(1);
        let f = &f;

        let results: Vec<(FileRecord, Option<Result<u32>>)> = stream::iter(files)
            .map(|file| {
                let cancel = cancel.clone();
                async move {
                    // Cancellation is honoured between files; an in-flight
                    // handler is left to finish.
                    if cancel.is_cancelled() {
                        return (file, None);
                    }
                    let result = f(file.clone()).await;
                    (file, Some(result))
                }
            })
            .buffer_unordered(degree)
            .collect()
            .await;

        let mut units = 0u64;
        let mut failed = Vec::new();
        for (file, outcome) in results {
            match outcome {
                Some(Ok(n)) => units += u64::from(n),
                Some(Err(err)) => {
                    warn!(
                        operation,
                        path = %file.path().display(),
                        error = %err,
                        "file event handler failed"
                    );
                    failed.push(file);
                }
                None => {
                    debug!(operation, path = %file.path().display(), "skipped by cancellation");
                    failed.push(file);
                }
            }
        }
        (units, failed)
    }
}

impl std::fmt::Debug for PeriodicScanService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicScanService")
            .field("root", &self.processor.root_folder())
            .field("options", &self.options)
            .field("tracked", &self.process_set.len())
            .field("scanning", &self.scanning.load(Ordering::SeqCst))
            .finish()
    }
}

/// Convenience for tests and callers that never cancel mid-batch.
pub async fn run_single_tick(service: &PeriodicScanService) -> Result<ScanSummary> {
    service.tick(&CancellationToken::new()).await
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::classify::{ClassificationRules, FileClassifier};
    use crate::error::SyncError;
    use crate::scan::fs::MemoryFs;
    use crate::scan::source::WalkSource;

    /// Records every dispatch; optionally fails specific paths.
    struct TrackingProcessor {
        classifier: FileClassifier,
        created: StdMutex<Vec<PathBuf>>,
        deleted: StdMutex<Vec<PathBuf>>,
        cleaned: StdMutex<Vec<PathBuf>>,
        fail_substring: StdMutex<Option<String>>,
    }

    impl TrackingProcessor {
        fn new(root: &Path) -> Arc<Self> {
            Arc::new(Self {
                classifier: FileClassifier::new(root, ClassificationRules::default()),
                created: StdMutex::new(Vec::new()),
                deleted: StdMutex::new(Vec::new()),
                cleaned: StdMutex::new(Vec::new()),
                fail_substring: StdMutex::new(None),
            })
        }

        fn fail_paths_containing(&self, needle: &str) {
            *self.fail_substring.lock().unwrap() = Some(needle.to_string());
        }

        fn stop_failing(&self) {
            *self.fail_substring.lock().unwrap() = None;
        }

        fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        fn should_fail(&self, path: &Path) -> bool {
            self.fail_substring
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|needle| path.to_string_lossy().contains(needle.as_str()))
        }
    }

    #[async_trait]
    impl FileProcessor for TrackingProcessor {
        fn root_folder(&self) -> &Path {
            self.classifier.root()
        }

        fn should_process_file(&self, path: &Path) -> bool {
            self.classifier.should_process(path)
        }

        fn should_clean_file(&self, path: &Path) -> bool {
            self.classifier.should_clean(path)
        }

        async fn on_file_created(&self, file: &FileRecord) -> Result<u32> {
            if self.should_fail(file.path()) {
                return Err(SyncError::Internal("synthetic failure".into()));
            }
            self.created.lock().unwrap().push(file.path().to_path_buf());
            Ok(1)
        }

        async fn on_file_changed(&self, _file: &FileRecord) -> Result<()> {
            Ok(())
        }

        async fn on_file_deleted(&self, file: &FileRecord) -> Result<u32> {
            self.deleted.lock().unwrap().push(file.path().to_path_buf());
            Ok(1)
        }

        async fn on_file_renamed(
            &self,
            _old: &FileRecord,
            _new: &FileRecord,
            _new_valid: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32> {
            self.on_file_created(file).await
        }

        async fn on_ensure_cleanup(&self, file: &FileRecord) -> Result<u32> {
            if self.should_fail(file.path()) {
                return Err(SyncError::Internal("synthetic failure".into()));
            }
            self.cleaned.lock().unwrap().push(file.path().to_path_buf());
            Ok(1)
        }

        async fn on_scan_start(&self) -> Result<()> {
            Ok(())
        }

        async fn on_scan_end(&self) -> Result<()> {
            Ok(())
        }
    }

    fn service(
        fs: Arc<MemoryFs>,
        processor: Arc<TrackingProcessor>,
        parallelism: usize,
    ) -> PeriodicScanService {
        let source = Arc::new(WalkSource::new(
            fs,
            Arc::clone(&processor) as Arc<dyn FileProcessor>,
        ));
        PeriodicScanService::new(
            processor,
            source,
            ScanOptions {
                interval: Duration::from_secs(3600),
                parallelism,
            },
        )
    }

    fn seeded_fs() -> Arc<MemoryFs> {
        let fs = Arc::new(MemoryFs::new());
        fs.add_file("/library/album/photo1.jpg", 10);
        fs.add_file("/library/album/photo2.jpg", 10);
        fs.add_file("/library/album/notes.txt", 10);
        fs.add_file("/library/_derivatives/400/album/photo1.jpg", 5);
        fs
    }

    #[tokio::test]
    async fn first_tick_treats_every_file_as_new() {
        let fs = seeded_fs();
        let processor = TrackingProcessor::new(Path::new("/library"));
        let svc = service(fs, Arc::clone(&processor), 4);

        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.new_files, 2);
        assert_eq!(summary.deleted_files, 0);
        assert_eq!(processor.created_count(), 2);
    }

    #[tokio::test]
    async fn second_tick_with_no_changes_is_empty() {
        let fs = seeded_fs();
        let processor = TrackingProcessor::new(Path::new("/library"));
        let svc = service(fs, Arc::clone(&processor), 4);

        run_single_tick(&svc).await.unwrap();
        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.new_files, 0);
        assert_eq!(summary.deleted_files, 0);
        assert_eq!(summary.cleanup_candidates, 0);
        assert_eq!(processor.created_count(), 2);
    }

    #[tokio::test]
    async fn deletions_are_detected_by_diff() {
        let fs = seeded_fs();
        let processor = TrackingProcessor::new(Path::new("/library"));
        let svc = service(Arc::clone(&fs), Arc::clone(&processor), 4);

        run_single_tick(&svc).await.unwrap();
        fs.remove_file(Path::new("/library/album/photo2.jpg"));
        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.deleted_files, 1);
        assert_eq!(
            processor.deleted.lock().unwrap().as_slice(),
            &[PathBuf::from("/library/album/photo2.jpg")]
        );
    }

    #[tokio::test]
    async fn failed_files_are_retried_next_tick() {
        let fs = seeded_fs();
        let processor = TrackingProcessor::new(Path::new("/library"));
        let svc = service(fs, Arc::clone(&processor), 4);

        processor.fail_paths_containing("photo2");
        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.new_files, 2);
        assert_eq!(processor.created_count(), 1);

        // The failed file was withheld from the snapshot, so the next tick
        // sees it as new again - and this time it succeeds.
        processor.stop_failing();
        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.new_files, 1);
        assert_eq!(processor.created_count(), 2);
    }

    #[tokio::test]
    async fn rename_into_skip_becomes_delete_plus_cleanup_candidate() {
        let fs = seeded_fs();
        let processor = TrackingProcessor::new(Path::new("/library"));
        let svc = service(Arc::clone(&fs), Arc::clone(&processor), 4);

        run_single_tick(&svc).await.unwrap();
        fs.rename_file(
            Path::new("/library/album/photo1.jpg"),
            "/library/album/photo1_skip.jpg",
        );
        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.deleted_files, 1);
        assert_eq!(summary.cleanup_candidates, 1);
        assert_eq!(
            processor.cleaned.lock().unwrap().as_slice(),
            &[PathBuf::from("/library/album/photo1_skip.jpg")]
        );

        // Once cleaned, the candidate is not re-processed every tick.
        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.cleanup_candidates, 0);
    }

    #[tokio::test]
    async fn failed_cleanup_candidates_are_retried_next_tick() {
        let fs = seeded_fs();
        let processor = TrackingProcessor::new(Path::new("/library"));
        let svc = service(Arc::clone(&fs), Arc::clone(&processor), 4);

        run_single_tick(&svc).await.unwrap();
        fs.rename_file(
            Path::new("/library/album/photo1.jpg"),
            "/library/album/photo1_skip.jpg",
        );
        processor.fail_paths_containing("photo1_skip");
        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.cleanup_candidates, 1);
        assert!(processor.cleaned.lock().unwrap().is_empty());

        processor.stop_failing();
        let summary = run_single_tick(&svc).await.unwrap();
        assert_eq!(summary.cleanup_candidates, 1);
        assert_eq!(processor.cleaned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sequential_and_parallel_scans_converge_identically() {
        for parallelism in [1usize, 8] {
            let fs = Arc::new(MemoryFs::new());
            for i in 0..20 {
                fs.add_file(format!("/library/a/photo{i}.jpg"), 10);
            }
            let processor = TrackingProcessor::new(Path::new("/library"));
            let svc = service(Arc::clone(&fs), Arc::clone(&processor), parallelism);

            run_single_tick(&svc).await.unwrap();
            fs.remove_file(Path::new("/library/a/photo3.jpg"));
            fs.add_file("/library/a/photo99.jpg", 10);
            let summary = run_single_tick(&svc).await.unwrap();

            assert_eq!(summary.new_files, 1, "parallelism {parallelism}");
            assert_eq!(summary.deleted_files, 1, "parallelism {parallelism}");
            assert_eq!(svc.process_snapshot().len(), 20);
        }
    }

    #[tokio::test]
    async fn overlapping_ticks_are_dropped() {
        let fs = seeded_fs();
        let processor = TrackingProcessor::new(Path::new("/library"));
        let svc = Arc::new(service(fs, processor, 1));

        svc.scanning.store(true, Ordering::SeqCst);
        let summary = run_single_tick(&svc).await.unwrap();
        assert!(summary.skipped);
        svc.scanning.store(false, Ordering::SeqCst);
        let summary = run_single_tick(&svc).await.unwrap();
        assert!(!summary.skipped);
    }
}
