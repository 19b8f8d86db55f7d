//! Live filesystem watching.
//!
//! A thin wrapper around `notify` that turns raw OS notifications into
//! lifecycle calls on a processor. "Changed" notifications can fire many
//! times during a single write, so they are debounced per path; created,
//! deleted, and renamed events dispatch immediately and cancel any pending
//! debounce they supersede. Anything the watcher misses is caught by the
//! periodic reconciliation scan.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, spawn_blocking};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::processor::FileProcessor;
use crate::record::FileRecord;
use crate::scan::SharedSnapshot;

/// Configuration knobs for live watching.
#[derive(Clone, Debug)]
pub struct WatchOptions {
    /// Quiet window a path must hold before its "changed" event dispatches.
    pub debounce_window: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(300),
        }
    }
}

enum WatchMessage {
    Event(Event),
    Error(String),
}

struct PendingChange {
    id: u64,
    handle: JoinHandle<()>,
}

/// Dispatches debounced filesystem notifications to a processor and keeps
/// the scheduler's shared snapshot coherent with what it dispatched.
pub struct FileWatchService {
    processor: Arc<dyn FileProcessor>,
    snapshot: SharedSnapshot,
    options: WatchOptions,
    pending: Arc<DashMap<PathBuf, PendingChange>>,
    sequence: AtomicU64,
}

/// Keeps the notify watcher and the event-pump task alive; dropping it
/// stops the stream.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    pump: JoinHandle<()>,
}

impl WatchHandle {
    pub async fn stopped(self) {
        let _ = self.pump.await;
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("pump_finished", &self.pump.is_finished())
            .finish()
    }
}

impl FileWatchService {
    pub fn new(
        processor: Arc<dyn FileProcessor>,
        snapshot: SharedSnapshot,
        options: WatchOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            processor,
            snapshot,
            options,
            pending: Arc::new(DashMap::new()),
            sequence: AtomicU64::new(0),
        })
    }

    /// Attach a recursive notify watcher to the processor's root and start
    /// pumping its events until `cancel` fires.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<WatchHandle> {
        let root = self.processor.root_folder().to_path_buf();
        let capacity = 1024;
        let (tx, mut rx) = mpsc::channel::<WatchMessage>(capacity);

        let watcher_root = root.clone();
        let watcher = spawn_blocking(move || init_watcher(&watcher_root, tx))
            .await
            .map_err(|err| SyncError::Internal(format!("watcher initialization panicked: {err}")))??;

        info!(root = %root.display(), "live watcher started");

        let service = self;
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(WatchMessage::Event(event)) => service.handle_event(event).await,
                        Some(WatchMessage::Error(error)) => {
                            // Reconciliation will repair whatever was missed.
                            warn!(error, "filesystem watcher error");
                        }
                        None => break,
                    }
                }
            }
            service.cancel_all_pending();
            debug!("live watcher stopped");
        });

        Ok(WatchHandle {
            _watcher: watcher,
            pump,
        })
    }

    /// Translate one raw notification into lifecycle dispatches.
    pub async fn handle_event(&self, event: Event) {
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.file_created(path).await;
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.file_deleted(path).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [old, new] = event.paths.as_slice() {
                    self.file_renamed(old, new).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(old) = event.paths.first() {
                    self.file_deleted(old).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let Some(new) = event.paths.first() {
                    self.file_created(new).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => match event.paths.as_slice() {
                [old, new] => self.file_renamed(old, new).await,
                [path] => {
                    // Unpaired rename half: whether the path is the old or
                    // the new name depends on the backend, so probe.
                    if tokio::fs::try_exists(path).await.unwrap_or(false) {
                        self.file_created(path).await;
                    } else {
                        self.file_deleted(path).await;
                    }
                }
                _ => {}
            },
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.schedule_changed(path);
                }
            }
            _ => {}
        }
    }

    async fn file_created(&self, path: &Path) {
        if !self.processor.should_process_file(path) {
            return;
        }
        let record = FileRecord::new(path);
        match self.processor.on_file_created(&record).await {
            Ok(_) => {
                info!(path = %path.display(), "created (watch)");
                self.snapshot.insert(record);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "created handler failed");
            }
        }
    }

    async fn file_deleted(&self, path: &Path) {
        // A delete supersedes any pending change for the same path.
        self.cancel_pending(path);
        if !self.processor.should_process_file(path) {
            return;
        }
        let record = FileRecord::new(path);
        match self.processor.on_file_deleted(&record).await {
            Ok(_) => {
                info!(path = %path.display(), "deleted (watch)");
                self.snapshot.remove(&record);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "deleted handler failed");
            }
        }
    }

    async fn file_renamed(&self, old: &Path, new: &Path) {
        self.cancel_pending(old);
        self.cancel_pending(new);
        let old_valid = self.processor.should_process_file(old);
        let new_valid = self.processor.should_process_file(new);
        if !old_valid && !new_valid {
            return;
        }
        let old_record = FileRecord::new(old);
        let new_record = FileRecord::new(new);
        match self
            .processor
            .on_file_renamed(&old_record, &new_record, new_valid)
            .await
        {
            Ok(()) => {
                info!(old = %old.display(), new = %new.display(), "renamed (watch)");
                if old_valid {
                    self.snapshot.remove(&old_record);
                }
                if new_valid {
                    self.snapshot.insert(new_record);
                }
            }
            Err(err) => {
                warn!(
                    old = %old.display(),
                    new = %new.display(),
                    error = %err,
                    "renamed handler failed"
                );
            }
        }
    }

    /// Arm (or re-arm) the debounce timer for a changed path. The newest
    /// event always wins: inserting the replacement aborts the previous
    /// timer atomically under the map entry.
    fn schedule_changed(&self, path: &Path) {
        if !self.processor.should_process_file(path) {
            return;
        }
        let id = self.sequence.fetch_add(1, Ordering::Relaxed);
        let processor = Arc::clone(&self.processor);
        let pending = Arc::clone(&self.pending);
        let window = self.options.debounce_window;
        let task_path = path.to_path_buf();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Deregister before dispatching so a burst arriving mid-dispatch
            // re-arms rather than being coalesced into this call.
            pending.remove_if(&task_path, |_, pending| pending.id == id);
            let record = FileRecord::new(&task_path);
            if let Err(err) = processor.on_file_changed(&record).await {
                warn!(path = %task_path.display(), error = %err, "changed handler failed");
            } else {
                info!(path = %task_path.display(), "changed (watch, debounced)");
            }
        });

        if let Some(previous) = self
            .pending
            .insert(path.to_path_buf(), PendingChange { id, handle })
        {
            previous.handle.abort();
        }
    }

    fn cancel_pending(&self, path: &Path) {
        if let Some((_, pending)) = self.pending.remove(path) {
            pending.handle.abort();
        }
    }

    fn cancel_all_pending(&self) {
        self.pending.retain(|_, pending| {
            pending.handle.abort();
            false
        });
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for FileWatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatchService")
            .field("root", &self.processor.root_folder())
            .field("pending_changes", &self.pending.len())
            .finish()
    }
}

fn init_watcher(root: &Path, tx: mpsc::Sender<WatchMessage>) -> Result<RecommendedWatcher> {
    let event_root = root.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if let Err(err) = tx.blocking_send(WatchMessage::Event(event)) {
                    warn!(
                        "watch channel send failed for {}: {}",
                        event_root.display(),
                        err
                    );
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(WatchMessage::Error(err.to_string()));
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| {
        SyncError::Internal(format!(
            "failed to create watcher for {}: {}",
            root.display(),
            err
        ))
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|err| {
            SyncError::Internal(format!("failed to watch {}: {}", root.display(), err))
        })?;

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use notify::event::{CreateKind, DataChange, RemoveKind};
    use tempfile::tempdir;

    use super::*;
    use crate::classify::{ClassificationRules, FileClassifier};
    use async_trait::async_trait;

    #[derive(Debug, Default)]
    struct Calls {
        created: Vec<PathBuf>,
        changed: Vec<PathBuf>,
        deleted: Vec<PathBuf>,
        renamed: Vec<(PathBuf, PathBuf, bool)>,
    }

    struct RecordingProcessor {
        classifier: FileClassifier,
        calls: StdMutex<Calls>,
    }

    impl RecordingProcessor {
        fn new(root: &Path) -> Arc<Self> {
            Arc::new(Self {
                classifier: FileClassifier::new(root, ClassificationRules::default()),
                calls: StdMutex::new(Calls::default()),
            })
        }
    }

    #[async_trait]
    impl FileProcessor for RecordingProcessor {
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
            self.calls
                .lock()
                .unwrap()
                .created
                .push(file.path().to_path_buf());
            Ok(1)
        }

        async fn on_file_changed(&self, file: &FileRecord) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .changed
                .push(file.path().to_path_buf());
            Ok(())
        }

        async fn on_file_deleted(&self, file: &FileRecord) -> Result<u32> {
            self.calls
                .lock()
                .unwrap()
                .deleted
                .push(file.path().to_path_buf());
            Ok(1)
        }

        async fn on_file_renamed(
            &self,
            old: &FileRecord,
            new: &FileRecord,
            new_valid: bool,
        ) -> Result<()> {
            self.calls.lock().unwrap().renamed.push((
                old.path().to_path_buf(),
                new.path().to_path_buf(),
                new_valid,
            ));
            Ok(())
        }

        async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32> {
            self.on_file_created(file).await
        }

        async fn on_ensure_cleanup(&self, _file: &FileRecord) -> Result<u32> {
            Ok(0)
        }

        async fn on_scan_start(&self) -> Result<()> {
            Ok(())
        }

        async fn on_scan_end(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_service(
        root: &Path,
        debounce: Duration,
    ) -> (Arc<FileWatchService>, Arc<RecordingProcessor>, SharedSnapshot) {
        let processor = RecordingProcessor::new(root);
        let snapshot = SharedSnapshot::new();
        let service = FileWatchService::new(
            Arc::clone(&processor) as Arc<dyn FileProcessor>,
            snapshot.clone(),
            WatchOptions {
                debounce_window: debounce,
            },
        );
        (service, processor, snapshot)
    }

    fn modify_event(path: &Path) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(path.to_path_buf())
    }

    #[tokio::test]
    async fn created_dispatches_immediately_and_updates_snapshot() {
        let (service, processor, snapshot) = test_service(Path::new("/library"), Duration::from_millis(50));
        let path = PathBuf::from("/library/a/photo.jpg");

        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        service.handle_event(event).await;

        assert_eq!(processor.calls.lock().unwrap().created, vec![path.clone()]);
        assert!(snapshot.snapshot().contains(&FileRecord::new(&path)));
    }

    #[tokio::test]
    async fn out_of_scope_paths_are_ignored() {
        let (service, processor, snapshot) = test_service(Path::new("/library"), Duration::from_millis(50));

        for path in [
            "/library/a/skip_photo.jpg",
            "/library/a/notes.txt",
            "/library/_derivatives/400/a/photo.jpg",
        ] {
            let event =
                Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from(path));
            service.handle_event(event).await;
        }

        assert!(processor.calls.lock().unwrap().created.is_empty());
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn change_bursts_coalesce_into_one_dispatch() {
        let (service, processor, _snapshot) =
            test_service(Path::new("/library"), Duration::from_millis(40));
        let path = PathBuf::from("/library/a/photo.jpg");

        for _ in 0..5 {
            service.handle_event(modify_event(&path)).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(service.pending_count(), 1);
        assert!(processor.calls.lock().unwrap().changed.is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(processor.calls.lock().unwrap().changed, vec![path]);
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn delete_supersedes_a_pending_change() {
        let (service, processor, _snapshot) =
            test_service(Path::new("/library"), Duration::from_millis(40));
        let path = PathBuf::from("/library/a/photo.jpg");

        service.handle_event(modify_event(&path)).await;
        assert_eq!(service.pending_count(), 1);

        let event = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone());
        service.handle_event(event).await;
        assert_eq!(service.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let calls = processor.calls.lock().unwrap();
        assert!(calls.changed.is_empty(), "debounced change must be cancelled");
        assert_eq!(calls.deleted, vec![path]);
    }

    #[tokio::test]
    async fn rename_reports_new_name_validity() {
        let (service, processor, snapshot) = test_service(Path::new("/library"), Duration::from_millis(40));
        let old = PathBuf::from("/library/a/photo.jpg");
        let new = PathBuf::from("/library/a/photo_skip.jpg");
        snapshot.insert(FileRecord::new(&old));

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(old.clone())
            .add_path(new.clone());
        service.handle_event(event).await;

        assert_eq!(
            processor.calls.lock().unwrap().renamed,
            vec![(old.clone(), new, false)]
        );
        assert!(snapshot.is_empty(), "old entry leaves the snapshot");
    }

    #[tokio::test]
    async fn watcher_starts_and_stops_on_a_real_directory() {
        let tmp = tempdir().unwrap();
        let (service, _processor, _snapshot) = test_service(tmp.path(), Duration::from_millis(40));

        let cancel = CancellationToken::new();
        let handle = service.start(cancel.clone()).await.unwrap();
        cancel.cancel();
        handle.stopped().await;
    }
}
