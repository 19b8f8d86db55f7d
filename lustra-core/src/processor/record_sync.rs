//! Keeps the record store in step with the source tree.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::classify::FileClassifier;
use crate::error::Result;
use crate::processor::FileProcessor;
use crate::record::FileRecord;
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::store::MediaRecordStore;
use crate::thumbnail::DerivativeLayout;

/// Height of the rendition whose bytes are hashed into the record, for
/// duplicate detection downstream.
const HASH_RENDITION_HEIGHT: u32 = 400;

/// Upserts a media record (and its containing album) for every in-scope
/// file, removes records for files that disappear or get reclassified, and
/// stamps records with a content hash computed from the 400px rendition
/// when one exists.
pub struct RecordSyncProcessor {
    classifier: Arc<FileClassifier>,
    layout: DerivativeLayout,
    store: Arc<dyn MediaRecordStore>,
    // Serializes concurrent first-inserts of the same album; the store's
    // upsert handles per-record races.
    album_locks: DashMap<String, Arc<Mutex<()>>>,
    retry: RetryPolicy,
}

impl RecordSyncProcessor {
    pub fn new(classifier: Arc<FileClassifier>, store: Arc<dyn MediaRecordStore>) -> Self {
        let layout = DerivativeLayout::new(classifier.root());
        Self {
            classifier,
            layout,
            store,
            album_locks: DashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn album_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let album = path
            .parent()
            .map(|p| p.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.album_locks
            .entry(album)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// SHA-256 of the 400px rendition, when it has been built already.
    async fn rendition_hash(&self, source: &Path) -> Result<Option<String>> {
        let is_video = self.classifier.is_video(source);
        let Some(rendition) =
            self.layout
                .derivative_path(source, HASH_RENDITION_HEIGHT, is_video)
        else {
            return Ok(None);
        };
        if !tokio::fs::try_exists(&rendition).await.unwrap_or(false) {
            return Ok(None);
        }
        let bytes = execute_with_retry(&self.retry, "hash rendition", &rendition, || async {
            Ok(tokio::fs::read(&rendition).await?)
        })
        .await?;
        let digest = Sha256::digest(&bytes);
        Ok(Some(format!("{digest:x}")))
    }

    /// Upsert the record and album rows for `path`. Returns 1 when a record
    /// was created, 0 when it already existed.
    async fn upsert_record(&self, path: &Path) -> Result<u32> {
        let lock = self.album_lock(path);
        let (record, created) = {
            let _guard = lock.lock().await;
            self.store.ensure_album_exists(path).await?;
            self.store.add_or_update_media(path).await?
        };

        if record.content_hash.is_none() {
            if let Some(hash) = self.rendition_hash(path).await? {
                self.store.set_content_hash(record.id, &hash).await?;
                debug!(path = %path.display(), "stored rendition content hash");
            }
        }

        if created {
            info!(path = %path.display(), "created media record");
        }
        Ok(u32::from(created))
    }

    async fn delete_record(&self, path: &Path) -> Result<u32> {
        let affected = self.store.delete_media(path).await?;
        if affected > 0 {
            info!(path = %path.display(), "deleted media record");
        }
        Ok(u32::from(affected > 0))
    }
}

impl std::fmt::Debug for RecordSyncProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSyncProcessor")
            .field("root", &self.classifier.root())
            .field("album_locks", &self.album_locks.len())
            .finish()
    }
}

#[async_trait]
impl FileProcessor for RecordSyncProcessor {
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
        self.upsert_record(file.path()).await
    }

    async fn on_file_changed(&self, file: &FileRecord) -> Result<()> {
        self.upsert_record(file.path()).await.map(|_| ())
    }

    async fn on_file_deleted(&self, file: &FileRecord) -> Result<u32> {
        self.delete_record(file.path()).await
    }

    async fn on_file_renamed(
        &self,
        old: &FileRecord,
        new: &FileRecord,
        new_valid: bool,
    ) -> Result<()> {
        self.delete_record(old.path()).await?;
        if new_valid {
            self.upsert_record(new.path()).await?;
        }
        Ok(())
    }

    async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32> {
        self.on_file_created(file).await
    }

    async fn on_ensure_cleanup(&self, file: &FileRecord) -> Result<u32> {
        if self.classifier.in_derivatives(file.path()) {
            return Ok(0);
        }
        let mut cleaned = 0;
        for original in self.classifier.original_candidates(file.path()) {
            cleaned += self.delete_record(&original).await?;
        }
        Ok(cleaned)
    }

    async fn on_scan_start(&self) -> Result<()> {
        // Store connections pool; nothing to open per tick.
        Ok(())
    }

    async fn on_scan_end(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::classify::ClassificationRules;
    use crate::store::MemoryMediaStore;

    fn setup(root: &Path) -> (RecordSyncProcessor, Arc<MemoryMediaStore>) {
        let classifier = Arc::new(FileClassifier::new(root, ClassificationRules::default()));
        let store = Arc::new(MemoryMediaStore::new());
        let processor = RecordSyncProcessor::new(classifier, store.clone() as Arc<dyn MediaRecordStore>);
        (processor, store)
    }

    #[tokio::test]
    async fn created_twice_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (p, store) = setup(tmp.path());
        let file = FileRecord::new(tmp.path().join("trip/photo.jpg"));

        assert_eq!(p.on_file_created(&file).await.unwrap(), 1);
        assert_eq!(p.on_file_created(&file).await.unwrap(), 0);
        assert_eq!(store.record_count().await, 1);
        assert_eq!(store.album_count().await, 1);
    }

    #[tokio::test]
    async fn rename_moves_the_record() {
        let tmp = TempDir::new().unwrap();
        let (p, store) = setup(tmp.path());
        let old = FileRecord::new(tmp.path().join("trip/one.jpg"));
        let new = FileRecord::new(tmp.path().join("trip/two.jpg"));

        p.on_file_created(&old).await.unwrap();
        p.on_file_renamed(&old, &new, true).await.unwrap();

        assert!(store.find_media(old.path()).await.unwrap().is_none());
        assert!(store.find_media(new.path()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ensure_cleanup_deletes_the_reconstructed_original() {
        let tmp = TempDir::new().unwrap();
        let (p, store) = setup(tmp.path());
        let original = FileRecord::new(tmp.path().join("trip/photo.jpg"));
        p.on_file_created(&original).await.unwrap();

        let skip = FileRecord::new(tmp.path().join("trip/photo_skip.jpg"));
        assert_eq!(p.on_ensure_cleanup(&skip).await.unwrap(), 1);
        assert!(store.find_media(original.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_hash_is_taken_from_the_rendition() {
        let tmp = TempDir::new().unwrap();
        let (p, store) = setup(tmp.path());

        let source = tmp.path().join("trip/photo.jpg");
        let rendition = tmp.path().join("_derivatives/400/trip/photo.jpg");
        std::fs::create_dir_all(rendition.parent().unwrap()).unwrap();
        std::fs::write(&rendition, b"rendition-bytes").unwrap();

        let file = FileRecord::new(&source);
        p.on_file_created(&file).await.unwrap();

        let record = store.find_media(&source).await.unwrap().unwrap();
        let expected = format!("{:x}", Sha256::digest(b"rendition-bytes"));
        assert_eq!(record.content_hash.as_deref(), Some(expected.as_str()));
    }
}
