//! Where a reconciliation scan gets its authoritative file sets from.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::processor::FileProcessor;
use crate::record::FileRecord;
use crate::scan::fs::{FileSystem, walk_files};
use crate::store::MediaRecordStore;

/// Supplies the two per-tick enumerations: files in scope for processing
/// and cleanup candidates. The processor's own classification hooks decide
/// membership, so a source composes with any processor.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn files_to_process(&self) -> Result<Vec<FileRecord>>;

    async fn files_to_clean(&self) -> Result<Vec<FileRecord>>;
}

/// Full recursive walk of the processor's root folder - the disk-driven
/// source used by the thumbnail and cleanup pipelines.
pub struct WalkSource {
    fs: Arc<dyn FileSystem>,
    processor: Arc<dyn FileProcessor>,
}

impl WalkSource {
    pub fn new(fs: Arc<dyn FileSystem>, processor: Arc<dyn FileProcessor>) -> Self {
        Self { fs, processor }
    }

    async fn walk(&self, keep: impl Fn(&std::path::Path) -> bool) -> Result<Vec<FileRecord>> {
        let paths = walk_files(self.fs.as_ref(), self.processor.root_folder()).await?;
        Ok(paths
            .into_iter()
            .filter(|path| keep(path))
            .map(FileRecord::new)
            .collect())
    }
}

impl std::fmt::Debug for WalkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalkSource")
            .field("root", &self.processor.root_folder())
            .finish()
    }
}

#[async_trait]
impl FileSource for WalkSource {
    async fn files_to_process(&self) -> Result<Vec<FileRecord>> {
        self.walk(|path| self.processor.should_process_file(path))
            .await
    }

    async fn files_to_clean(&self) -> Result<Vec<FileRecord>> {
        self.walk(|path| self.processor.should_clean_file(path))
            .await
    }
}

/// Record-store enumeration - the source for pipelines that reconcile
/// tracked records rather than the disk (face detection, geo clustering).
/// Rules can change between ticks, so tracked paths are re-classified on
/// every enumeration.
pub struct StoreSource {
    store: Arc<dyn MediaRecordStore>,
    processor: Arc<dyn FileProcessor>,
}

impl StoreSource {
    pub fn new(store: Arc<dyn MediaRecordStore>, processor: Arc<dyn FileProcessor>) -> Self {
        Self { store, processor }
    }

    async fn tracked(&self, keep: impl Fn(&std::path::Path) -> bool) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();
        for path in self.store.all_tracked_paths().await? {
            if !keep(&path) {
                continue;
            }
            let record = match self.store.find_media(&path).await? {
                Some(media) => FileRecord::with_media(path, Arc::new(media)),
                None => FileRecord::new(path),
            };
            records.push(record);
        }
        Ok(records)
    }
}

impl std::fmt::Debug for StoreSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSource")
            .field("root", &self.processor.root_folder())
            .finish()
    }
}

#[async_trait]
impl FileSource for StoreSource {
    async fn files_to_process(&self) -> Result<Vec<FileRecord>> {
        self.tracked(|path| self.processor.should_process_file(path))
            .await
    }

    async fn files_to_clean(&self) -> Result<Vec<FileRecord>> {
        self.tracked(|path| self.processor.should_clean_file(path))
            .await
    }
}
