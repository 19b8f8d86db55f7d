//! The pluggable per-file processing surface.
//!
//! Every unit of work the engine can do to a file - building derivatives,
//! syncing records, detecting faces, clustering locations, sweeping orphans -
//! implements [`FileProcessor`]. Both change sources (the live watcher and
//! the periodic reconciliation scan) dispatch through this one surface, so
//! processors are oblivious to which path triggered them.
//!
//! Lifecycle calls returning `u32` report "units of work performed" and are
//! consumed downstream as a boolean did-anything signal; idempotent re-runs
//! return 0.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::FileRecord;

pub mod composite;
pub mod faces;
pub mod geo;
pub mod record_sync;

pub use composite::CompositeProcessor;
pub use faces::FaceDetectionProcessor;
pub use geo::GeoClusterProcessor;
pub use record_sync::RecordSyncProcessor;

/// Lifecycle surface invoked for every detected file change.
///
/// Every method is required; processors that do not care about an event
/// implement it as an explicit no-op (see [`NullProcessor`]) rather than
/// inheriting hidden defaults. Implementations must be safe under
/// concurrent invocation, both per-path and across paths.
#[async_trait]
pub trait FileProcessor: Send + Sync {
    /// The directory tree this processor operates on.
    fn root_folder(&self) -> &Path;

    /// Whether the path is in scope for this processor.
    fn should_process_file(&self, path: &Path) -> bool;

    /// Whether the path is a cleanup candidate for this processor.
    fn should_clean_file(&self, path: &Path) -> bool;

    async fn on_file_created(&self, file: &FileRecord) -> Result<u32>;

    async fn on_file_changed(&self, file: &FileRecord) -> Result<()>;

    async fn on_file_deleted(&self, file: &FileRecord) -> Result<u32>;

    /// `new_valid` tells the processor whether the new name is in scope; the
    /// old name's artifacts are removed either way.
    async fn on_file_renamed(&self, old: &FileRecord, new: &FileRecord, new_valid: bool)
    -> Result<()>;

    /// Reconciliation-scan alias for creation: make sure the file's
    /// artifacts exist. Must be idempotent.
    async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32>;

    /// Given a path that newly matches a skip rule, remove whatever
    /// artifacts its *original* (pre-skip) name left behind.
    async fn on_ensure_cleanup(&self, file: &FileRecord) -> Result<u32>;

    /// Called once before each reconciliation tick, for batch setup such as
    /// opening external resources.
    async fn on_scan_start(&self) -> Result<()>;

    /// Called once after each reconciliation tick.
    async fn on_scan_end(&self) -> Result<()>;
}

/// Explicit null object: accepts every event and does nothing. Useful as a
/// placeholder child in a composite and as scaffolding in tests.
#[derive(Debug)]
pub struct NullProcessor {
    root: std::path::PathBuf,
}

impl NullProcessor {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileProcessor for NullProcessor {
    fn root_folder(&self) -> &Path {
        &self.root
    }

    fn should_process_file(&self, _path: &Path) -> bool {
        false
    }

    fn should_clean_file(&self, _path: &Path) -> bool {
        false
    }

    async fn on_file_created(&self, _file: &FileRecord) -> Result<u32> {
        Ok(0)
    }

    async fn on_file_changed(&self, _file: &FileRecord) -> Result<()> {
        Ok(())
    }

    async fn on_file_deleted(&self, _file: &FileRecord) -> Result<u32> {
        Ok(0)
    }

    async fn on_file_renamed(
        &self,
        _old: &FileRecord,
        _new: &FileRecord,
        _new_valid: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_ensure_process(&self, _file: &FileRecord) -> Result<u32> {
        Ok(0)
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
