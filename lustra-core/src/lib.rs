//! # Lustra Core
//!
//! The synchronization and derivative-generation engine behind a personal
//! media gallery: it keeps a directory tree of photos and videos, the
//! generated thumbnail renditions under `_derivatives/`, and downstream
//! per-file processing (record sync, face detection, geo clustering)
//! consistent with each other while files are added, deleted, renamed, or
//! reclassified at arbitrary times - including mid-write.
//!
//! ## Architecture
//!
//! Two change sources feed one processing surface:
//!
//! - [`watch::FileWatchService`] turns OS notifications into lifecycle
//!   calls in real time, debouncing bursty "changed" events per path.
//! - [`scan::PeriodicScanService`] periodically enumerates the
//!   authoritative file set, diffs it against the previous snapshot, and
//!   dispatches the created/deleted/cleanup deltas - catching everything
//!   the notifications missed.
//!
//! Both dispatch through [`processor::FileProcessor`]; any number of
//! processors compose via [`processor::CompositeProcessor`]. Pure path
//! classification (including the skip-name reversal algebra) lives in
//! [`classify`], transient I/O failures are absorbed by [`retry`], and
//! external collaborators (record store, face engine, GPS metadata) are
//! narrow traits in [`store`].

pub mod classify;
pub mod error;
pub mod processor;
pub mod record;
pub mod retry;
pub mod scan;
pub mod store;
pub mod thumbnail;
pub mod watch;

pub use classify::{ClassificationRules, FileClassifier};
pub use error::{Result, SyncError};
pub use processor::{
    CompositeProcessor, FaceDetectionProcessor, FileProcessor, GeoClusterProcessor, NullProcessor,
    RecordSyncProcessor,
};
pub use record::FileRecord;
pub use retry::{RetryPolicy, execute_with_retry};
pub use scan::{PeriodicScanService, ScanOptions, ScanSummary, SharedSnapshot};
pub use thumbnail::{DerivativeLayout, ThumbnailCleanupProcessor, ThumbnailProcessor};
pub use watch::{FileWatchService, WatchOptions};
