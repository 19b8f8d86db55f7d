//! Periodic reconciliation: full enumerations diffed tick-to-tick.

pub mod fs;
pub mod scheduler;
pub mod source;

pub use fs::{FileSystem, MemoryFs, TokioFs, walk_files};
pub use scheduler::{PeriodicScanService, ScanOptions, ScanSummary, SharedSnapshot};
pub use source::{FileSource, StoreSource, WalkSource};
