//! Fan-out dispatcher over a list of child processors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::processor::FileProcessor;
use crate::record::FileRecord;

/// Broadcasts every lifecycle event to its children, sequentially or with a
/// bounded degree of parallelism. Implements [`FileProcessor`] itself, so
/// composites nest.
///
/// Integer results aggregate by **max**, not sum: the scheduler only
/// consumes "did at least one processor act", and adding counts across
/// unrelated processors would mean nothing. One child failing never
/// prevents the others from running; the first failure is logged per child
/// and re-surfaced once all children have run, so the scheduler still
/// retries the file on the next tick.
pub struct CompositeProcessor {
    root: PathBuf,
    children: Vec<Arc<dyn FileProcessor>>,
    parallelism: usize,
}

impl CompositeProcessor {
    /// Sequential composite: children run one at a time, in order.
    pub fn new(root: impl Into<PathBuf>, children: Vec<Arc<dyn FileProcessor>>) -> Self {
        Self {
            root: root.into(),
            children,
            parallelism: 1,
        }
    }

    /// Bounded-parallel composite. A degree of 0 selects the host CPU count.
    pub fn with_parallelism(
        root: impl Into<PathBuf>,
        children: Vec<Arc<dyn FileProcessor>>,
        degree: usize,
    ) -> Self {
        Self {
            root: root.into(),
            children,
            parallelism: if degree == 0 { num_cpus::get() } else { degree },
        }
    }

    pub fn children(&self) -> &[Arc<dyn FileProcessor>] {
        &self.children
    }

    /// Drive one lifecycle call across all children, collecting the max
    /// result and the first error.
    async fn broadcast(
        &self,
        operation: &str,
        path: &Path,
        calls: Vec<BoxFuture<'_, Result<u32>>>,
    ) -> Result<u32> {
        let mut pending = stream::iter(calls).buffer_unordered(self.parallelism.max(1));
        let mut best = 0u32;
        let mut first_err: Option<SyncError> = None;
        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(units) => best = best.max(units),
                Err(err) => {
                    warn!(
                        operation,
                        path = %path.display(),
                        error = %err,
                        "child processor failed"
                    );
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(best),
        }
    }
}

impl std::fmt::Debug for CompositeProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeProcessor")
            .field("root", &self.root)
            .field("children", &self.children.len())
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

#[async_trait]
impl FileProcessor for CompositeProcessor {
    fn root_folder(&self) -> &Path {
        &self.root
    }

    fn should_process_file(&self, path: &Path) -> bool {
        self.children
            .iter()
            .any(|child| child.should_process_file(path))
    }

    fn should_clean_file(&self, path: &Path) -> bool {
        self.children
            .iter()
            .any(|child| child.should_clean_file(path))
    }

    async fn on_file_created(&self, file: &FileRecord) -> Result<u32> {
        let calls = self
            .children
            .iter()
            .map(|child| {
                let fut: BoxFuture<'_, Result<u32>> = Box::pin(child.on_file_created(file));
                fut
            })
            .collect();
        self.broadcast("created", file.path(), calls).await
    }

    async fn on_file_changed(&self, file: &FileRecord) -> Result<()> {
        let calls = self
            .children
            .iter()
            .map(|child| {
                let fut: BoxFuture<'_, Result<u32>> =
                    Box::pin(async move { child.on_file_changed(file).await.map(|_| 0) });
                fut
            })
            .collect();
        self.broadcast("changed", file.path(), calls).await.map(|_| ())
    }

    async fn on_file_deleted(&self, file: &FileRecord) -> Result<u32> {
        let calls = self
            .children
            .iter()
            .map(|child| {
                let fut: BoxFuture<'_, Result<u32>> = Box::pin(child.on_file_deleted(file));
                fut
            })
            .collect();
        self.broadcast("deleted", file.path(), calls).await
    }

    async fn on_file_renamed(
        &self,
        old: &FileRecord,
        new: &FileRecord,
        new_valid: bool,
    ) -> Result<()> {
        let calls = self
            .children
            .iter()
            .map(|child| {
                let fut: BoxFuture<'_, Result<u32>> = Box::pin(async move {
                    child.on_file_renamed(old, new, new_valid).await.map(|_| 0)
                });
                fut
            })
            .collect();
        self.broadcast("renamed", new.path(), calls).await.map(|_| ())
    }

    async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32> {
        let calls = self
            .children
            .iter()
            .map(|child| {
                let fut: BoxFuture<'_, Result<u32>> = Box::pin(child.on_ensure_process(file));
                fut
            })
            .collect();
        self.broadcast("ensure-process", file.path(), calls).await
    }

    async fn on_ensure_cleanup(&self, file: &FileRecord) -> Result<u32> {
        let calls = self
            .children
            .iter()
            .map(|child| {
                let fut: BoxFuture<'_, Result<u32>> = Box::pin(child.on_ensure_cleanup(file));
                fut
            })
            .collect();
        self.broadcast("ensure-cleanup", file.path(), calls).await
    }

    async fn on_scan_start(&self) -> Result<()> {
        let calls = self
            .children
            .iter()
            .map(|child| {
                let fut: BoxFuture<'_, Result<u32>> =
                    Box::pin(async move { child.on_scan_start().await.map(|_| 0) });
                fut
            })
            .collect();
        self.broadcast("scan-start", &self.root, calls).await.map(|_| ())
    }

    async fn on_scan_end(&self) -> Result<()> {
        let calls = self
            .children
            .iter()
            .map(|child| {
                let fut: BoxFuture<'_, Result<u32>> =
                    Box::pin(async move { child.on_scan_end().await.map(|_| 0) });
                fut
            })
            .collect();
        self.broadcast("scan-end", &self.root, calls).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::SyncError;

    struct FixedProcessor {
        root: PathBuf,
        units: u32,
        fail: bool,
        calls: AtomicU32,
    }

    impl FixedProcessor {
        fn new(units: u32) -> Arc<Self> {
            Arc::new(Self {
                root: PathBuf::from("/library"),
                units,
                fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                root: PathBuf::from("/library"),
                units: 0,
                fail: true,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl FileProcessor for FixedProcessor {
        fn root_folder(&self) -> &Path {
            &self.root
        }

        fn should_process_file(&self, _path: &Path) -> bool {
            true
        }

        fn should_clean_file(&self, _path: &Path) -> bool {
            false
        }

        async fn on_file_created(&self, _file: &FileRecord) -> Result<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SyncError::Internal("boom".into()))
            } else {
                Ok(self.units)
            }
        }

        async fn on_file_changed(&self, _file: &FileRecord) -> Result<()> {
            Ok(())
        }

        async fn on_file_deleted(&self, _file: &FileRecord) -> Result<u32> {
            Ok(self.units)
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

    #[tokio::test]
    async fn aggregates_by_max_not_sum() {
        let children: Vec<Arc<dyn FileProcessor>> = vec![
            FixedProcessor::new(0),
            FixedProcessor::new(1),
            FixedProcessor::new(0),
        ];
        let composite = CompositeProcessor::new("/library", children);
        let file = FileRecord::new("/library/a/photo.jpg");
        assert_eq!(composite.on_file_created(&file).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn parallel_mode_aggregates_identically() {
        let children: Vec<Arc<dyn FileProcessor>> = vec![
            FixedProcessor::new(1),
            FixedProcessor::new(0),
            FixedProcessor::new(1),
        ];
        let composite = CompositeProcessor::with_parallelism("/library", children, 4);
        let file = FileRecord::new("/library/a/photo.jpg");
        assert_eq!(composite.on_file_created(&file).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn one_failing_child_does_not_stop_the_others() {
        let healthy = FixedProcessor::new(1);
        let children: Vec<Arc<dyn FileProcessor>> = vec![
            FixedProcessor::failing(),
            Arc::clone(&healthy) as Arc<dyn FileProcessor>,
        ];
        let composite = CompositeProcessor::new("/library", children);
        let file = FileRecord::new("/library/a/photo.jpg");

        // The failure surfaces so the scheduler can retry the file, but the
        // healthy sibling still ran.
        assert!(composite.on_file_created(&file).await.is_err());
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn composites_nest() {
        let inner: Vec<Arc<dyn FileProcessor>> = vec![FixedProcessor::new(1)];
        let nested: Vec<Arc<dyn FileProcessor>> =
            vec![Arc::new(CompositeProcessor::new("/library", inner))];
        let outer = CompositeProcessor::new("/library", nested);
        let file = FileRecord::new("/library/a/photo.jpg");
        assert_eq!(outer.on_file_created(&file).await.unwrap(), 1);
    }
}
