//! Reverse-direction sweep of the derivatives zone.
//!
//! Where [`super::ThumbnailProcessor`] walks the originals and writes
//! renditions, this processor walks one `_derivatives/{height}` tree and
//! deletes renditions that should no longer exist: renditions whose path
//! matches a skip rule, and renditions whose original has disappeared.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::classify::FileClassifier;
use crate::error::Result;
use crate::processor::FileProcessor;
use crate::record::FileRecord;
use crate::retry::RetryPolicy;
use crate::thumbnail::layout::DerivativeLayout;
use crate::thumbnail::remove_file_and_prune;

/// Sweeps orphaned or skip-matching derivatives for a single height.
#[derive(Debug)]
pub struct ThumbnailCleanupProcessor {
    classifier: Arc<FileClassifier>,
    layout: DerivativeLayout,
    height: u32,
    root: PathBuf,
    retry: RetryPolicy,
}

impl ThumbnailCleanupProcessor {
    pub fn new(classifier: Arc<FileClassifier>, height: u32) -> Self {
        let layout = DerivativeLayout::new(classifier.root());
        let root = layout.height_dir(height);
        Self {
            classifier,
            layout,
            height,
            root,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the rendition mirrors a source path that matches a skip rule,
    /// i.e. it should never have been (or no longer be) served.
    fn mirrors_skipped_source(&self, derivative: &Path) -> bool {
        match self.layout.original_for(derivative, self.height) {
            Some(original) => self.classifier.matches_skip(&original),
            None => false,
        }
    }

    /// Every source path this rendition could mirror. The rendition of a
    /// video is a still, so every allowed extension must be tried.
    fn source_candidates(&self, derivative: &Path) -> Vec<PathBuf> {
        let Some(original) = self.layout.original_for(derivative, self.height) else {
            return Vec::new();
        };
        let rules = self.classifier.rules();
        rules
            .image_extensions
            .iter()
            .chain(rules.video_extensions.iter())
            .map(|ext| original.with_extension(ext.trim_start_matches('.')))
            .collect()
    }

    async fn delete_rendition(&self, derivative: &Path) -> Result<u32> {
        let removed = remove_file_and_prune(&self.retry, derivative, self.layout.base()).await?;
        if removed {
            info!(derivative = %derivative.display(), "swept derivative");
        }
        Ok(u32::from(removed))
    }
}

#[async_trait]
impl FileProcessor for ThumbnailCleanupProcessor {
    /// This processor's tree is the height directory itself.
    fn root_folder(&self) -> &Path {
        &self.root
    }

    /// "Process" here means delete: a rendition whose mirrored source
    /// matches a skip rule is itself the work item.
    fn should_process_file(&self, path: &Path) -> bool {
        self.classifier.allows_extension(path) && self.mirrors_skipped_source(path)
    }

    /// A rendition is orphaned when it mirrors a valid source path but no
    /// original with any allowed extension exists anymore.
    fn should_clean_file(&self, path: &Path) -> bool {
        if !self.classifier.allows_extension(path) || self.mirrors_skipped_source(path) {
            return false;
        }
        let candidates = self.source_candidates(path);
        !candidates.is_empty() && !candidates.iter().any(|candidate| candidate.exists())
    }

    async fn on_file_created(&self, file: &FileRecord) -> Result<u32> {
        self.delete_rendition(file.path()).await
    }

    async fn on_file_changed(&self, _file: &FileRecord) -> Result<()> {
        // Renditions are never edited in place by anyone but us.
        Ok(())
    }

    async fn on_file_deleted(&self, _file: &FileRecord) -> Result<u32> {
        // Already gone, whether by us or by hand.
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

    async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32> {
        self.delete_rendition(file.path()).await
    }

    async fn on_ensure_cleanup(&self, file: &FileRecord) -> Result<u32> {
        self.delete_rendition(file.path()).await
    }

    async fn on_scan_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_scan_end(&self) -> Result<()> {
        Ok(())
    }
}
