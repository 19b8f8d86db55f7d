//! Derivative rendition maintenance.
//!
//! For every in-scope media file and every configured height the processor
//! keeps one rendition at a deterministic path under the derivatives zone:
//! images are decoded once and resized per height, videos have their first
//! frame extracted per height. Deleting or reclassifying a source removes
//! its renditions and prunes emptied directories.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::classify::FileClassifier;
use crate::error::{Result, SyncError};
use crate::processor::FileProcessor;
use crate::record::FileRecord;
use crate::retry::{RetryPolicy, execute_with_retry};

pub mod cleanup;
pub mod layout;
mod video;

pub use cleanup::ThumbnailCleanupProcessor;
pub use layout::{DerivativeLayout, VIDEO_STILL_EXT};

/// Builds and maintains derivative renditions for every configured height.
#[derive(Debug)]
pub struct ThumbnailProcessor {
    classifier: Arc<FileClassifier>,
    layout: DerivativeLayout,
    heights: Vec<u32>,
    retry: RetryPolicy,
}

impl ThumbnailProcessor {
    pub fn new(classifier: Arc<FileClassifier>, heights: Vec<u32>) -> Self {
        let layout = DerivativeLayout::new(classifier.root());
        Self {
            classifier,
            layout,
            heights,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn heights(&self) -> &[u32] {
        &self.heights
    }

    pub fn layout(&self) -> &DerivativeLayout {
        &self.layout
    }

    /// Heights whose rendition of `source` does not exist yet.
    async fn missing_heights(&self, source: &Path) -> Vec<u32> {
        let is_video = self.classifier.is_video(source);
        let mut missing = Vec::new();
        for &height in &self.heights {
            let Some(derivative) = self.layout.derivative_path(source, height, is_video) else {
                continue;
            };
            if !tokio::fs::try_exists(&derivative).await.unwrap_or(false) {
                missing.push(height);
            }
        }
        missing
    }

    /// Build renditions of `file` for the given heights. Returns whether
    /// anything was written.
    async fn build_derivatives(&self, file: &FileRecord, heights: &[u32]) -> Result<bool> {
        if heights.is_empty() {
            return Ok(false);
        }
        let source = file.path();
        if self.classifier.is_video(source) {
            // Videos are processed per height: each extraction is an
            // independent decode, unlike images which decode once.
            for &height in heights {
                let Some(derivative) = self.layout.derivative_path(source, height, true) else {
                    return Ok(false);
                };
                self.build_video_derivative(source, &derivative, height)
                    .await?;
                info!(height, derivative = %derivative.display(), "built video derivative");
            }
        } else {
            let targets: Vec<(u32, PathBuf)> = heights
                .iter()
                .filter_map(|&height| {
                    self.layout
                        .derivative_path(source, height, false)
                        .map(|path| (height, path))
                })
                .collect();
            if targets.is_empty() {
                return Ok(false);
            }
            let (width, height) = self.build_image_derivatives(source, targets).await?;
            file.set_dimensions(width, height);
        }
        Ok(true)
    }

    /// Decode the source once and write every target from the same decode.
    async fn build_image_derivatives(
        &self,
        source: &Path,
        targets: Vec<(u32, PathBuf)>,
    ) -> Result<(u32, u32)> {
        execute_with_retry(&self.retry, "build image derivatives", source, || {
            let source = source.to_path_buf();
            let targets = targets.clone();
            async move {
                spawn_blocking(move || -> Result<(u32, u32)> {
                    let img = image::open(&source)?;
                    let (src_w, src_h) = (img.width(), img.height());
                    for (target_height, target) in &targets {
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        if src_h > *target_height {
                            let scale = f64::from(*target_height) / f64::from(src_h);
                            let out_w = ((f64::from(src_w) * scale).round() as u32).max(1);
                            img.resize_exact(out_w, *target_height, FilterType::Lanczos3)
                                .save(target)?;
                        } else {
                            // Source is already at or below the target
                            // height: copy at native size.
                            std::fs::copy(&source, target)?;
                        }
                    }
                    Ok((src_w, src_h))
                })
                .await
                .map_err(|err| SyncError::Internal(format!("image task panicked: {err}")))?
            }
        })
        .await
    }

    async fn build_video_derivative(
        &self,
        source: &Path,
        derivative: &Path,
        height: u32,
    ) -> Result<()> {
        execute_with_retry(&self.retry, "build video derivative", source, || {
            let source = source.to_path_buf();
            let derivative = derivative.to_path_buf();
            async move {
                spawn_blocking(move || -> Result<()> {
                    if let Some(parent) = derivative.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    video::extract_scaled_frame(&source, &derivative, height)
                })
                .await
                .map_err(|err| SyncError::Internal(format!("ffmpeg task panicked: {err}")))?
            }
        })
        .await
    }

    /// Delete every height's rendition of `source`, pruning directories the
    /// deletions emptied. Returns how many files were removed.
    async fn remove_derivatives(&self, source: &Path) -> Result<u32> {
        let is_video = self.classifier.is_video(source);
        let mut removed = 0;
        for &height in &self.heights {
            let Some(derivative) = self.layout.derivative_path(source, height, is_video) else {
                continue;
            };
            if remove_file_and_prune(&self.retry, &derivative, self.layout.base()).await? {
                debug!(derivative = %derivative.display(), "deleted derivative");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl FileProcessor for ThumbnailProcessor {
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
        let missing = self.missing_heights(file.path()).await;
        if missing.is_empty() {
            return Ok(0);
        }
        let built = self.build_derivatives(file, &missing).await?;
        Ok(u32::from(built))
    }

    async fn on_file_changed(&self, file: &FileRecord) -> Result<()> {
        // The content changed: rebuild every height from the new bytes.
        let heights = self.heights.clone();
        self.build_derivatives(file, &heights).await?;
        Ok(())
    }

    async fn on_file_deleted(&self, file: &FileRecord) -> Result<u32> {
        let removed = self.remove_derivatives(file.path()).await?;
        Ok(u32::from(removed > 0))
    }

    async fn on_file_renamed(
        &self,
        old: &FileRecord,
        new: &FileRecord,
        new_valid: bool,
    ) -> Result<()> {
        self.remove_derivatives(old.path()).await?;
        if new_valid {
            let missing = self.missing_heights(new.path()).await;
            self.build_derivatives(new, &missing).await?;
        }
        Ok(())
    }

    async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32> {
        self.on_file_created(file).await
    }

    async fn on_ensure_cleanup(&self, file: &FileRecord) -> Result<u32> {
        // Never chase originals for paths inside the derivatives zone.
        if self.layout.contains(file.path()) {
            return Ok(0);
        }
        let mut cleaned = 0;
        for original in self.classifier.original_candidates(file.path()) {
            if self.remove_derivatives(&original).await? > 0 {
                info!(
                    skip = %file.path().display(),
                    original = %original.display(),
                    "cleaned derivatives of reclassified file"
                );
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    async fn on_scan_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_scan_end(&self) -> Result<()> {
        Ok(())
    }
}

/// Delete `path` if it exists (with retry), then remove now-empty parent
/// directories up to, but never including, `stop`.
pub(crate) async fn remove_file_and_prune(
    retry: &RetryPolicy,
    path: &Path,
    stop: &Path,
) -> Result<bool> {
    let removed = execute_with_retry(retry, "remove derivative", path, || async {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    })
    .await?;

    if removed && let Some(parent) = path.parent() {
        prune_empty_dirs(parent, stop).await;
    }
    Ok(removed)
}

/// Walk upward from `start`, removing each directory that is empty, stopping
/// at the first non-empty directory or at `stop` (exclusive).
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut dir = start.to_path_buf();
    while dir != stop && dir.starts_with(stop) {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            break;
        };
        match entries.next_entry().await {
            Ok(None) => {}
            _ => break,
        }
        if tokio::fs::remove_dir(&dir).await.is_err() {
            break;
        }
        debug!(dir = %dir.display(), "pruned empty derivative directory");
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
}
