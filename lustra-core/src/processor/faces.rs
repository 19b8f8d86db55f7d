//! Face detection over tracked media records.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::classify::FileClassifier;
use crate::error::Result;
use crate::processor::FileProcessor;
use crate::record::FileRecord;
use crate::store::{FaceDetector, FaceStore, MediaRecordId, MediaRecordStore};

/// Runs the detection engine once per image record and persists the
/// observations. A record that has been through detection - even with zero
/// faces found - is never re-scanned, so repeated dispatches are free.
///
/// When the detector reports itself unavailable (models not installed) the
/// processor degrades to a no-op and says so once.
pub struct FaceDetectionProcessor {
    classifier: Arc<FileClassifier>,
    detector: Arc<dyn FaceDetector>,
    faces: Arc<dyn FaceStore>,
    media: Arc<dyn MediaRecordStore>,
    warned_unavailable: AtomicBool,
}

impl FaceDetectionProcessor {
    pub fn new(
        classifier: Arc<FileClassifier>,
        detector: Arc<dyn FaceDetector>,
        faces: Arc<dyn FaceStore>,
        media: Arc<dyn MediaRecordStore>,
    ) -> Self {
        Self {
            classifier,
            detector,
            faces,
            media,
            warned_unavailable: AtomicBool::new(false),
        }
    }

    async fn media_id_of(&self, file: &FileRecord) -> Result<Option<MediaRecordId>> {
        if let Some(record) = file.media() {
            return Ok(Some(record.id));
        }
        Ok(self
            .media
            .find_media(file.path())
            .await?
            .map(|record| record.id))
    }

    async fn scan_file(&self, file: &FileRecord) -> Result<u32> {
        // Detection is image-only; video frames are out of scope here.
        if self.classifier.is_video(file.path()) {
            return Ok(0);
        }
        if !self.detector.is_available() {
            if !self.warned_unavailable.swap(true, Ordering::SeqCst) {
                warn!("face detection models unavailable, skipping face scans");
            }
            return Ok(0);
        }
        let Some(media_id) = self.media_id_of(file).await? else {
            debug!(path = %file.path().display(), "no media record yet, face scan deferred");
            return Ok(0);
        };
        if self.faces.faces_scanned(media_id).await? {
            return Ok(0);
        }

        let observations = self.detector.detect_faces(file.path()).await?;
        self.faces.record_faces(media_id, &observations).await?;
        info!(
            path = %file.path().display(),
            faces = observations.len(),
            "face scan complete"
        );
        Ok(1)
    }

    async fn forget_file(&self, path: &Path) -> Result<u32> {
        let Some(record) = self.media.find_media(path).await? else {
            return Ok(0);
        };
        let removed = self.faces.delete_faces(record.id).await?;
        Ok(u32::from(removed > 0))
    }
}

impl std::fmt::Debug for FaceDetectionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceDetectionProcessor")
            .field("root", &self.classifier.root())
            .field("detector_available", &self.detector.is_available())
            .finish()
    }
}

#[async_trait]
impl FileProcessor for FaceDetectionProcessor {
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
        self.scan_file(file).await
    }

    async fn on_file_changed(&self, file: &FileRecord) -> Result<()> {
        // New content invalidates previous observations.
        if let Some(record) = self.media.find_media(file.path()).await? {
            self.faces.delete_faces(record.id).await?;
        }
        self.scan_file(file).await.map(|_| ())
    }

    async fn on_file_deleted(&self, file: &FileRecord) -> Result<u32> {
        self.forget_file(file.path()).await
    }

    async fn on_file_renamed(
        &self,
        old: &FileRecord,
        new: &FileRecord,
        new_valid: bool,
    ) -> Result<()> {
        self.forget_file(old.path()).await?;
        if new_valid {
            self.scan_file(new).await?;
        }
        Ok(())
    }

    async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32> {
        self.scan_file(file).await
    }

    async fn on_ensure_cleanup(&self, file: &FileRecord) -> Result<u32> {
        if self.classifier.in_derivatives(file.path()) {
            return Ok(0);
        }
        let mut cleaned = 0;
        for original in self.classifier.original_candidates(file.path()) {
            cleaned += self.forget_file(&original).await?;
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
