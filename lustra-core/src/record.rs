//! Path-identity value type shared by every change source and processor.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use crate::store::MediaRecord;

/// A file observed by a scan or the live watcher, optionally carrying the
/// store record it originated from and the source image dimensions once a
/// processor has paid for decoding them.
///
/// Identity is the path alone, compared case-insensitively: two records for
/// the same path are the same file for snapshot set-difference purposes, no
/// matter which source produced them or what payload they carry.
pub struct FileRecord {
    path: PathBuf,
    key: String,
    media: Option<Arc<MediaRecord>>,
    dimensions: OnceLock<(u32, u32)>,
}

impl FileRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let key = path_key(&path);
        Self {
            path,
            key,
            media: None,
            dimensions: OnceLock::new(),
        }
    }

    /// A record backed by a tracked store row, as produced by the
    /// record-store scan source.
    pub fn with_media(path: impl Into<PathBuf>, media: Arc<MediaRecord>) -> Self {
        let mut record = Self::new(path);
        record.media = Some(media);
        record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Case-folded identity key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn media(&self) -> Option<&Arc<MediaRecord>> {
        self.media.as_ref()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions.get().copied()
    }

    /// Cache the source dimensions so downstream processors in the same
    /// dispatch do not re-decode the image. First writer wins.
    pub fn set_dimensions(&self, width: u32, height: u32) {
        let _ = self.dimensions.set((width, height));
    }
}

/// Case-folded key for a path, used wherever path identity is compared.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

impl Clone for FileRecord {
    fn clone(&self) -> Self {
        let dimensions = OnceLock::new();
        if let Some(dims) = self.dimensions.get() {
            let _ = dimensions.set(*dims);
        }
        Self {
            path: self.path.clone(),
            key: self.key.clone(),
            media: self.media.clone(),
            dimensions,
        }
    }
}

impl PartialEq for FileRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FileRecord {}

impl Hash for FileRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRecord")
            .field("path", &self.path)
            .field("media_id", &self.media.as_ref().map(|m| m.id))
            .field("dimensions", &self.dimensions.get())
            .finish()
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl From<&Path> for FileRecord {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}
