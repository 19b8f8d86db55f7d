//! Deterministic mapping between source files and their derivative
//! renditions on disk.

use std::path::{Path, PathBuf};

use crate::classify::DERIVATIVES_DIR;

/// Still-image extension derivatives of video files are written with.
pub const VIDEO_STILL_EXT: &str = "jpg";

/// `{root}/_derivatives/{height}/{relative path}`, with video extensions
/// rewritten to [`VIDEO_STILL_EXT`]. This layout is consumed by the static
/// file layer and must stay stable.
#[derive(Clone, Debug)]
pub struct DerivativeLayout {
    root: PathBuf,
    base: PathBuf,
}

impl DerivativeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let base = root.join(DERIVATIVES_DIR);
        Self { root, base }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The derivatives zone itself: `{root}/_derivatives`.
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn height_dir(&self, height: u32) -> PathBuf {
        self.base.join(height.to_string())
    }

    /// Where the rendition of `source` at `height` lives. None when the
    /// source does not sit under the library root.
    pub fn derivative_path(&self, source: &Path, height: u32, is_video: bool) -> Option<PathBuf> {
        let rel = source.strip_prefix(&self.root).ok()?;
        let mut derivative = self.height_dir(height).join(rel);
        if is_video {
            derivative.set_extension(VIDEO_STILL_EXT);
        }
        Some(derivative)
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.base)
    }

    /// Reverse mapping: the source path a derivative at `height` mirrors.
    /// The extension is returned as found; video sources need the caller to
    /// try their own extensions.
    pub fn original_for(&self, derivative: &Path, height: u32) -> Option<PathBuf> {
        let rel = derivative.strip_prefix(self.height_dir(height)).ok()?;
        if rel.as_os_str().is_empty() {
            return None;
        }
        Some(self.root.join(rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_paths_mirror_the_tree() {
        let layout = DerivativeLayout::new("/library");
        assert_eq!(
            layout.derivative_path(Path::new("/library/a/b/photo.jpg"), 400, false),
            Some(PathBuf::from("/library/_derivatives/400/a/b/photo.jpg"))
        );
    }

    #[test]
    fn video_extensions_become_stills() {
        let layout = DerivativeLayout::new("/library");
        assert_eq!(
            layout.derivative_path(Path::new("/library/a/clip.mp4"), 800, true),
            Some(PathBuf::from("/library/_derivatives/800/a/clip.jpg"))
        );
    }

    #[test]
    fn sources_outside_the_root_have_no_derivative() {
        let layout = DerivativeLayout::new("/library");
        assert_eq!(
            layout.derivative_path(Path::new("/elsewhere/photo.jpg"), 400, false),
            None
        );
    }

    #[test]
    fn original_for_round_trips() {
        let layout = DerivativeLayout::new("/library");
        let derivative = Path::new("/library/_derivatives/400/a/photo.jpg");
        assert_eq!(
            layout.original_for(derivative, 400),
            Some(PathBuf::from("/library/a/photo.jpg"))
        );
        assert_eq!(layout.original_for(derivative, 800), None);
    }
}
