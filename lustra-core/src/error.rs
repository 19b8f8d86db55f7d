use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),

    #[error("invalid media file: {0}")]
    InvalidMedia(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("{operation} failed for {} after {attempts} attempts: {source}", .path.display())]
    RetryExhausted {
        operation: String,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
