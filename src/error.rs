//! Error taxonomy for the download pipeline.
//!
//! Messages are normalized: nothing here ever carries raw extractor stderr or
//! exit codes. Those are logged where the failure is observed.

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported platform for {0}")]
    UnsupportedPlatform(String),

    #[error("failed to fetch video info: {0}")]
    ExtractionFailure(String),

    #[error("failed to download video: {0}")]
    DownloadFailure(String),

    #[error("access denied")]
    PathTraversalAttempt,

    #[error("file not found")]
    FileNotFound,

    #[error("yt-dlp is not installed on the system")]
    ToolUnavailable,

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// True for failures caused by the caller's input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidUrl(_) | Self::UnsupportedPlatform(_))
    }

    /// Lookup failures for stored files. Traversal attempts deliberately fall
    /// in the same bucket as missing files.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound | Self::PathTraversalAttempt)
    }
}
