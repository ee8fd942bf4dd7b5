//! Error types for the capture pipeline

use thiserror::Error;

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing a page
#[derive(Error, Debug)]
pub enum Error {
    /// The request was rejected before any engine work started
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The engine reported a load error or never delivered its notification
    #[error("Failed to load page: {0}")]
    LoadFailure(String),

    /// The opt-in load timeout expired before the engine signalled completion
    #[error("Page load timed out after {0}ms")]
    LoadTimeout(u64),

    /// Surface allocation or bitmap extraction failed
    #[error("Capture failed: {0}")]
    CaptureFailure(String),

    /// PNG encoding or the filesystem write failed
    #[error("Failed to write image: {0}")]
    EncodeOrWriteFailure(String),

    /// The event loop could not be started
    #[error("Event loop error: {0}")]
    EventLoop(String),
}

impl Error {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidInput(_) => 2,
            _ => 1,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CaptureFailure(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::EncodeOrWriteFailure(err.to_string())
    }
}
