//! Error types for the radio engine and its collaborators

use std::time::Duration;

/// Result type alias for radio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a station
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error (station directories, recipes, artefacts)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing failed
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Station name reduced to nothing once slugified
    #[error("Invalid radio name: {0:?}")]
    InvalidRadioName(String),

    /// The engine task is gone; commands can no longer be delivered
    #[error("Radio engine is not running")]
    EngineStopped,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a generic error from a string
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Failure of the audio rendering backend for one track.
///
/// The engine treats every variant the same way (a failed generation); the
/// distinction only matters for logs and error reports.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("renderer HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("renderer HTTP error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected renderer response: {0}")]
    Malformed(String),

    #[error("failed to write track file: {0}")]
    Io(#[from] std::io::Error),

    #[error("render cancelled")]
    Cancelled,
}
