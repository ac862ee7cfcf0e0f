//! Error types for the fleet.

use thiserror::Error;
use xrdesk_capture::CaptureError;

/// Errors raised while enumerating monitors or managing the fleet.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Capture backend error.
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// The monitor change watcher could not be started.
    #[error("Monitor change watcher failed: {0}")]
    Watcher(String),

    /// Failed to start a background thread.
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

/// Result type for fleet operations.
pub type EngineResult<T> = Result<T, EngineError>;
