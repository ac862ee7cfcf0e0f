//! Error types for the capture pipeline.

use thiserror::Error;

/// Errors that can occur during capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Windows API error.
    #[error("Windows API error: {message}")]
    WindowsApi {
        message: String,
        #[cfg(windows)]
        #[source]
        source: Option<windows::core::Error>,
    },

    /// GPU texture allocation failed.
    #[error("Texture allocation failed: {0}")]
    AllocationFailed(String),

    /// Mapping a staging texture for CPU access failed.
    #[error("Texture map failed: {0}")]
    MapFailed(String),

    /// The texture is already mapped.
    #[error("Texture is already mapped")]
    AlreadyMapped,

    /// The texture has no backing GPU object.
    #[error("Texture has not been prepared")]
    NotPrepared,

    /// Every pool slot is already in use for the current epoch.
    #[error("Staging pool exhausted for epoch {epoch}")]
    PoolExhausted { epoch: u64 },

    /// Another application holds the exclusive duplication handle.
    #[error("Desktop duplication is not currently available")]
    DuplicationUnavailable,

    /// Duplication access was lost (mode change, secure desktop, unplug).
    #[error("Desktop duplication access lost")]
    AccessLost,

    /// Keyed mutex error.
    #[error("Keyed mutex error: {0}")]
    KeyedMutex(String),

    /// Monitor not found.
    #[error("Monitor not found: {0}")]
    MonitorNotFound(String),

    /// Failed to start the capture thread.
    #[error("Failed to spawn capture thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// Desktop duplication is not supported on this platform.
    #[error("Desktop duplication not supported")]
    NotSupported,
}

impl CaptureError {
    /// Returns true if the error is the user-actionable exclusive-access case.
    pub fn is_duplication_unavailable(&self) -> bool {
        matches!(self, Self::DuplicationUnavailable)
    }

    /// Returns true for resource pressure the render side recovers from next frame.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed(_) | Self::MapFailed(_) | Self::PoolExhausted { .. }
        )
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for CaptureError {
    fn from(err: windows::core::Error) -> Self {
        use windows::Win32::Graphics::Dxgi::{
            DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_NOT_CURRENTLY_AVAILABLE,
        };

        let code = err.code();
        if code == DXGI_ERROR_NOT_CURRENTLY_AVAILABLE {
            return Self::DuplicationUnavailable;
        }
        if code == DXGI_ERROR_ACCESS_LOST {
            return Self::AccessLost;
        }
        Self::WindowsApi {
            message: err.message().to_string(),
            source: Some(err),
        }
    }
}
