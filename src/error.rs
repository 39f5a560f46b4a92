//! Error kinds for the scan pipeline.
//!
//! None of these are fatal to the process. `FetchError` and `DecodeError` mark a
//! camera offline for one cycle, `InferenceError` leaves it online with no
//! detections, and `PublishError` is logged and skipped. `ConfigError` rejects a
//! configuration change and leaves the controller in its previous state.

use thiserror::Error;

/// Rejected configuration. The previous valid configuration (if any) stays active.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("detection model '{path}' could not be loaded: {reason}")]
    Model { path: String, reason: String },

    #[error("scan timer could not be started: {0}")]
    Timer(String),

    #[error("controller is stopped")]
    Stopped,
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// A camera could not deliver a frame.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("camera responded with HTTP {status}")]
    Status { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unusable response body: {0}")]
    Body(String),
}

impl FetchError {
    /// HTTP status code when the camera answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status } => Some(*status),
            _ => None,
        }
    }
}

/// Per-camera failure inside one scan cycle.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("frame could not be decoded: {0}")]
    Decode(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("publish failed: {0}")]
    Publish(String),
}
