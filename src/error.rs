//! Error taxonomy for device, format, and configuration failures.
//!
//! Driver-signaled overruns/underruns are not represented here: backends
//! absorb them with in-place recovery and retry, and the rings treat data
//! loss as a counted event rather than an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    /// Device enumeration/open/configure/start failure, with the native
    /// status code when the driver provided one.
    #[error("audio device error: {message} (status {status})")]
    Device { message: String, status: i32 },

    /// Requested format unsupported and no compatible negotiation found.
    #[error("unsupported audio format: {0}")]
    Format(String),

    /// Invalid construction parameter or control argument.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AudioError {
    pub fn device(message: impl Into<String>, status: i32) -> Self {
        Self::Device {
            message: message.into(),
            status,
        }
    }
}
