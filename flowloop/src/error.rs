//! # Capture error taxonomy

use thiserror::Error;

/// Errors surfaced by capture sources and the frame loop.
///
/// Sources return these wrapped in `anyhow::Error`, callers may `downcast_ref` to tell them
/// apart.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No capture backend is available for the requested input.
    #[error("capture unsupported: {0}")]
    CaptureUnsupported(String),
    /// The user or the operating system declined access to the device.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The device could not be opened or stopped delivering frames.
    #[error("device error: {0}")]
    DeviceError(String),
    /// A single tick failed while reading, converting or computing flow.
    #[error("tick {tick} failed: {message}")]
    TickFailure { tick: usize, message: String },
}
