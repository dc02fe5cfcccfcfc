//! Capture engine errors

use std::io;
use thiserror::Error;

/// Errors raised by the capture device, its buffer pool and the engine
/// control surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Device unavailable [{device}]: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Format unsupported: {0}")]
    FormatUnsupported(String),

    #[error("Buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Failed to start stream: {0}")]
    StreamStartFailed(String),

    #[error("Timed out waiting for a frame")]
    AcquireTimeout,

    #[error("Failed to acquire frame: {0}")]
    AcquireFailed(String),

    #[error("Failed to release buffer {index}: {reason}")]
    ReleaseFailed { index: usize, reason: String },

    #[error("Invalid device state: {0}")]
    InvalidState(String),

    #[error("Capture engine is not running")]
    EngineGone,
}

impl CaptureError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::DeviceUnavailable { .. } => "device_unavailable",
            CaptureError::FormatUnsupported(_) => "format_unsupported",
            CaptureError::AllocationFailed(_) => "allocation_failed",
            CaptureError::StreamStartFailed(_) => "stream_start_failed",
            CaptureError::AcquireTimeout => "acquire_timeout",
            CaptureError::AcquireFailed(_) => "acquire_failed",
            CaptureError::ReleaseFailed { .. } => "release_failed",
            CaptureError::InvalidState(_) => "invalid_state",
            CaptureError::EngineGone => "engine_gone",
        }
    }

    /// Whether the capture loop should simply retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::AcquireTimeout)
    }

    pub(crate) fn unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
        CaptureError::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errno values that mean the device is gone rather than misbehaving
pub(crate) fn is_device_lost(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENXIO)
            | Some(libc::ENODEV)
            | Some(libc::EIO)
            | Some(libc::EPIPE)
            | Some(libc::ESHUTDOWN)
    )
}

/// Errno values that mean another process holds the device
pub(crate) fn is_busy(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBUSY))
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_snake_case() {
        let errors = [
            CaptureError::unavailable("/dev/video0", "busy"),
            CaptureError::FormatUnsupported("x".into()),
            CaptureError::AcquireTimeout,
            CaptureError::ReleaseFailed {
                index: 1,
                reason: "EINVAL".into(),
            },
        ];
        for err in errors {
            assert!(err.code().chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn test_only_timeout_is_recoverable() {
        assert!(CaptureError::AcquireTimeout.is_recoverable());
        assert!(!CaptureError::AcquireFailed("EIO".into()).is_recoverable());
    }

    #[test]
    fn test_errno_classification() {
        assert!(is_device_lost(&io::Error::from_raw_os_error(libc::ENODEV)));
        assert!(!is_device_lost(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(is_busy(&io::Error::from_raw_os_error(libc::EBUSY)));
    }
}
