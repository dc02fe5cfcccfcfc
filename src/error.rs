use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::stream::SessionError;
use crate::video::CaptureError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Capture is not running")]
    NotStreaming,

    #[error("No frame available: {0}")]
    NoFrame(#[from] SessionError),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::FormatMismatch(_) => "format_mismatch",
            AppError::Config(_) => "config_error",
            AppError::Capture(e) => e.code(),
            AppError::NotStreaming => "not_streaming",
            AppError::NoFrame(SessionError::SnapshotTimeout) => "snapshot_timeout",
            AppError::NoFrame(SessionError::Closed) => "capture_stopped",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::FormatMismatch(_) => StatusCode::CONFLICT,
            AppError::NotStreaming | AppError::NoFrame(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Capture(CaptureError::AcquireTimeout | CaptureError::EngineGone) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            code: self.code(),
            message: self.to_string(),
        };

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(
                error_code = body.code,
                error_message = %body.message,
                "Request failed"
            );
        } else {
            tracing::debug!(
                error_code = body.code,
                error_message = %body.message,
                "Request rejected"
            );
        }

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
