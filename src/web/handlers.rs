use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::{mjpeg_body, LiveSession, SnapshotSession};
use crate::video::{CaptureFormat, EngineState, Frame, PixelFormat, Resolution};

const X_TIMESTAMP: HeaderName = HeaderName::from_static("x-timestamp");
const X_FRAME_SEQUENCE: HeaderName = HeaderName::from_static("x-frame-sequence");

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub state: EngineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let engine_state = state.engine.state();
    if engine_state != EngineState::Faulted {
        return Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            state: engine_state,
            last_error: None,
        })
        .into_response();
    }

    let last_error = state.engine.status().await.ok().and_then(|s| s.last_error);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthResponse {
            status: "faulted",
            version: env!("CARGO_PKG_VERSION"),
            state: engine_state,
            last_error,
        }),
    )
        .into_response()
}

// ============================================================================
// Capture control
// ============================================================================

#[derive(Serialize)]
pub struct ControlResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<CaptureFormat>,
}

/// Query parameters accepted by `/camera/start`
#[derive(Deserialize, Default)]
pub struct StartQuery {
    /// `WIDTHxHEIGHT`
    pub resolution: Option<String>,
    pub format: Option<String>,
    pub fps: Option<u32>,
}

impl StartQuery {
    fn is_empty(&self) -> bool {
        self.resolution.is_none() && self.format.is_none() && self.fps.is_none()
    }
}

fn parse_resolution(raw: Option<&str>) -> Result<Option<Resolution>> {
    raw.map(|s| s.parse::<Resolution>().map_err(AppError::BadRequest))
        .transpose()
}

fn parse_pixel_format(raw: Option<&str>) -> Result<Option<PixelFormat>> {
    raw.map(|s| s.parse::<PixelFormat>().map_err(AppError::BadRequest))
        .transpose()
}

pub async fn camera_start(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StartQuery>,
) -> Result<Json<ControlResponse>> {
    let requested = if query.is_empty() {
        None
    } else {
        let resolution = parse_resolution(query.resolution.as_deref())?;
        let pixel_format = parse_pixel_format(query.format.as_deref())?;
        if query.fps == Some(0) {
            return Err(AppError::BadRequest("fps must be at least 1".to_string()));
        }

        // Unspecified fields keep the current (or configured) value
        let mut format = match state.engine.status().await?.negotiated_format {
            Some(current) => current,
            None => state
                .config
                .capture
                .capture_format()
                .map_err(AppError::Config)?,
        };
        if let Some(resolution) = resolution {
            format.resolution = resolution;
        }
        if let Some(pixel_format) = pixel_format {
            format.pixel_format = pixel_format;
        }
        if let Some(fps) = query.fps {
            format.fps = fps;
        }
        Some(format)
    };

    let negotiated = state.engine.start(requested).await?;
    info!("Capture started via API: {}", negotiated);

    Ok(Json(ControlResponse {
        status: "started",
        format: Some(negotiated),
    }))
}

pub async fn camera_stop(State(state): State<Arc<AppState>>) -> Result<Json<ControlResponse>> {
    state.engine.stop().await?;
    info!("Capture stopped via API");
    Ok(Json(ControlResponse {
        status: "stopped",
        format: None,
    }))
}

pub async fn camera_status(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let status = state.engine.status().await?;
    Ok(Json(status))
}

// ============================================================================
// Snapshots
// ============================================================================

/// Query parameters accepted by `/camera/frame` and `/camera/capture`
#[derive(Deserialize, Default)]
pub struct FrameQuery {
    pub resolution: Option<String>,
    pub format: Option<String>,
}

/// Wait for one frame, checking the request against what the device produces
async fn take_snapshot(state: &AppState, query: &FrameQuery) -> Result<Frame> {
    let resolution = parse_resolution(query.resolution.as_deref())?;
    let pixel_format = parse_pixel_format(query.format.as_deref())?;

    if !state.engine.is_streaming() {
        return Err(AppError::NotStreaming);
    }

    if resolution.is_some() || pixel_format.is_some() {
        let current = state
            .engine
            .status()
            .await?
            .negotiated_format
            .ok_or(AppError::NotStreaming)?;
        if let Some(pixel_format) = pixel_format {
            if pixel_format != current.pixel_format {
                return Err(AppError::FormatMismatch(format!(
                    "requested {}, device is producing {}",
                    pixel_format, current.pixel_format
                )));
            }
        }
        if let Some(resolution) = resolution {
            if resolution != current.resolution {
                return Err(AppError::FormatMismatch(format!(
                    "requested {}, device is producing {}",
                    resolution, current.resolution
                )));
            }
        }
    }

    let session = SnapshotSession::open(state.engine.distributor());
    let frame = session.wait(state.config.stream.snapshot_timeout()).await?;
    Ok(frame)
}

fn no_cache_headers() -> [(HeaderName, &'static str); 3] {
    [
        (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        (header::PRAGMA, "no-cache"),
        (header::EXPIRES, "0"),
    ]
}

/// Single frame in its native encoding
pub async fn camera_frame(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FrameQuery>,
) -> Result<Response> {
    let frame = take_snapshot(&state, &query).await?;

    Ok((
        StatusCode::OK,
        no_cache_headers(),
        [
            (header::CONTENT_TYPE, frame.content_type().to_string()),
            (header::CONTENT_LENGTH, frame.len().to_string()),
            (X_TIMESTAMP, frame.timestamp_header()),
            (X_FRAME_SEQUENCE, frame.sequence.to_string()),
        ],
        frame.data_bytes(),
    )
        .into_response())
}

#[derive(Serialize)]
pub struct CaptureResponse {
    pub sequence: u64,
    pub timestamp: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub size: usize,
    pub content_type: &'static str,
    /// Base64 (standard alphabet) payload
    pub image: String,
}

impl From<&Frame> for CaptureResponse {
    fn from(frame: &Frame) -> Self {
        Self {
            sequence: frame.sequence,
            timestamp: frame.timestamp.to_rfc3339(),
            width: frame.width(),
            height: frame.height(),
            format: frame.format,
            size: frame.len(),
            content_type: frame.content_type(),
            image: base64::engine::general_purpose::STANDARD.encode(frame.data()),
        }
    }
}

/// Single frame wrapped in a JSON document
pub async fn camera_capture(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FrameQuery>,
) -> Result<Response> {
    let frame = take_snapshot(&state, &query).await?;
    Ok((no_cache_headers(), Json(CaptureResponse::from(&frame))).into_response())
}

// ============================================================================
// MJPEG stream
// ============================================================================

pub async fn camera_stream(State(state): State<Arc<AppState>>) -> Result<Response> {
    if !state.engine.is_streaming() {
        return Err(AppError::NotStreaming);
    }

    let session = LiveSession::open(state.engine.distributor());
    // Stop publishes the new state before terminating subscribers, so a
    // session registered too late is caught here
    if !state.engine.is_streaming() || session.is_closed() {
        return Err(AppError::NotStreaming);
    }

    let options = state.config.stream.mjpeg_options();
    let content_type = options.content_type();
    let body = Body::from_stream(mjpeg_body(session, options));

    Ok((
        StatusCode::OK,
        no_cache_headers(),
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONNECTION, "keep-alive".to_string()),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_capture_document() {
        let payload = Bytes::from_static(&[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        let frame = Frame::new(payload, &CaptureFormat::default(), 42);
        let doc = serde_json::to_value(CaptureResponse::from(&frame)).unwrap();

        assert_eq!(doc["sequence"], 42);
        assert_eq!(doc["width"], 640);
        assert_eq!(doc["height"], 480);
        assert_eq!(doc["format"], "MJPEG");
        assert_eq!(doc["size"], 6);
        assert_eq!(doc["content_type"], "image/jpeg");
        assert_eq!(doc["image"], "/9gBAv/Z");
    }

    #[test]
    fn test_query_parsing() {
        assert_eq!(
            parse_resolution(Some("1280x720")).unwrap(),
            Some(Resolution::HD720)
        );
        assert!(parse_resolution(None).unwrap().is_none());
        assert!(matches!(
            parse_resolution(Some("wide")),
            Err(AppError::BadRequest(_))
        ));
        assert_eq!(
            parse_pixel_format(Some("yuyv")).unwrap(),
            Some(PixelFormat::Yuyv)
        );
        assert!(matches!(
            parse_pixel_format(Some("h264")),
            Err(AppError::BadRequest(_))
        ));
    }
}
