use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::stream::MjpegOptions;
use crate::video::capture::{DEFAULT_RETRY_BUDGET, MIN_FRAME_SIZE};
use crate::video::{CaptureConfig, CaptureFormat, PixelFormat, Resolution};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Video capture settings
    pub capture: CaptureSettings,
    /// Snapshot and MJPEG delivery settings
    pub stream: StreamSettings,
    /// Web server settings
    pub web: WebSettings,
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureSettings {
    /// Video device path (e.g., /dev/video0)
    pub device: String,
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Pixel format ("MJPEG", "YUYV", "RAW")
    pub format: String,
    /// Frame rate
    pub fps: u32,
    /// Number of mmap buffers to request
    pub buffer_count: u32,
    pub acquire_timeout_ms: u64,
    /// Consecutive acquire failures tolerated before faulting
    pub retry_budget: u32,
    /// MJPEG frames below this many bytes are dropped
    pub min_frame_size: usize,
    /// Start capturing as soon as the service is up
    pub start_on_boot: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            format: "MJPEG".to_string(),
            fps: 30,
            buffer_count: 4,
            acquire_timeout_ms: 1000,
            retry_budget: DEFAULT_RETRY_BUDGET,
            min_frame_size: MIN_FRAME_SIZE,
            start_on_boot: true,
        }
    }
}

impl CaptureSettings {
    pub fn pixel_format(&self) -> Result<PixelFormat, String> {
        self.format.parse()
    }

    pub fn capture_format(&self) -> Result<CaptureFormat, String> {
        let resolution = Resolution::new(self.width, self.height);
        if !resolution.is_valid() {
            return Err(format!("Resolution out of range: {}", resolution));
        }
        Ok(CaptureFormat::new(resolution, self.pixel_format()?, self.fps))
    }

    /// Build the capture loop configuration
    pub fn to_capture_config(&self) -> Result<CaptureConfig, String> {
        Ok(CaptureConfig {
            device_path: PathBuf::from(&self.device),
            format: self.capture_format()?,
            buffer_count: self.buffer_count,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            retry_budget: self.retry_budget,
            min_frame_size: self.min_frame_size,
        })
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    /// Stored frames older than this are not served to snapshot requests
    pub snapshot_staleness_ms: u64,
    /// Longest a snapshot request waits for a frame
    pub snapshot_timeout_ms: u64,
    /// MJPEG clients get the previous frame again after this much silence
    pub stream_idle_timeout_ms: u64,
    /// Idle resends before an MJPEG stream is closed
    pub max_idle_keepalives: u32,
    /// Multipart boundary token
    pub boundary: String,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            snapshot_staleness_ms: 2000,
            snapshot_timeout_ms: 3000,
            stream_idle_timeout_ms: 5000,
            max_idle_keepalives: 6,
            boundary: "frame".to_string(),
        }
    }
}

impl StreamSettings {
    pub fn snapshot_staleness(&self) -> Duration {
        Duration::from_millis(self.snapshot_staleness_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn mjpeg_options(&self) -> MjpegOptions {
        MjpegOptions {
            boundary: self.boundary.clone(),
            idle_timeout: Duration::from_millis(self.stream_idle_timeout_ms),
            max_idle_keepalives: self.max_idle_keepalives,
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebSettings {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}
