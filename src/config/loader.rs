//! Configuration loading
//!
//! Precedence: built-in defaults, then an optional JSON file, then
//! overrides (command line flags, which fall back to environment
//! variables).

use std::path::Path;
use tracing::{debug, warn};

use super::AppConfig;
use crate::error::{AppError, Result};
use crate::stream::mjpeg::is_valid_boundary;

/// Values supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub device: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub fps: Option<u32>,
    pub buffer_count: Option<u32>,
    pub retry_budget: Option<u32>,
    pub start_on_boot: Option<bool>,
    pub bind_address: Option<String>,
    pub http_port: Option<u16>,
}

impl AppConfig {
    /// Read a JSON config file; missing sections take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        let capture = &mut self.capture;
        if let Some(device) = &overrides.device {
            capture.device = device.clone();
        }
        if let Some(width) = overrides.width {
            capture.width = width;
        }
        if let Some(height) = overrides.height {
            capture.height = height;
        }
        if let Some(format) = &overrides.format {
            capture.format = format.clone();
        }
        if let Some(fps) = overrides.fps {
            capture.fps = fps;
        }
        if let Some(count) = overrides.buffer_count {
            capture.buffer_count = count;
        }
        if let Some(budget) = overrides.retry_budget {
            capture.retry_budget = budget;
        }
        if let Some(start) = overrides.start_on_boot {
            capture.start_on_boot = start;
        }
        if let Some(addr) = &overrides.bind_address {
            self.web.bind_address = addr.clone();
        }
        if let Some(port) = overrides.http_port {
            self.web.http_port = port;
        }
    }

    /// Clamp out-of-range numbers and reject values that cannot work
    pub fn validate(&mut self) -> Result<()> {
        let defaults = AppConfig::default();

        let capture = &mut self.capture;
        if capture.buffer_count < 2 {
            warn!("buffer_count {} too small, using 2", capture.buffer_count);
            capture.buffer_count = 2;
        }
        if capture.fps == 0 {
            warn!("fps 0 is invalid, using 1");
            capture.fps = 1;
        }
        if capture.acquire_timeout_ms == 0 {
            capture.acquire_timeout_ms = defaults.capture.acquire_timeout_ms;
        }
        capture.capture_format().map_err(AppError::Config)?;

        let stream = &mut self.stream;
        if stream.snapshot_timeout_ms == 0 {
            stream.snapshot_timeout_ms = defaults.stream.snapshot_timeout_ms;
        }
        if stream.snapshot_staleness_ms == 0 {
            stream.snapshot_staleness_ms = defaults.stream.snapshot_staleness_ms;
        }
        if stream.stream_idle_timeout_ms == 0 {
            stream.stream_idle_timeout_ms = defaults.stream.stream_idle_timeout_ms;
        }
        if !is_valid_boundary(&stream.boundary) {
            return Err(AppError::Config(format!(
                "Invalid multipart boundary: {:?}",
                stream.boundary
            )));
        }

        self.web
            .bind_address
            .parse::<std::net::IpAddr>()
            .map_err(|_| AppError::Config(format!("Invalid bind address: {}", self.web.bind_address)))?;
        Ok(())
    }
}

/// Build the effective configuration
pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    config.apply(overrides);
    config.validate()?;
    Ok(config)
}
