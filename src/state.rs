use std::sync::Arc;

use crate::config::AppConfig;
use crate::video::CaptureEngine;

/// Application-wide state shared across handlers
///
/// All capture control goes through `engine`; frames are read through
/// `engine.distributor()`.
pub struct AppState {
    /// Effective configuration (read-only after start-up)
    pub config: AppConfig,
    /// Capture engine for the configured device
    pub engine: Arc<CaptureEngine>,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<CaptureEngine>) -> Arc<Self> {
        Arc::new(Self { config, engine })
    }
}
