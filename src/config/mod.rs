//! Application configuration

mod loader;
mod schema;

pub use loader::{load, ConfigOverrides};
pub use schema::{AppConfig, CaptureSettings, StreamSettings, WebSettings};
