//! camstream - memory-mapped V4L2 capture with MJPEG and snapshot fan-out
//!
//! Frames are captured on a dedicated thread per device, copied out of
//! the device's mmap ring and handed to any number of HTTP clients
//! through latest-wins mailboxes.

pub mod config;
pub mod error;
pub mod state;
pub mod stream;
pub mod utils;
pub mod video;
pub mod web;

pub use error::{AppError, Result};
