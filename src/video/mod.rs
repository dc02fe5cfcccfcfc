//! Video capture
//!
//! Memory-mapped capture from V4L2 devices: the device state machine, its
//! buffer pool, the capture loop and the engine that controls it.

pub mod backend;
pub mod buffer_pool;
pub mod capture;
pub mod device;
pub mod engine;
pub mod error;
pub mod format;
pub mod frame;
pub mod sim;
pub mod v4l2_backend;

pub use backend::{BackendFactory, CaptureBackend};
pub use buffer_pool::{AcquiredBuffer, BufferState, FrameBufferPool, PoolCounts};
pub use capture::CaptureConfig;
pub use device::{CaptureDevice, DeviceState};
pub use engine::{CaptureEngine, Command, EngineState, EngineStatus};
pub use error::{CaptureError, CaptureResult};
pub use format::{CaptureFormat, PixelFormat, Resolution};
pub use frame::Frame;
pub use sim::{SimConfig, SimControl, SimFactory};
pub use v4l2_backend::V4l2Factory;
