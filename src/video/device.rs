//! Capture device state machine
//!
//! `Closed -> Opened -> Configured -> Streaming -> Configured -> Closed`.
//! The device owns the backend handle, the negotiated format and the
//! buffer pool. Operations invoked out of order fail with
//! [`CaptureError::InvalidState`]; `stop` and `close` are no-ops where they
//! do not apply.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{BackendFactory, CaptureBackend};
use super::buffer_pool::{AcquiredBuffer, FrameBufferPool, PoolCounts};
use super::error::{is_busy, is_device_lost, CaptureError, CaptureResult};
use super::format::CaptureFormat;

/// Number of buffers requested when the caller has no preference
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

const BUSY_RETRIES: u32 = 5;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Closed,
    Opened,
    Configured,
    Streaming,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Closed => "closed",
            DeviceState::Opened => "opened",
            DeviceState::Configured => "configured",
            DeviceState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

pub struct CaptureDevice {
    factory: Arc<dyn BackendFactory>,
    path: Option<PathBuf>,
    backend: Option<Box<dyn CaptureBackend>>,
    state: DeviceState,
    format: Option<CaptureFormat>,
    pool: Option<FrameBufferPool>,
    /// Bumped on every allocation so stale handles are rejected
    generation: u64,
}

impl CaptureDevice {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            path: None,
            backend: None,
            state: DeviceState::Closed,
            format: None,
            pool: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Negotiated format, once configured
    pub fn format(&self) -> Option<CaptureFormat> {
        self.format
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn pool_counts(&self) -> Option<PoolCounts> {
        self.pool.as_ref().map(|p| p.counts())
    }

    /// Buffers that can still cycle through the device
    pub fn active_buffers(&self) -> usize {
        self.pool.as_ref().map(|p| p.active()).unwrap_or(0)
    }

    fn device_name(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    fn expect_state(&self, allowed: &[DeviceState], op: &str) -> CaptureResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CaptureError::InvalidState(format!(
                "{} not allowed while {}",
                op, self.state
            )))
        }
    }

    /// Acquire the device handle, retrying briefly if it is busy
    pub fn open(&mut self, path: impl AsRef<Path>) -> CaptureResult<()> {
        self.expect_state(&[DeviceState::Closed], "open")?;
        let path = path.as_ref();
        let device = path.display().to_string();

        let mut attempt = 0;
        let backend = loop {
            match self.factory.open(path) {
                Ok(backend) => break backend,
                Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRIES => {
                    attempt += 1;
                    warn!(
                        "Device {} busy on attempt {}/{}, retrying in {}ms...",
                        device,
                        attempt,
                        BUSY_RETRIES,
                        BUSY_RETRY_DELAY.as_millis()
                    );
                    std::thread::sleep(BUSY_RETRY_DELAY);
                }
                Err(e) => return Err(CaptureError::unavailable(device, e)),
            }
        };

        info!("Opened capture device {} ({})", device, self.factory.name());
        self.backend = Some(backend);
        self.path = Some(path.to_path_buf());
        self.state = DeviceState::Opened;
        Ok(())
    }

    /// Negotiate `requested`; returns the format the driver applied.
    ///
    /// Resolution and fps may be clamped. A different pixel encoding is
    /// rejected since the engine never transcodes.
    pub fn configure(&mut self, requested: &CaptureFormat) -> CaptureResult<CaptureFormat> {
        self.expect_state(&[DeviceState::Opened, DeviceState::Configured], "configure")?;
        if !requested.resolution.is_valid() {
            return Err(CaptureError::FormatUnsupported(format!(
                "resolution {} out of range",
                requested.resolution
            )));
        }
        if requested.fps == 0 {
            return Err(CaptureError::FormatUnsupported("fps must be positive".into()));
        }
        // Any previous negotiation is void from here on
        self.drop_pool();
        self.format = None;
        self.state = DeviceState::Opened;

        let device = self.device_name();
        let backend = self.backend_mut()?;
        let actual = backend.set_format(requested).map_err(|e| {
            if is_busy(&e) || is_device_lost(&e) {
                CaptureError::unavailable(device, e)
            } else {
                CaptureError::FormatUnsupported(format!("{}: {}", requested, e))
            }
        })?;

        if actual.pixel_format != requested.pixel_format {
            return Err(CaptureError::FormatUnsupported(format!(
                "requested {}, device offers {}",
                requested.pixel_format, actual.pixel_format
            )));
        }
        if actual.resolution != requested.resolution || actual.fps != requested.fps {
            warn!("Requested {}, negotiated {}", requested, actual);
        }

        self.format = Some(actual);
        self.state = DeviceState::Configured;
        Ok(actual)
    }

    /// Map `count` device buffers; returns how many were granted
    pub fn allocate_buffers(&mut self, count: u32) -> CaptureResult<usize> {
        self.expect_state(&[DeviceState::Configured], "allocate_buffers")?;
        self.drop_pool();

        let lengths = self
            .backend_mut()?
            .request_buffers(count)
            .map_err(|e| CaptureError::AllocationFailed(e.to_string()))?;

        self.generation += 1;
        match FrameBufferPool::new(&lengths, self.generation) {
            Ok(pool) => {
                debug!("Allocated {} of {} requested buffers", pool.len(), count);
                let granted = pool.len();
                self.pool = Some(pool);
                Ok(granted)
            }
            Err(e) => {
                if let Err(release) = self.backend_mut()?.release_buffers() {
                    warn!("Failed to release partial allocation: {}", release);
                }
                Err(e)
            }
        }
    }

    /// Enqueue every idle buffer and switch the stream on
    pub fn start(&mut self) -> CaptureResult<()> {
        self.expect_state(&[DeviceState::Configured], "start")?;
        let (Some(backend), Some(pool)) = (self.backend.as_mut(), self.pool.as_mut()) else {
            return Err(CaptureError::InvalidState(
                "start requires allocated buffers".into(),
            ));
        };

        let result = (|| {
            for index in pool.idle_indices() {
                backend
                    .queue(index)
                    .map_err(|e| CaptureError::StreamStartFailed(format!("QBUF {}: {}", index, e)))?;
                pool.mark_queued(index)?;
            }
            if pool.counts().with_device == 0 {
                return Err(CaptureError::StreamStartFailed("no usable buffers".into()));
            }
            backend
                .stream_on()
                .map_err(|e| CaptureError::StreamStartFailed(e.to_string()))
        })();

        if let Err(e) = result {
            // STREAMOFF also takes back anything already queued
            let _ = backend.stream_off();
            pool.reclaim_all();
            return Err(e);
        }

        self.state = DeviceState::Streaming;
        Ok(())
    }

    /// Wait up to `timeout` for a filled buffer
    pub fn acquire(&mut self, timeout: Duration) -> CaptureResult<AcquiredBuffer> {
        self.expect_state(&[DeviceState::Streaming], "acquire")?;
        let (Some(backend), Some(pool)) = (self.backend.as_mut(), self.pool.as_mut()) else {
            return Err(CaptureError::InvalidState("no buffers".into()));
        };
        match backend.dequeue(timeout) {
            Ok(Some(d)) => pool.mark_dequeued(d.index, d.bytes_used, d.sequence),
            Ok(None) => Err(CaptureError::AcquireTimeout),
            Err(e) => Err(CaptureError::AcquireFailed(e.to_string())),
        }
    }

    /// Exactly the valid bytes of an acquired buffer
    pub fn buffer_data(&self, buffer: &AcquiredBuffer) -> CaptureResult<&[u8]> {
        let (Some(backend), Some(pool)) = (self.backend.as_ref(), self.pool.as_ref()) else {
            return Err(CaptureError::InvalidState("no buffers".into()));
        };
        pool.check_handle(buffer)?;
        let mapped = backend.buffer(buffer.index());
        Ok(&mapped[..buffer.bytes_used().min(mapped.len())])
    }

    /// Hand a buffer back to the device.
    ///
    /// On failure the slot is retired and the pool shrinks by one.
    pub fn release(&mut self, buffer: AcquiredBuffer) -> CaptureResult<()> {
        let (Some(backend), Some(pool)) = (self.backend.as_mut(), self.pool.as_mut()) else {
            return Err(CaptureError::InvalidState("no buffers".into()));
        };
        pool.check_handle(&buffer)?;

        if self.state != DeviceState::Streaming {
            pool.mark_idle(buffer);
            return Ok(());
        }

        let index = buffer.index();
        match backend.queue(index) {
            Ok(()) => pool.mark_released(buffer),
            Err(e) => {
                pool.retire(buffer);
                warn!(
                    "Retired buffer {} after failed re-queue, {} left",
                    index,
                    pool.active()
                );
                Err(CaptureError::ReleaseFailed {
                    index,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stream off; every queued buffer returns to the application
    pub fn stop(&mut self) {
        if self.state != DeviceState::Streaming {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.stream_off() {
                warn!("STREAMOFF failed on {}: {}", self.device_name(), e);
            }
        }
        if let Some(pool) = self.pool.as_mut() {
            pool.reclaim_all();
        }
        self.state = DeviceState::Configured;
        debug!("Capture stopped");
    }

    /// Unmap, release the kernel buffers, then drop the handle
    pub fn close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }
        self.stop();
        self.drop_pool();
        self.backend = None;
        self.format = None;
        self.state = DeviceState::Closed;
        if let Some(path) = self.path.take() {
            info!("Closed capture device {}", path.display());
        }
    }

    fn drop_pool(&mut self) {
        if self.pool.take().is_some() {
            if let Some(backend) = self.backend.as_mut() {
                if let Err(e) = backend.release_buffers() {
                    warn!("Failed to release buffers: {}", e);
                }
            }
        }
    }

    fn backend_mut(&mut self) -> CaptureResult<&mut Box<dyn CaptureBackend>> {
        self.backend
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidState("device not open".into()))
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{PixelFormat, Resolution};
    use crate::video::sim::{SimConfig, SimControl, SimFactory};

    const PATH: &str = "/dev/video-sim";

    fn sim(config: SimConfig) -> (CaptureDevice, SimControl) {
        let factory = SimFactory::new(config);
        let control = factory.control();
        (CaptureDevice::new(Arc::new(factory)), control)
    }

    fn unpaced() -> (CaptureDevice, SimControl) {
        sim(SimConfig {
            paced: false,
            ..Default::default()
        })
    }

    fn streaming() -> (CaptureDevice, SimControl) {
        let (mut dev, control) = unpaced();
        dev.open(PATH).unwrap();
        dev.configure(&CaptureFormat::default()).unwrap();
        dev.allocate_buffers(DEFAULT_BUFFER_COUNT).unwrap();
        dev.start().unwrap();
        (dev, control)
    }

    #[test]
    fn test_operations_out_of_order() {
        let (mut dev, _) = unpaced();
        assert!(matches!(
            dev.configure(&CaptureFormat::default()),
            Err(CaptureError::InvalidState(_))
        ));
        dev.open(PATH).unwrap();
        assert!(matches!(dev.start(), Err(CaptureError::InvalidState(_))));
        assert!(matches!(
            dev.acquire(Duration::from_millis(1)),
            Err(CaptureError::InvalidState(_))
        ));
        dev.configure(&CaptureFormat::default()).unwrap();
        // Configured but no buffers yet
        assert!(matches!(dev.start(), Err(CaptureError::InvalidState(_))));
    }

    #[test]
    fn test_full_lifecycle() {
        let (mut dev, _) = streaming();
        assert_eq!(dev.state(), DeviceState::Streaming);

        let buf = dev.acquire(Duration::from_millis(50)).unwrap();
        let data = dev.buffer_data(&buf).unwrap();
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        dev.release(buf).unwrap();

        dev.stop();
        assert_eq!(dev.state(), DeviceState::Configured);
        let counts = dev.pool_counts().unwrap();
        assert_eq!(counts.with_device, 0);
        assert_eq!(counts.held, 0);

        dev.start().unwrap();
        dev.close();
        dev.close();
        assert_eq!(dev.state(), DeviceState::Closed);
        assert!(dev.format().is_none());
    }

    #[test]
    fn test_stop_is_noop_when_not_streaming() {
        let (mut dev, _) = unpaced();
        dev.stop();
        assert_eq!(dev.state(), DeviceState::Closed);
        dev.open(PATH).unwrap();
        dev.stop();
        assert_eq!(dev.state(), DeviceState::Opened);
    }

    #[test]
    fn test_exclusive_open() {
        let factory: Arc<dyn BackendFactory> = Arc::new(SimFactory::new(SimConfig::default()));
        let mut first = CaptureDevice::new(factory.clone());
        let mut second = CaptureDevice::new(factory);
        first.open(PATH).unwrap();
        assert!(matches!(
            second.open(PATH),
            Err(CaptureError::DeviceUnavailable { .. })
        ));
        first.close();
        second.open(PATH).unwrap();
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let (mut dev, control) = unpaced();
        control.set_missing(true);
        assert!(matches!(
            dev.open(PATH),
            Err(CaptureError::DeviceUnavailable { .. })
        ));
        assert_eq!(dev.state(), DeviceState::Closed);
    }

    #[test]
    fn test_encoding_mismatch_is_unsupported() {
        let (mut dev, _) = unpaced();
        dev.open(PATH).unwrap();
        let raw = CaptureFormat::new(Resolution::VGA, PixelFormat::Raw, 30);
        assert!(matches!(
            dev.configure(&raw),
            Err(CaptureError::FormatUnsupported(_))
        ));
        assert_eq!(dev.state(), DeviceState::Opened);
    }

    #[test]
    fn test_failed_reconfigure_leaves_device_opened() {
        let (mut dev, _) = unpaced();
        dev.open(PATH).unwrap();
        dev.configure(&CaptureFormat::default()).unwrap();
        dev.allocate_buffers(DEFAULT_BUFFER_COUNT).unwrap();
        assert_eq!(dev.state(), DeviceState::Configured);

        let raw = CaptureFormat::new(Resolution::VGA, PixelFormat::Raw, 30);
        assert!(matches!(
            dev.configure(&raw),
            Err(CaptureError::FormatUnsupported(_))
        ));
        assert_eq!(dev.state(), DeviceState::Opened);
        assert!(dev.format().is_none());
        assert!(dev.pool_counts().is_none());
        assert!(matches!(
            dev.allocate_buffers(DEFAULT_BUFFER_COUNT),
            Err(CaptureError::InvalidState(_))
        ));

        // A good format recovers
        dev.configure(&CaptureFormat::default()).unwrap();
        assert_eq!(dev.state(), DeviceState::Configured);
    }

    #[test]
    fn test_negotiated_format_is_clamped() {
        let (mut dev, _) = sim(SimConfig {
            max_resolution: Resolution::HD720,
            max_fps: 15,
            ..Default::default()
        });
        dev.open(PATH).unwrap();
        let actual = dev
            .configure(&CaptureFormat::new(Resolution::HD1080, PixelFormat::Mjpeg, 30))
            .unwrap();
        assert_eq!(actual.resolution, Resolution::HD720);
        assert_eq!(actual.fps, 15);
        assert_eq!(dev.format(), Some(actual));
    }

    #[test]
    fn test_too_few_buffers() {
        let (mut dev, _) = sim(SimConfig {
            max_buffers: 1,
            ..Default::default()
        });
        dev.open(PATH).unwrap();
        dev.configure(&CaptureFormat::default()).unwrap();
        assert!(matches!(
            dev.allocate_buffers(4),
            Err(CaptureError::AllocationFailed(_))
        ));
        assert!(dev.pool_counts().is_none());
    }

    #[test]
    fn test_stream_start_failure_reclaims() {
        let (mut dev, control) = unpaced();
        dev.open(PATH).unwrap();
        dev.configure(&CaptureFormat::default()).unwrap();
        dev.allocate_buffers(4).unwrap();
        control.fail_stream_on(true);
        assert!(matches!(
            dev.start(),
            Err(CaptureError::StreamStartFailed(_))
        ));
        assert_eq!(dev.state(), DeviceState::Configured);
        assert_eq!(dev.pool_counts().unwrap().with_device, 0);
    }

    #[test]
    fn test_release_failure_retires_slot() {
        let (mut dev, control) = streaming();
        let buf = dev.acquire(Duration::from_millis(50)).unwrap();
        control.fail_next_queues(1);
        assert!(matches!(
            dev.release(buf),
            Err(CaptureError::ReleaseFailed { .. })
        ));
        assert_eq!(dev.active_buffers(), 3);
        let counts = dev.pool_counts().unwrap();
        assert_eq!(counts.retired, 1);
        assert!(counts.is_conserved());
    }

    #[test]
    fn test_acquire_timeout_and_failure() {
        let (mut dev, control) = streaming();
        control.limit_frames(0);
        assert_eq!(
            dev.acquire(Duration::from_millis(5)).unwrap_err(),
            CaptureError::AcquireTimeout
        );
        control.fail_next_dequeues(1);
        assert!(matches!(
            dev.acquire(Duration::from_millis(5)),
            Err(CaptureError::AcquireFailed(_))
        ));
    }

    #[test]
    fn test_pool_conserved_while_streaming() {
        let (mut dev, _) = streaming();
        for _ in 0..50 {
            let a = dev.acquire(Duration::from_millis(50)).unwrap();
            let b = dev.acquire(Duration::from_millis(50)).unwrap();
            let counts = dev.pool_counts().unwrap();
            assert!(counts.is_conserved());
            assert_eq!(counts.held, 2);
            dev.release(a).unwrap();
            dev.release(b).unwrap();
            assert_eq!(dev.pool_counts().unwrap().with_device, 4);
        }
    }
}
