//! Synthetic capture backend
//!
//! Behaves like a well-mannered V4L2 driver: formats are clamped, buffers
//! must be queued before they can be dequeued, and dequeue honours the
//! timeout. A [`SimControl`] handle lets callers script failures (a lost
//! device, failing dequeues or re-queues) and cap the number of frames.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::backend::{BackendFactory, CaptureBackend, Dequeued, ExclusiveRegistry, PathClaim};
use super::format::{CaptureFormat, PixelFormat, Resolution};

/// Static properties of the simulated device
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Encodings the device can produce; the first one is its fallback
    pub formats: Vec<PixelFormat>,
    pub max_resolution: Resolution,
    pub max_fps: u32,
    pub max_buffers: u32,
    /// Size of each synthetic MJPEG payload
    pub jpeg_size: usize,
    /// Emit frames at the negotiated fps instead of as fast as possible
    pub paced: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            formats: vec![PixelFormat::Mjpeg, PixelFormat::Yuyv],
            max_resolution: Resolution::HD1080,
            max_fps: 60,
            max_buffers: 8,
            jpeg_size: 2048,
            paced: true,
        }
    }
}

#[derive(Debug, Default)]
struct SimShared {
    missing: AtomicBool,
    fail_dequeues: AtomicU32,
    fail_queues: AtomicU32,
    fail_stream_on: AtomicBool,
    corrupt_frames: AtomicU32,
    /// Frames left before the device goes quiet; `u64::MAX` for unlimited
    frame_budget: AtomicU64,
    emitted: AtomicU64,
}

/// Runtime knobs shared by the factory and every backend it opens
#[derive(Debug, Clone)]
pub struct SimControl {
    shared: Arc<SimShared>,
}

impl SimControl {
    /// Make subsequent opens fail as if the device node vanished
    pub fn set_missing(&self, missing: bool) {
        self.shared.missing.store(missing, Ordering::SeqCst);
    }

    /// Fail the next `n` dequeues with `EIO`
    pub fn fail_next_dequeues(&self, n: u32) {
        self.shared.fail_dequeues.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` re-queues with `EINVAL`
    pub fn fail_next_queues(&self, n: u32) {
        self.shared.fail_queues.store(n, Ordering::SeqCst);
    }

    /// Deliver the next `n` buffers flagged as corrupt, with no payload
    pub fn corrupt_next_frames(&self, n: u32) {
        self.shared.corrupt_frames.store(n, Ordering::SeqCst);
    }

    pub fn fail_stream_on(&self, fail: bool) {
        self.shared.fail_stream_on.store(fail, Ordering::SeqCst);
    }

    /// Produce exactly `n` more frames, then time out on every dequeue
    pub fn limit_frames(&self, n: u64) {
        self.shared.frame_budget.store(n, Ordering::SeqCst);
    }

    /// Frames delivered by all backends so far
    pub fn frames_emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::SeqCst)
    }
}

/// Decrement a failure counter, returning whether a failure is due
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct SimFactory {
    config: SimConfig,
    registry: ExclusiveRegistry,
    shared: Arc<SimShared>,
}

impl SimFactory {
    pub fn new(config: SimConfig) -> Self {
        let shared = Arc::new(SimShared::default());
        shared.frame_budget.store(u64::MAX, Ordering::SeqCst);
        Self {
            config,
            registry: ExclusiveRegistry::new(),
            shared,
        }
    }

    pub fn control(&self) -> SimControl {
        SimControl {
            shared: self.shared.clone(),
        }
    }
}

impl BackendFactory for SimFactory {
    fn open(&self, path: &Path) -> io::Result<Box<dyn CaptureBackend>> {
        if self.shared.missing.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let claim = self.registry.claim(path)?;
        debug!("Opened simulated device {:?}", path);
        Ok(Box::new(SimBackend {
            path: path.to_path_buf(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            format: CaptureFormat::default(),
            buffers: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
            next_due: Instant::now(),
            _claim: claim,
        }))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

pub struct SimBackend {
    path: PathBuf,
    config: SimConfig,
    shared: Arc<SimShared>,
    format: CaptureFormat,
    buffers: Vec<Vec<u8>>,
    queued: VecDeque<usize>,
    streaming: bool,
    sequence: u32,
    next_due: Instant,
    _claim: PathClaim,
}

impl SimBackend {
    fn buffer_len(&self) -> usize {
        self.format
            .pixel_format
            .frame_size(self.format.resolution)
            .unwrap_or_else(|| self.config.jpeg_size.max(self.format.resolution.pixels() as usize / 8))
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.format.fps.max(1)
    }

    /// Fill buffer `index` with a synthetic image; returns bytes used
    fn render(&mut self, index: usize) -> usize {
        let pixel_format = self.format.pixel_format;
        let jpeg_size = self.config.jpeg_size;
        let seq = self.sequence.to_be_bytes();
        let buf = &mut self.buffers[index];
        match pixel_format {
            PixelFormat::Mjpeg => {
                let used = jpeg_size.clamp(8, buf.len());
                buf[..used].fill(0x55);
                buf[0] = 0xFF;
                buf[1] = 0xD8;
                buf[2..6].copy_from_slice(&seq);
                buf[used - 2] = 0xFF;
                buf[used - 1] = 0xD9;
                used
            }
            PixelFormat::Yuyv | PixelFormat::Raw => {
                let shade = (self.sequence % 256) as u8;
                buf.fill(shade);
                buf.len()
            }
        }
    }
}

fn einval(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

impl CaptureBackend for SimBackend {
    fn set_format(&mut self, requested: &CaptureFormat) -> io::Result<CaptureFormat> {
        if self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let pixel_format = if self.config.formats.contains(&requested.pixel_format) {
            requested.pixel_format
        } else {
            // Drivers substitute their own format rather than failing
            self.config.formats.first().copied().unwrap_or(PixelFormat::Mjpeg)
        };
        let max = self.config.max_resolution;
        let resolution = Resolution::new(
            requested.width().clamp(16, max.width),
            requested.height().clamp(16, max.height),
        );
        self.format = CaptureFormat::new(
            resolution,
            pixel_format,
            requested.fps.clamp(1, self.config.max_fps),
        );
        Ok(self.format)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<Vec<usize>> {
        if self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        let granted = count.min(self.config.max_buffers) as usize;
        let len = self.buffer_len();
        self.buffers = (0..granted).map(|_| vec![0u8; len]).collect();
        self.queued.clear();
        Ok(vec![len; granted])
    }

    fn buffer(&self, index: usize) -> &[u8] {
        self.buffers.get(index).map(|b| b.as_slice()).unwrap_or(&[])
    }

    fn queue(&mut self, index: usize) -> io::Result<()> {
        if take_failure(&self.shared.fail_queues) {
            return Err(einval("simulated queue failure"));
        }
        if index >= self.buffers.len() || self.queued.contains(&index) {
            return Err(einval("buffer not owned by the application"));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self, timeout: Duration) -> io::Result<Option<Dequeued>> {
        if !self.streaming {
            return Err(einval("not streaming"));
        }
        if take_failure(&self.shared.fail_dequeues) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }

        let budget = self.shared.frame_budget.load(Ordering::SeqCst);
        if budget == 0 || self.queued.is_empty() {
            thread::sleep(timeout);
            return Ok(None);
        }

        if self.config.paced {
            let now = Instant::now();
            if self.next_due > now {
                let wait = self.next_due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(None);
                }
                thread::sleep(wait);
            }
            self.next_due = Instant::now() + self.frame_interval();
        }

        let Some(index) = self.queued.pop_front() else {
            return Ok(None);
        };
        let bytes_used = if take_failure(&self.shared.corrupt_frames) {
            0
        } else {
            self.render(index)
        };
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        if budget != u64::MAX {
            self.shared.frame_budget.fetch_sub(1, Ordering::SeqCst);
        }
        self.shared.emitted.fetch_add(1, Ordering::SeqCst);

        Ok(Some(Dequeued {
            index,
            bytes_used,
            sequence,
        }))
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.shared.fail_stream_on.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if self.queued.is_empty() {
            return Err(einval("no buffers queued"));
        }
        self.streaming = true;
        self.next_due = Instant::now();
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.streaming = false;
        self.queued.clear();
        Ok(())
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        if self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        debug!("Released simulated buffers on {:?}", self.path);
        self.buffers.clear();
        self.queued.clear();
        Ok(())
    }
}
