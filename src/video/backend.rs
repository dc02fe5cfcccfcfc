//! Kernel seam for capture devices
//!
//! [`CaptureBackend`] is the minimal set of driver primitives the
//! [`CaptureDevice`](super::device::CaptureDevice) state machine needs. The
//! V4L2 implementation lives in [`super::v4l2_backend`], a synthetic one in
//! [`super::sim`].

use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::format::CaptureFormat;

/// A buffer returned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: usize,
    /// 0 when the driver flagged the payload as corrupt
    pub bytes_used: usize,
    pub sequence: u32,
}

/// Driver primitives for one opened device.
///
/// Errors are raw `io::Error`s; the device state machine maps them onto
/// the capture error taxonomy.
pub trait CaptureBackend: Send {
    /// Negotiate a format; returns what the driver actually applied
    fn set_format(&mut self, requested: &CaptureFormat) -> io::Result<CaptureFormat>;

    /// Request `count` buffers and map them; returns the mapped lengths
    fn request_buffers(&mut self, count: u32) -> io::Result<Vec<usize>>;

    /// Mapped memory of a buffer
    fn buffer(&self, index: usize) -> &[u8];

    fn queue(&mut self, index: usize) -> io::Result<()>;

    /// Wait up to `timeout` for a filled buffer; `Ok(None)` on timeout
    fn dequeue(&mut self, timeout: Duration) -> io::Result<Option<Dequeued>>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    /// Unmap all buffers and hand them back to the driver
    fn release_buffers(&mut self) -> io::Result<()>;
}

/// Opens backends by device path
pub trait BackendFactory: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn CaptureBackend>>;

    /// Short name for logs and status
    fn name(&self) -> &'static str;
}

/// Set of device paths currently held by this process.
///
/// Each factory owns one; a path can be claimed once until the returned
/// [`PathClaim`] is dropped.
#[derive(Debug, Clone, Default)]
pub struct ExclusiveRegistry {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ExclusiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path`, failing with `EBUSY` if it is already held
    pub fn claim(&self, path: &Path) -> io::Result<PathClaim> {
        let mut held = self.held.lock();
        if !held.insert(path.to_path_buf()) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(PathClaim {
            path: path.to_path_buf(),
            registry: self.held.clone(),
        })
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.held.lock().contains(path)
    }
}

/// Exclusive hold on a device path, released on drop
#[derive(Debug)]
pub struct PathClaim {
    path: PathBuf,
    registry: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PathClaim {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.path);
    }
}
