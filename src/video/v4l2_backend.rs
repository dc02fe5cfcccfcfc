//! V4L2 memory-mapped capture backend
//!
//! Format negotiation goes through the high-level `v4l` device API; the
//! buffer queue is driven with raw `VIDIOC_*` ioctls so that every
//! enqueue and dequeue is visible to the buffer pool.

use std::io;
use std::mem;
use std::os::fd::BorrowedFd;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format};

use super::backend::{BackendFactory, CaptureBackend, Dequeued, ExclusiveRegistry, PathClaim};
use super::format::{CaptureFormat, PixelFormat, Resolution};

/// `V4L2_BUF_FLAG_ERROR`: the driver filled the buffer but the data is unreliable
const BUF_FLAG_ERROR: u32 = 0x0000_0040;

/// Translate a dequeued `v4l2_buffer`; flagged buffers report no payload
fn dequeued_from(buf: &v4l2_buffer) -> Dequeued {
    let bytes_used = if buf.flags & BUF_FLAG_ERROR != 0 {
        debug!("Buffer {} flagged as corrupt by the driver", buf.index);
        0
    } else {
        buf.bytesused as usize
    };
    Dequeued {
        index: buf.index as usize,
        bytes_used,
        sequence: buf.sequence,
    }
}

/// Opens `/dev/video*` nodes
#[derive(Debug, Default)]
pub struct V4l2Factory {
    registry: ExclusiveRegistry,
}

impl V4l2Factory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackendFactory for V4l2Factory {
    fn open(&self, path: &Path) -> io::Result<Box<dyn CaptureBackend>> {
        let claim = self.registry.claim(path)?;
        debug!("Opening video device: {:?}", path);
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} is not a single-planar capture device", caps.card),
            ));
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} does not support streaming I/O", caps.card),
            ));
        }
        info!("Opened {} ({}) at {:?}", caps.card, caps.driver, path);

        Ok(Box::new(V4l2Backend {
            path: path.to_path_buf(),
            device,
            mappings: Vec::new(),
            _claim: claim,
        }))
    }

    fn name(&self) -> &'static str {
        "v4l2"
    }
}

/// One mmap'd driver buffer
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

pub struct V4l2Backend {
    path: PathBuf,
    device: Device,
    mappings: Vec<Mapping>,
    _claim: PathClaim,
}

// SAFETY: the mappings are only dereferenced through `&self`/`&mut self`;
// the backend is owned by a single capture thread at a time.
unsafe impl Send for V4l2Backend {}

impl V4l2Backend {
    fn fd(&self) -> std::os::raw::c_int {
        self.device.handle().fd()
    }

    fn buf_type() -> u32 {
        BufType::VideoCapture as u32
    }

    fn reqbufs(&self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Self::buf_type(),
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )?;
        }
        Ok(req.count)
    }

    fn unmap_all(&mut self) {
        for mapping in self.mappings.drain(..) {
            if let Err(e) = unsafe { v4l2::munmap(mapping.ptr as *mut c_void, mapping.len) } {
                warn!("munmap failed on {:?}: {}", self.path, e);
            }
        }
    }

    /// Poll for readability; `Ok(false)` on timeout or signal interruption
    fn wait_ready(&self, timeout: Duration) -> io::Result<bool> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl CaptureBackend for V4l2Backend {
    fn set_format(&mut self, requested: &CaptureFormat) -> io::Result<CaptureFormat> {
        let fmt = Format::new(
            requested.width(),
            requested.height(),
            requested.pixel_format.to_fourcc(),
        );
        let actual = self.device.set_format(&fmt)?;
        let pixel_format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("driver selected unsupported fourcc {}", actual.fourcc),
            )
        })?;

        let fps = match self.device.set_params(&Parameters::with_fps(requested.fps)) {
            Ok(params) if params.interval.numerator > 0 => {
                params.interval.denominator / params.interval.numerator
            }
            Ok(_) => requested.fps,
            Err(e) => {
                warn!("Failed to set hardware FPS on {:?}: {}", self.path, e);
                requested.fps
            }
        };

        Ok(CaptureFormat::new(
            Resolution::new(actual.width, actual.height),
            pixel_format,
            fps.max(1),
        ))
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<Vec<usize>> {
        if !self.mappings.is_empty() {
            self.release_buffers()?;
        }
        let granted = self.reqbufs(count)?;

        let mut lengths = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let mut buf = v4l2_buffer {
                index,
                type_: Self::buf_type(),
                memory: Memory::Mmap as u32,
                ..unsafe { mem::zeroed() }
            };
            let mapped = unsafe {
                v4l2::ioctl(
                    self.fd(),
                    vidioc::VIDIOC_QUERYBUF,
                    &mut buf as *mut _ as *mut c_void,
                )
                .and_then(|_| {
                    v4l2::mmap(
                        ptr::null_mut(),
                        buf.length as usize,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED,
                        self.fd(),
                        buf.m.offset as libc::off_t,
                    )
                })
            };
            match mapped {
                Ok(ptr) => {
                    self.mappings.push(Mapping {
                        ptr: ptr as *mut u8,
                        len: buf.length as usize,
                    });
                    lengths.push(buf.length as usize);
                }
                Err(e) => {
                    // Leave the driver with no half-mapped allocation
                    let _ = self.release_buffers();
                    return Err(e);
                }
            }
        }
        Ok(lengths)
    }

    fn buffer(&self, index: usize) -> &[u8] {
        match self.mappings.get(index) {
            Some(m) => unsafe { slice::from_raw_parts(m.ptr, m.len) },
            None => &[],
        }
    }

    fn queue(&mut self, index: usize) -> io::Result<()> {
        let mut buf = v4l2_buffer {
            index: index as u32,
            type_: Self::buf_type(),
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_QBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        }
    }

    fn dequeue(&mut self, timeout: Duration) -> io::Result<Option<Dequeued>> {
        if !self.wait_ready(timeout)? {
            return Ok(None);
        }
        let mut buf = v4l2_buffer {
            type_: Self::buf_type(),
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        let result = unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_DQBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        };
        match result {
            Ok(()) => Ok(Some(dequeued_from(&buf))),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut typ = Self::buf_type();
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_STREAMON,
                &mut typ as *mut _ as *mut c_void,
            )
        }
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut typ = Self::buf_type();
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_STREAMOFF,
                &mut typ as *mut _ as *mut c_void,
            )
        }
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        self.unmap_all();
        self.reqbufs(0).map(|_| ())
    }
}

impl Drop for V4l2Backend {
    fn drop(&mut self) {
        if !self.mappings.is_empty() {
            if let Err(e) = self.stream_off() {
                debug!("Failed to stop capture stream: {}", e);
            }
            self.unmap_all();
        }
    }
}
