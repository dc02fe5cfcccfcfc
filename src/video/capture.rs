//! Capture loop
//!
//! Runs on a dedicated OS thread and is the only code that touches the
//! [`CaptureDevice`]. Control requests arrive over the engine command
//! channel and are drained between acquisitions; while not streaming the
//! loop blocks on the channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use super::device::{CaptureDevice, DeviceState, DEFAULT_BUFFER_COUNT};
use super::engine::{Command, EngineState, EngineStatus};
use super::error::{CaptureError, CaptureResult};
use super::format::{CaptureFormat, PixelFormat};
use super::frame::Frame;
use crate::stream::FrameDistributor;
use crate::utils::LogThrottler;

/// Default wait for one filled buffer
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
/// Consecutive acquire failures tolerated before the device is declared lost
pub const DEFAULT_RETRY_BUDGET: u32 = 3;
/// MJPEG payloads smaller than this are dropped as corrupt
pub const MIN_FRAME_SIZE: usize = 128;

/// Capture loop configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device_path: PathBuf,
    /// Format used when a start request does not name one
    pub format: CaptureFormat,
    pub buffer_count: u32,
    pub acquire_timeout: Duration,
    pub retry_budget: u32,
    pub min_frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            format: CaptureFormat::default(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            min_frame_size: MIN_FRAME_SIZE,
        }
    }
}

impl CaptureConfig {
    pub fn for_device(path: impl AsRef<Path>) -> Self {
        Self {
            device_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: CaptureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }
}

pub(crate) struct CaptureLoop {
    config: CaptureConfig,
    backend_name: &'static str,
    device: CaptureDevice,
    distributor: Arc<FrameDistributor>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<EngineState>,
    /// Format the current configuration was negotiated from
    requested: Option<CaptureFormat>,
    sequence: u64,
    frames_produced: u64,
    frames_dropped: u64,
    consecutive_failures: u32,
    faulted: bool,
    last_error: Option<CaptureError>,
    throttler: LogThrottler,
}

impl CaptureLoop {
    pub(crate) fn new(
        config: CaptureConfig,
        device: CaptureDevice,
        backend_name: &'static str,
        distributor: Arc<FrameDistributor>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<EngineState>,
    ) -> Self {
        Self {
            config,
            backend_name,
            device,
            distributor,
            commands,
            state_tx,
            requested: None,
            sequence: 0,
            frames_produced: 0,
            frames_dropped: 0,
            consecutive_failures: 0,
            faulted: false,
            last_error: None,
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub(crate) fn run(mut self) {
        info!("Capture loop started for {}", self.config.device_path.display());
        loop {
            if self.device.state() == DeviceState::Streaming {
                match self.commands.try_recv() {
                    Ok(cmd) => {
                        if !self.handle(cmd) {
                            break;
                        }
                        continue;
                    }
                    Err(TryRecvError::Empty) => self.capture_once(),
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match self.commands.blocking_recv() {
                    Some(cmd) => {
                        if !self.handle(cmd) {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        self.teardown();
        info!("Capture loop exited");
    }

    /// Returns false when the loop should exit
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start { format, reply } => {
                let result = self.start(format);
                self.publish_state();
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop();
                self.publish_state();
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                self.teardown();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return false;
            }
        }
        true
    }

    fn start(&mut self, format: Option<CaptureFormat>) -> CaptureResult<CaptureFormat> {
        let requested = format
            .or(self.requested)
            .unwrap_or(self.config.format);
        let same_format = self.requested == Some(requested);

        match self.device.state() {
            DeviceState::Streaming if same_format => {
                return self
                    .device
                    .format()
                    .ok_or_else(|| CaptureError::InvalidState("streaming without a format".into()));
            }
            DeviceState::Streaming => {
                info!("Capture format change requested: {}", requested);
                self.device.stop();
                self.publish_state();
                self.distributor.terminate_all();
            }
            DeviceState::Configured if same_format && !self.faulted => {
                if let Some(negotiated) = self.device.format() {
                    match self.device.start() {
                        Ok(()) => {
                            info!("Capture restarted: {}", negotiated);
                            self.consecutive_failures = 0;
                            return Ok(negotiated);
                        }
                        Err(e) => {
                            warn!("Restart failed, reopening device: {}", e);
                        }
                    }
                }
            }
            _ => {}
        }

        match self.open_and_start(&requested) {
            Ok(negotiated) => {
                self.requested = Some(requested);
                info!(
                    "Capture started on {}: {}",
                    self.config.device_path.display(),
                    negotiated
                );
                Ok(negotiated)
            }
            Err(e) => {
                error!("Failed to start capture: {}", e);
                self.device.close();
                self.requested = None;
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Full bring-up from a closed device. Sequence numbering restarts.
    fn open_and_start(&mut self, requested: &CaptureFormat) -> CaptureResult<CaptureFormat> {
        self.device.close();
        self.sequence = 0;
        self.frames_produced = 0;
        self.frames_dropped = 0;
        self.consecutive_failures = 0;
        self.faulted = false;
        self.last_error = None;
        self.throttler.clear_all();

        self.device.open(&self.config.device_path)?;
        let negotiated = self.device.configure(requested)?;
        self.device.allocate_buffers(self.config.buffer_count)?;
        self.device.start()?;
        Ok(negotiated)
    }

    // State is published before subscribers are terminated, so a client
    // that subscribes after the terminate always observes non-streaming.
    fn stop(&mut self) {
        if self.device.state() == DeviceState::Streaming {
            self.device.stop();
            info!("Capture stopped after {} frames", self.frames_produced);
        }
        self.publish_state();
        self.distributor.terminate_all();
    }

    fn teardown(&mut self) {
        self.device.stop();
        self.device.close();
        self.publish_state();
        self.distributor.terminate_all();
    }

    /// One acquire -> copy -> release -> publish cycle
    fn capture_once(&mut self) {
        let buffer = match self.device.acquire(self.config.acquire_timeout) {
            Ok(buffer) => buffer,
            Err(e) if e.is_recoverable() => {
                trace!("Capture timeout");
                return;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if let Some(suppressed) = self.throttler.should_log("acquire_failed") {
                    warn!(
                        "Capture error ({}/{}): {} [{} similar suppressed]",
                        self.consecutive_failures, self.config.retry_budget, e, suppressed
                    );
                }
                if self.consecutive_failures > self.config.retry_budget {
                    self.fault(e);
                }
                return;
            }
        };
        self.consecutive_failures = 0;

        let format = self.device.format().unwrap_or(self.config.format);
        let frame = match self.device.buffer_data(&buffer) {
            Ok(data) if self.is_undersized(format.pixel_format, data.len()) => {
                self.frames_dropped += 1;
                debug!("Dropping undersized frame ({} bytes)", data.len());
                None
            }
            Ok(data) => Some(Frame::copy_from_slice(data, &format, self.sequence + 1)),
            Err(e) => {
                warn!("Failed to read buffer {}: {}", buffer.index(), e);
                None
            }
        };

        // Give the buffer back before anyone sees the copy
        if let Err(e) = self.device.release(buffer) {
            if let Some(suppressed) = self.throttler.should_log("release_failed") {
                warn!("{} [{} similar suppressed]", e, suppressed);
            }
            if self.device.active_buffers() == 0 {
                self.fault(e);
                return;
            }
        }

        if let Some(frame) = frame {
            self.sequence = frame.sequence;
            self.frames_produced += 1;
            self.distributor.publish(frame);
        }
    }

    fn is_undersized(&self, format: PixelFormat, len: usize) -> bool {
        match format {
            PixelFormat::Mjpeg => len < self.config.min_frame_size,
            _ => len == 0,
        }
    }

    /// Device loss: tear down and wait for an explicit start
    fn fault(&mut self, cause: CaptureError) {
        error!(
            "Capture device {} lost after {} consecutive failures: {}",
            self.config.device_path.display(),
            self.consecutive_failures,
            cause
        );
        self.device.stop();
        self.device.close();
        self.faulted = true;
        self.requested = None;
        self.last_error = Some(cause);
        self.publish_state();
        self.distributor.terminate_all();
    }

    fn engine_state(&self) -> EngineState {
        if self.faulted {
            return EngineState::Faulted;
        }
        match self.device.state() {
            DeviceState::Closed => EngineState::Closed,
            DeviceState::Opened => EngineState::Opened,
            DeviceState::Configured => EngineState::Configured,
            DeviceState::Streaming => EngineState::Streaming,
        }
    }

    fn publish_state(&self) {
        let state = self.engine_state();
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                debug!("Engine state: {:?} -> {:?}", current, state);
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.engine_state(),
            device: self.config.device_path.display().to_string(),
            backend: self.backend_name,
            negotiated_format: self.device.format(),
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
            last_error_code: self.last_error.as_ref().map(|e| e.code()),
            frames_produced: self.frames_produced,
            frames_dropped: self.frames_dropped,
            subscribers: self.distributor.stats(),
            pool: self.device.pool_counts(),
        }
    }
}
