//! Capture engine control surface
//!
//! A [`CaptureEngine`] owns one capture thread for one device path.
//! Start, stop and status requests are serialized onto that thread through
//! a command channel; frames come out through the shared
//! [`FrameDistributor`].

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use super::backend::BackendFactory;
use super::buffer_pool::PoolCounts;
use super::capture::{CaptureConfig, CaptureLoop};
use super::device::CaptureDevice;
use super::error::{CaptureError, CaptureResult};
use super::format::CaptureFormat;
use crate::stream::{DistributorStats, FrameDistributor};

/// Externally visible engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Closed,
    Opened,
    Configured,
    Streaming,
    /// Device lost; only an explicit start recovers
    Faulted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Closed => "closed",
            EngineState::Opened => "opened",
            EngineState::Configured => "configured",
            EngineState::Streaming => "streaming",
            EngineState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub device: String,
    pub backend: &'static str,
    pub negotiated_format: Option<CaptureFormat>,
    pub last_error: Option<String>,
    pub last_error_code: Option<&'static str>,
    pub frames_produced: u64,
    pub frames_dropped: u64,
    pub subscribers: DistributorStats,
    pub pool: Option<PoolCounts>,
}

/// Requests consumed by the capture thread
#[derive(Debug)]
pub enum Command {
    Start {
        /// `None` restarts with the previous (or configured) format
        format: Option<CaptureFormat>,
        reply: oneshot::Sender<CaptureResult<CaptureFormat>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

pub struct CaptureEngine {
    device_path: PathBuf,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<EngineState>,
    distributor: Arc<FrameDistributor>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureEngine {
    /// Spawn the capture thread. The device stays closed until `start`.
    pub fn spawn(
        config: CaptureConfig,
        factory: Arc<dyn BackendFactory>,
        distributor: Arc<FrameDistributor>,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EngineState::Closed);

        let device_path = config.device_path.clone();
        let thread_name = format!(
            "capture-{}",
            device_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        let capture_loop = CaptureLoop::new(
            config,
            CaptureDevice::new(factory.clone()),
            factory.name(),
            distributor.clone(),
            rx,
            state_tx,
        );
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || capture_loop.run())?;

        info!("Capture engine created for {}", device_path.display());
        Ok(Self {
            device_path,
            commands: tx,
            state_rx,
            distributor,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn distributor(&self) -> &Arc<FrameDistributor> {
        &self.distributor
    }

    /// Last state published by the capture thread
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == EngineState::Streaming
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Wait until the engine reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: EngineState, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> CaptureResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| CaptureError::EngineGone)?;
        rx.await.map_err(|_| CaptureError::EngineGone)
    }

    /// Start (or restart) capture; returns the negotiated format
    pub async fn start(&self, format: Option<CaptureFormat>) -> CaptureResult<CaptureFormat> {
        self.request(|reply| Command::Start { format, reply })
            .await?
    }

    /// Stop capture and terminate every subscriber; idempotent
    pub async fn stop(&self) -> CaptureResult<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn status(&self) -> CaptureResult<EngineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop, close the device and join the capture thread
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply: Some(reply) })
            .is_ok()
        {
            let _ = rx.await;
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => info!("Capture engine for {} shut down", self.device_path.display()),
                Ok(Err(_)) => warn!("Capture thread panicked"),
                Err(e) => warn!("Failed to join capture thread: {}", e),
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        // The thread exits on its own once it sees the request
        let _ = self.commands.send(Command::Shutdown { reply: None });
    }
}
