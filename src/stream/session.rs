//! Per-client sessions on top of distributor subscriptions

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

use super::distributor::{FrameDistributor, SubscriberId, SubscriberKind, Subscription};
use crate::video::Frame;

/// Default bound on a single snapshot wait
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("No frame arrived before the snapshot timeout")]
    SnapshotTimeout,

    #[error("Capture stopped")]
    Closed,
}

/// Outcome of waiting on a live session
#[derive(Debug)]
pub enum Next {
    Frame(Frame),
    /// Nothing arrived within the timeout
    Idle,
    /// The subscription was terminated
    Closed,
}

/// Rolling window FPS calculator
#[derive(Debug, Clone)]
pub struct FpsCalculator {
    frame_times: VecDeque<Instant>,
    window: Duration,
}

impl FpsCalculator {
    pub fn new() -> Self {
        Self {
            frame_times: VecDeque::with_capacity(120),
            window: Duration::from_secs(1),
        }
    }

    pub fn record_frame(&mut self) {
        let now = Instant::now();
        self.frame_times.push_back(now);
        while let Some(&oldest) = self.frame_times.front() {
            if now.duration_since(oldest) > self.window {
                self.frame_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames recorded in the last window
    pub fn current_fps(&self) -> u32 {
        self.frame_times.len() as u32
    }
}

impl Default for FpsCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// A live MJPEG client
pub struct LiveSession {
    subscription: Subscription,
    connected_at: Instant,
    frames_sent: u64,
    last_sequence: u64,
    fps: FpsCalculator,
}

impl LiveSession {
    pub fn open(distributor: &Arc<FrameDistributor>) -> Self {
        let subscription = distributor.subscribe(SubscriberKind::LiveStream);
        info!("Stream client {} connected", subscription.id());
        Self {
            subscription,
            connected_at: Instant::now(),
            frames_sent: 0,
            last_sequence: 0,
            fps: FpsCalculator::new(),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.subscription.id()
    }

    /// Wait up to `timeout` for a newer frame
    pub async fn next(&mut self, timeout: Duration) -> Next {
        match tokio::time::timeout(timeout, self.subscription.recv()).await {
            Ok(Some(frame)) => {
                self.last_sequence = frame.sequence;
                self.frames_sent += 1;
                self.fps.record_frame();
                Next::Frame(frame)
            }
            Ok(None) => Next::Closed,
            Err(_) => Next::Idle,
        }
    }

    /// Sequence of the last frame handed out, 0 before the first
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn current_fps(&self) -> u32 {
        self.fps.current_fps()
    }

    pub fn frames_skipped(&self) -> u64 {
        self.subscription.frames_replaced()
    }

    /// The distributor terminated this session
    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let secs = self.connected_at.elapsed().as_secs_f32();
        let avg_fps = if secs > 0.1 {
            self.frames_sent as f32 / secs
        } else {
            0.0
        };
        info!(
            "Stream client {} disconnected after {:.1}s ({} frames, {} skipped, last #{}, {:.1} avg FPS, {} current)",
            self.id(),
            secs,
            self.frames_sent,
            self.frames_skipped(),
            self.last_sequence(),
            avg_fps,
            self.current_fps()
        );
    }
}

/// A one-shot frame request
pub struct SnapshotSession {
    subscription: Subscription,
}

impl SnapshotSession {
    pub fn open(distributor: &Arc<FrameDistributor>) -> Self {
        Self {
            subscription: distributor.subscribe(SubscriberKind::SnapshotWait),
        }
    }

    /// Wait for exactly one frame; the subscription is dropped either way
    pub async fn wait(self, timeout: Duration) -> Result<Frame, SessionError> {
        match tokio::time::timeout(timeout, self.subscription.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::SnapshotTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::distributor::DEFAULT_SNAPSHOT_STALENESS;
    use crate::video::format::CaptureFormat;

    fn frame(seq: u64) -> Frame {
        Frame::copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9], &CaptureFormat::default(), seq)
    }

    #[tokio::test]
    async fn test_live_session_idle_then_frame_then_closed() {
        let dist = FrameDistributor::new(DEFAULT_SNAPSHOT_STALENESS);
        let mut session = LiveSession::open(&dist);
        assert!(matches!(
            session.next(Duration::from_millis(10)).await,
            Next::Idle
        ));

        dist.publish(frame(1));
        match session.next(Duration::from_millis(100)).await {
            Next::Frame(f) => assert_eq!(f.sequence, 1),
            other => panic!("unexpected {:?}", other),
        }

        dist.terminate_all();
        assert!(matches!(
            session.next(Duration::from_millis(100)).await,
            Next::Closed
        ));
        assert_eq!(session.frames_sent(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_timeout_unsubscribes() {
        let dist = FrameDistributor::new(DEFAULT_SNAPSHOT_STALENESS);
        let snap = SnapshotSession::open(&dist);
        assert_eq!(dist.subscriber_count(), 1);
        assert_eq!(
            snap.wait(Duration::from_millis(20)).await.unwrap_err(),
            SessionError::SnapshotTimeout
        );
        assert_eq!(dist.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_closed_on_terminate() {
        let dist = FrameDistributor::new(DEFAULT_SNAPSHOT_STALENESS);
        let snap = SnapshotSession::open(&dist);
        let waiter = tokio::spawn(snap.wait(Duration::from_secs(5)));
        tokio::task::yield_now().await;
        dist.terminate_all();
        assert_eq!(waiter.await.unwrap().unwrap_err(), SessionError::Closed);
    }

    #[tokio::test]
    async fn test_snapshot_resolved_by_publish() {
        let dist = FrameDistributor::new(DEFAULT_SNAPSHOT_STALENESS);
        let snap = SnapshotSession::open(&dist);
        let waiter = tokio::spawn(snap.wait(Duration::from_secs(5)));
        dist.publish(frame(9));
        assert_eq!(waiter.await.unwrap().unwrap().sequence, 9);
    }

    #[test]
    fn test_fps_window() {
        let mut fps = FpsCalculator::new();
        for _ in 0..10 {
            fps.record_frame();
        }
        assert_eq!(fps.current_fps(), 10);
    }
}
