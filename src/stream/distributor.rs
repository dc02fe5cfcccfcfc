//! Frame fan-out to live streams and snapshot waiters
//!
//! The capture thread calls [`FrameDistributor::publish`]; it never blocks
//! on a consumer. Each subscriber has a one-slot mailbox that is
//! overwritten on every publish, so a stalled client only ever has the
//! latest frame waiting for it.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::video::Frame;

/// Default age beyond which the stored snapshot is not served to waiters
pub const DEFAULT_SNAPSHOT_STALENESS: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberKind {
    /// Long-lived MJPEG stream
    LiveStream,
    /// Waits for exactly one frame
    SnapshotWait,
}

/// Capacity-1, latest-wins slot
#[derive(Debug, Default)]
struct Mailbox {
    slot: Mutex<Option<Frame>>,
    notify: Notify,
    closed: AtomicBool,
    delivered: AtomicU64,
    replaced: AtomicU64,
}

impl Mailbox {
    /// Store `frame`, returning whether an undrained frame was overwritten
    fn put(&self, frame: Frame) -> bool {
        let replaced = self.slot.lock().replace(frame).is_some();
        if replaced {
            self.replaced.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        replaced
    }

    fn take(&self) -> Option<Frame> {
        let frame = self.slot.lock().take();
        if frame.is_some() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct Registered {
    kind: SubscriberKind,
    mailbox: Arc<Mailbox>,
}

/// Distributor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistributorStats {
    pub subscribers: usize,
    pub live_streams: usize,
    pub snapshot_waiters: usize,
    pub frames_published: u64,
    /// Frames overwritten before a live subscriber drained them
    pub frames_replaced: u64,
    pub snapshots_served: u64,
}

pub struct FrameDistributor {
    registry: Mutex<HashMap<SubscriberId, Registered>>,
    latest_snapshot: ArcSwap<Option<Frame>>,
    staleness: Duration,
    frames_published: AtomicU64,
    frames_replaced: AtomicU64,
    snapshots_served: AtomicU64,
}

impl FrameDistributor {
    pub fn new(staleness: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            latest_snapshot: ArcSwap::from_pointee(None),
            staleness,
            frames_published: AtomicU64::new(0),
            frames_replaced: AtomicU64::new(0),
            snapshots_served: AtomicU64::new(0),
        })
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Hand `frame` to every subscriber without waiting on any of them.
    ///
    /// Snapshot waiters are resolved and detached in the same pass.
    pub fn publish(&self, frame: Frame) {
        self.latest_snapshot.store(Arc::new(Some(frame.clone())));
        self.frames_published.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.registry.lock();
        let mut resolved = 0u64;
        registry.retain(|_, sub| match sub.kind {
            SubscriberKind::LiveStream => {
                if sub.mailbox.put(frame.clone()) {
                    self.frames_replaced.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            SubscriberKind::SnapshotWait => {
                sub.mailbox.put(frame.clone());
                resolved += 1;
                false
            }
        });
        drop(registry);

        if resolved > 0 {
            self.snapshots_served.fetch_add(resolved, Ordering::Relaxed);
        }
    }

    /// Register a subscriber.
    ///
    /// A snapshot waiter is satisfied on the spot when the stored snapshot
    /// is younger than the staleness bound; it is then never registered.
    pub fn subscribe(self: &Arc<Self>, kind: SubscriberKind) -> Subscription {
        let id = SubscriberId::new();
        let mailbox = Arc::new(Mailbox::default());

        let mut registry = self.registry.lock();
        if kind == SubscriberKind::SnapshotWait {
            if let Some(frame) = self.fresh_snapshot() {
                drop(registry);
                mailbox.put(frame);
                self.snapshots_served.fetch_add(1, Ordering::Relaxed);
                return Subscription::new(id, kind, mailbox, self.clone());
            }
        }
        registry.insert(
            id,
            Registered {
                kind,
                mailbox: mailbox.clone(),
            },
        );
        let total = registry.len();
        drop(registry);

        debug!("Subscriber {} ({:?}) registered, total {}", id, kind, total);
        Subscription::new(id, kind, mailbox, self.clone())
    }

    /// Remove a subscriber; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registry.lock().remove(&id);
        match removed {
            Some(sub) => {
                sub.mailbox.close();
                debug!("Subscriber {} unsubscribed", id);
                true
            }
            None => false,
        }
    }

    /// Close every subscription and forget the stored snapshot.
    ///
    /// Pending waits observe `Closed`.
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<Registered> = {
            let mut registry = self.registry.lock();
            registry.drain().map(|(_, sub)| sub).collect()
        };
        for sub in &drained {
            sub.mailbox.close();
        }
        self.latest_snapshot.store(Arc::new(None));
        if !drained.is_empty() {
            info!("Terminated {} subscribers", drained.len());
        }
        drained.len()
    }

    /// Last published frame, regardless of age
    pub fn latest(&self) -> Option<Frame> {
        (**self.latest_snapshot.load()).clone()
    }

    /// Last published frame if younger than the staleness bound
    pub fn fresh_snapshot(&self) -> Option<Frame> {
        self.latest().filter(|f| f.is_fresh(self.staleness))
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn stats(&self) -> DistributorStats {
        let (live_streams, snapshot_waiters) = {
            let registry = self.registry.lock();
            registry.values().fold((0, 0), |(live, snap), sub| match sub.kind {
                SubscriberKind::LiveStream => (live + 1, snap),
                SubscriberKind::SnapshotWait => (live, snap + 1),
            })
        };
        DistributorStats {
            subscribers: live_streams + snapshot_waiters,
            live_streams,
            snapshot_waiters,
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_replaced: self.frames_replaced.load(Ordering::Relaxed),
            snapshots_served: self.snapshots_served.load(Ordering::Relaxed),
        }
    }
}

/// A registered subscriber; unsubscribes when dropped
pub struct Subscription {
    id: SubscriberId,
    kind: SubscriberKind,
    mailbox: Arc<Mailbox>,
    distributor: Arc<FrameDistributor>,
}

impl Subscription {
    fn new(
        id: SubscriberId,
        kind: SubscriberKind,
        mailbox: Arc<Mailbox>,
        distributor: Arc<FrameDistributor>,
    ) -> Self {
        Self {
            id,
            kind,
            mailbox,
            distributor,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn kind(&self) -> SubscriberKind {
        self.kind
    }

    /// Wait for the next frame; `None` once the subscription is closed.
    ///
    /// A frame already in the mailbox is returned even if the subscription
    /// was closed after it arrived.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.mailbox.take() {
                return Some(frame);
            }
            if self.mailbox.is_closed() {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Non-blocking take
    pub fn try_recv(&self) -> Option<Frame> {
        self.mailbox.take()
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Frames handed to this subscriber's consumer
    pub fn frames_delivered(&self) -> u64 {
        self.mailbox.delivered.load(Ordering::Relaxed)
    }

    /// Frames overwritten in this subscriber's mailbox
    pub fn frames_replaced(&self) -> u64 {
        self.mailbox.replaced.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.distributor.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::CaptureFormat;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame::copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9], &CaptureFormat::default(), seq)
    }

    #[tokio::test]
    async fn test_latest_wins_for_undrained_subscriber() {
        let dist = FrameDistributor::new(DEFAULT_SNAPSHOT_STALENESS);
        let sub = dist.subscribe(SubscriberKind::LiveStream);
        for seq in 1..=50 {
            dist.publish(frame(seq));
        }
        let got = sub.recv().await.unwrap();
        assert_eq!(got.sequence, 50);
        assert!(sub.try_recv().is_none());
        assert_eq!(sub.frames_replaced(), 49);
        assert_eq!(dist.stats().frames_replaced, 49);
    }

    #[test]
    fn test_publish_does_not_wait_on_stalled_subscribers() {
        let dist = FrameDistributor::new(DEFAULT_SNAPSHOT_STALENESS);
        let subs: Vec<_> = (0..16)
            .map(|_| dist.subscribe(SubscriberKind::LiveStream))
            .collect();
        let started = Instant::now();
        for seq in 1..=10_000 {
            dist.publish(frame(seq));
        }
        // Nobody drains; publish must still complete promptly
        assert!(started.elapsed() < Duration::from_secs(2));
        for sub in &subs {
            assert_eq!(sub.try_recv().unwrap().sequence, 10_000);
        }
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_runs_on_drop() {
        let dist = FrameDistributor::new(DEFAULT_SNAPSHOT_STALENESS);
        let sub = dist.subscribe(SubscriberKind::LiveStream);
        let id = sub.id();
        assert_eq!(dist.subscriber_count(), 1);
        assert!(dist.unsubscribe(id));
        assert!(!dist.unsubscribe(id));
        assert!(sub.is_closed());
        drop(sub);

        let other = dist.subscribe(SubscriberKind::LiveStream);
        assert_eq!(dist.subscriber_count(), 1);
        drop(other);
        assert_eq!(dist.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_served_from_fresh_frame() {
        let dist = FrameDistributor::new(Duration::from_secs(2));
        dist.publish(frame(3));
        let snap = dist.subscribe(SubscriberKind::SnapshotWait);
        // Not registered: satisfied immediately
        assert_eq!(dist.subscriber_count(), 0);
        assert_eq!(snap.recv().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_stale_snapshot_forces_wait() {
        let dist = FrameDistributor::new(Duration::from_millis(20));
        dist.publish(frame(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        let snap = dist.subscribe(SubscriberKind::SnapshotWait);
        assert!(snap.try_recv().is_none());
        assert_eq!(dist.subscriber_count(), 1);

        dist.publish(frame(2));
        assert_eq!(dist.subscriber_count(), 0);
        assert_eq!(snap.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_terminate_all_closes_everyone() {
        let dist = FrameDistributor::new(DEFAULT_SNAPSHOT_STALENESS);
        let live: Vec<_> = (0..3)
            .map(|_| dist.subscribe(SubscriberKind::LiveStream))
            .collect();
        let snap = dist.subscribe(SubscriberKind::SnapshotWait);
        assert_eq!(dist.terminate_all(), 4);

        for sub in &live {
            assert!(sub.recv().await.is_none());
        }
        assert!(snap.recv().await.is_none());
        assert!(dist.latest().is_none());
        assert_eq!(dist.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn test_snapshot_resolves_once_alongside_live_streams() {
        let dist = FrameDistributor::new(Duration::from_millis(1));
        let a = dist.subscribe(SubscriberKind::LiveStream);
        let b = dist.subscribe(SubscriberKind::LiveStream);
        let snap = dist.subscribe(SubscriberKind::SnapshotWait);
        assert_eq!(dist.stats().snapshot_waiters, 1);

        dist.publish(frame(1));
        dist.publish(frame(2));

        assert_eq!(snap.recv().await.unwrap().sequence, 1);
        assert!(snap.try_recv().is_none());
        assert_eq!(snap.frames_delivered(), 1);

        for live in [&a, &b] {
            assert_eq!(live.recv().await.unwrap().sequence, 2);
            assert_eq!(live.frames_delivered() + live.frames_replaced(), 2);
        }
        let stats = dist.stats();
        assert_eq!(stats.snapshots_served, 1);
        assert_eq!(stats.live_streams, 2);
        assert_eq!(stats.snapshot_waiters, 0);
    }
}
