//! Frame fan-out and per-client streaming
//!
//! # Components
//!
//! - `FrameDistributor` - latest-wins delivery to every subscriber
//! - `LiveSession` / `SnapshotSession` - the HTTP side of a subscription
//! - `mjpeg` - multipart encoding and the stream body pump

pub mod distributor;
pub mod mjpeg;
pub mod session;

pub use distributor::{
    DistributorStats, FrameDistributor, SubscriberId, SubscriberKind, Subscription,
};
pub use mjpeg::{create_mjpeg_part, mjpeg_body, MjpegOptions};
pub use session::{LiveSession, Next, SessionError, SnapshotSession};
