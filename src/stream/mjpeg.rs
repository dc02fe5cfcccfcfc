//! MJPEG multipart encoding and the per-client stream pump

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::session::{LiveSession, Next};
use crate::video::Frame;

pub const DEFAULT_BOUNDARY: &str = "frame";

/// Per-stream options
#[derive(Debug, Clone)]
pub struct MjpegOptions {
    pub boundary: String,
    /// Wait this long for a frame before resending the previous one
    pub idle_timeout: Duration,
    /// Consecutive idle resends before the stream is ended
    pub max_idle_keepalives: u32,
}

impl Default for MjpegOptions {
    fn default() -> Self {
        Self {
            boundary: DEFAULT_BOUNDARY.to_string(),
            idle_timeout: Duration::from_secs(5),
            max_idle_keepalives: 6,
        }
    }
}

impl MjpegOptions {
    /// `Content-Type` of the whole response
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }
}

/// Boundary tokens must survive a header round-trip unquoted
pub fn is_valid_boundary(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 70
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"'()+_,-./:=?".contains(&b))
}

/// Encode one multipart part:
/// `--<boundary>\r\nContent-Type: ..\r\nContent-Length: ..\r\nX-Timestamp: ..\r\n\r\n<payload>\r\n`
pub fn create_mjpeg_part(boundary: &str, frame: &Frame) -> Bytes {
    let data = frame.data();
    let mut buf = BytesMut::with_capacity(160 + data.len());

    buf.put_slice(b"--");
    buf.put_slice(boundary.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(format!("Content-Type: {}\r\n", frame.content_type()).as_bytes());
    buf.put_slice(format!("Content-Length: {}\r\n", data.len()).as_bytes());
    buf.put_slice(format!("X-Timestamp: {}\r\n", frame.timestamp_header()).as_bytes());
    buf.put_slice(b"\r\n");

    buf.put_slice(data);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

/// Drive `session` onto a response body.
///
/// A background task drains the session into a capacity-1 channel; the
/// returned stream yields encoded parts. The stream ends when the session
/// is closed, after too many idle timeouts, or when the body is dropped.
pub fn mjpeg_body(
    mut session: LiveSession,
    options: MjpegOptions,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    let (tx, mut rx) = mpsc::channel::<Bytes>(1);

    tokio::spawn(async move {
        let mut last: Option<Frame> = None;
        let mut idle_count = 0u32;

        loop {
            let next = tokio::select! {
                next = session.next(options.idle_timeout) => next,
                _ = tx.closed() => break,
            };

            let frame = match next {
                Next::Frame(frame) => {
                    idle_count = 0;
                    frame
                }
                Next::Idle => {
                    idle_count += 1;
                    if idle_count > options.max_idle_keepalives {
                        debug!("Stream client {} idle too long", session.id());
                        break;
                    }
                    // Resend the last frame to keep the connection alive
                    match last.clone() {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
                Next::Closed => break,
            };

            let part = create_mjpeg_part(&options.boundary, &frame);
            if tx.send(part).await.is_err() {
                break;
            }
            last = Some(frame);
        }
        // Unsubscribe before the body observes end-of-stream
        drop(session);
        drop(tx);
    });

    async_stream::stream! {
        while let Some(part) = rx.recv().await {
            yield Ok::<Bytes, io::Error>(part);
        }
    }
}
