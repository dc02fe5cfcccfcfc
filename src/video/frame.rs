//! Video frame data structures

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use super::format::{CaptureFormat, PixelFormat, Resolution};

/// One captured image, copied out of a device buffer.
///
/// The payload is an owned, immutable `Bytes`, so cloning a frame is cheap
/// and never touches device memory.
#[derive(Debug, Clone)]
pub struct Frame {
    payload: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel format
    pub format: PixelFormat,
    /// Engine sequence number, 1-based per device open
    pub sequence: u64,
    /// Monotonic capture time (for staleness checks)
    pub captured_at: Instant,
    /// Wall-clock capture time (for response headers)
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Create a frame stamped with the current time
    pub fn new(payload: Bytes, format: &CaptureFormat, sequence: u64) -> Self {
        Self {
            payload,
            resolution: format.resolution,
            format: format.pixel_format,
            sequence,
            captured_at: Instant::now(),
            timestamp: Utc::now(),
        }
    }

    /// Copy `data` into a new owned frame
    pub fn copy_from_slice(data: &[u8], format: &CaptureFormat, sequence: u64) -> Self {
        Self::new(Bytes::copy_from_slice(data), format, sequence)
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.payload
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Get age of this frame (time since capture)
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Check if this frame is younger than `max_age`
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() < max_age
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }

    /// `X-Timestamp` header value (UTC, second precision)
    pub fn timestamp_header(&self) -> String {
        self.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    /// Validate JPEG frame data
    pub fn is_valid_jpeg(&self) -> bool {
        self.format.is_compressed() && is_valid_jpeg(&self.payload)
    }
}

/// Check JPEG start and end markers.
///
/// Some UVC devices pad the end of the buffer, so `0xD900` and `0x0000`
/// trailers are accepted as well.
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let start_marker = ((data[0] as u16) << 8) | data[1] as u16;
    if start_marker != 0xFFD8 {
        return false;
    }
    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(len: usize) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0u8; len]);
        data.extend([0xFF, 0xD9]);
        data
    }

    #[test]
    fn test_valid_jpeg() {
        assert!(is_valid_jpeg(&jpeg(200)));
        assert!(!is_valid_jpeg(&[0xFF, 0xD8]));

        let mut bad = vec![0x00, 0x00];
        bad.extend(vec![0u8; 200]);
        assert!(!is_valid_jpeg(&bad));
    }

    #[test]
    fn test_frame_copy_is_independent() {
        let mut source = jpeg(16);
        let frame = Frame::copy_from_slice(&source, &CaptureFormat::default(), 7);
        source[0] = 0;
        assert!(frame.is_valid_jpeg());
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.len(), 20);
        assert_eq!(frame.content_type(), "image/jpeg");
    }

    #[test]
    fn test_freshness() {
        let mut frame = Frame::copy_from_slice(&jpeg(4), &CaptureFormat::default(), 1);
        assert!(frame.is_fresh(Duration::from_secs(2)));
        frame.captured_at = Instant::now() - Duration::from_secs(3);
        assert!(!frame.is_fresh(Duration::from_secs(2)));
    }
}
