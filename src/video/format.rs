//! Pixel format and capture format definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Pixel encodings the engine accepts from a device.
///
/// The engine never transcodes: frames leave the device in the encoding
/// that was negotiated at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// Motion JPEG, one complete JPEG image per buffer
    Mjpeg,
    /// YUYV 4:2:2 packed
    Yuyv,
    /// Uncompressed packed RGB24
    Raw,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        match self {
            PixelFormat::Mjpeg => fourcc::FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => fourcc::FourCC::new(b"YUYV"),
            PixelFormat::Raw => fourcc::FourCC::new(b"RGB3"),
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"RGB3" => Some(PixelFormat::Raw),
            _ => None,
        }
    }

    /// Check if format is compressed (JPEG/MJPEG)
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Expected payload size for uncompressed formats, `None` for MJPEG
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Raw => Some(pixels * 3),
        }
    }

    /// HTTP content type for a payload in this encoding
    pub fn content_type(&self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "image/jpeg",
            PixelFormat::Yuyv => "image/yuyv",
            PixelFormat::Raw => "application/octet-stream",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Raw => "RAW",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MJPEG" | "MJPG" | "JPEG" | "JPG" => Ok(PixelFormat::Mjpeg),
            "YUYV" | "YUY2" => Ok(PixelFormat::Yuyv),
            "RAW" | "RGB" | "RGB24" => Ok(PixelFormat::Raw),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution is within what V4L2 drivers accept
    pub fn is_valid(&self) -> bool {
        self.width >= 16 && self.width <= 15360 && self.height >= 16 && self.height <= 8640
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    /// Parses `640x480` (also accepts `X` and `*` as separator)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X', '*'])
            .ok_or_else(|| format!("Invalid resolution: {}", s))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid resolution width: {}", s))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid resolution height: {}", s))?;
        let res = Resolution::new(width, height);
        if !res.is_valid() {
            return Err(format!("Resolution out of range: {}", res));
        }
        Ok(res)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Format requested from, or negotiated with, a capture device.
///
/// Immutable once streaming starts; changing it requires
/// stop -> configure -> start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFormat {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    /// Requested frame rate; the negotiated value may be lower
    pub fps: u32,
}

impl CaptureFormat {
    pub fn new(resolution: Resolution, pixel_format: PixelFormat, fps: u32) -> Self {
        Self {
            resolution,
            pixel_format,
            fps,
        }
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self::new(Resolution::VGA, PixelFormat::Mjpeg, 30)
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @ {}fps", self.resolution, self.pixel_format, self.fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_roundtrip_known_formats() {
        for fmt in [PixelFormat::Mjpeg, PixelFormat::Yuyv, PixelFormat::Raw] {
            assert_eq!(PixelFormat::from_fourcc(fmt.to_fourcc()), Some(fmt));
        }
        assert_eq!(
            PixelFormat::from_fourcc(fourcc::FourCC::new(b"NV12")),
            None
        );
    }

    #[test]
    fn test_parse_pixel_format_aliases() {
        assert_eq!("mjpg".parse::<PixelFormat>().unwrap(), PixelFormat::Mjpeg);
        assert_eq!("jpeg".parse::<PixelFormat>().unwrap(), PixelFormat::Mjpeg);
        assert_eq!("YUY2".parse::<PixelFormat>().unwrap(), PixelFormat::Yuyv);
        assert!("h264".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!("640x480".parse::<Resolution>().unwrap(), Resolution::VGA);
        assert_eq!(
            " 1280X720 ".parse::<Resolution>().unwrap(),
            Resolution::HD720
        );
        assert!("640".parse::<Resolution>().is_err());
        assert!("0x0".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::Mjpeg.frame_size(Resolution::VGA), None);
        assert_eq!(
            PixelFormat::Yuyv.frame_size(Resolution::VGA),
            Some(640 * 480 * 2)
        );
        assert_eq!(
            PixelFormat::Raw.frame_size(Resolution::VGA),
            Some(640 * 480 * 3)
        );
    }
}
