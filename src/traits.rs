//! Core traits and types for the camera device seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Pixel format representation (e.g., YUYV, BGR3, GREY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed). The luma plane is interleaved, so
    /// greyscale costs one byte pick per pixel.
    pub const YUYV: Self = Self::new(b"YUYV");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// GREY pixel format (8-bit luma only).
    pub const GREY: Self = Self::new(b"GREY");

    /// Bytes per pixel for the packed formats the capture pipeline understands.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" => Some(2),
            b"BGR3" | b"RGB3" => Some(3),
            b"GREY" => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("FourCC must be exactly 4 ASCII bytes, got {s:?}"))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for FourCC {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FourCC> for String {
    fn from(fourcc: FourCC) -> Self {
        fourcc.to_string()
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new tightly packed format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let bpp = match fourcc.bytes_per_pixel() {
            Some(bpp) => bpp,
            None => 2,
        };
        let stride = width * bpp;
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A raw frame as delivered by the device, before any conversion.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// The bytes the driver reports as filled, never more than were delivered.
    #[must_use]
    pub fn used(&self) -> &[u8] {
        let used = usize::try_from(self.metadata.bytes_used).unwrap_or(usize::MAX);
        self.data.get(..used).unwrap_or(&self.data)
    }
}

/// Error type for camera device operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// Device disappeared or stopped answering.
    #[error("Device gone: {0}")]
    DeviceGone(String),
    /// Error during streaming operation.
    #[error("Stream error: {0}")]
    StreamError(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera device operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over camera device operations.
pub trait CameraDevice {
    /// The stream type returned by `create_stream`.
    type Stream<'a>: CaptureStream
    where
        Self: 'a;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Whether the device still answers requests.
    fn is_open(&self) -> bool;

    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Create a capture stream with the specified number of buffers.
    fn create_stream(&mut self, buffer_count: u32) -> Result<Self::Stream<'_>>;
}

/// Abstraction over capture stream operations.
pub trait CaptureStream {
    /// Capture the next frame from the stream.
    fn next_frame(&mut self) -> Result<Frame>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trips_through_text() {
        let parsed: FourCC = "BGR3".parse().expect("valid fourcc");
        assert_eq!(parsed, FourCC::BGR3);
        assert_eq!(FourCC::YUYV.to_string(), "YUYV");
        assert!("YUV".parse::<FourCC>().is_err());
    }

    #[test]
    fn test_format_stride_follows_pixel_size() {
        assert_eq!(Format::new(640, 480, FourCC::YUYV).stride, 1280);
        assert_eq!(Format::new(640, 480, FourCC::BGR3).stride, 1920);
        assert_eq!(Format::new(640, 480, FourCC::GREY).size, 640 * 480);
    }

    #[test]
    fn test_frame_used_is_clamped() {
        let frame = Frame {
            data: vec![1, 2, 3, 4],
            metadata: FrameMetadata {
                sequence: 0,
                timestamp: Duration::ZERO,
                bytes_used: 16,
            },
        };
        assert_eq!(frame.used().len(), 4);
    }
}
