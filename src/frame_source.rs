//! Frame acquisition pipeline for one open camera.
//!
//! A [`FrameSource`] owns the camera handle exclusively. Every capture runs
//! the whole configure / validate / grab / convert / denoise / copy sequence
//! while holding the handle's lock, so a second caller waits for the first
//! capture to finish instead of sharing half-configured device state.
//!
//! The caller's buffer is written only after every check has passed: a
//! failed capture leaves it exactly as it was.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::imgproc::{median_3x3, to_grey};
use crate::traits::{CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FourCC};

/// Buffers queued on the device for a single-frame capture.
pub const DEFAULT_BUFFER_COUNT: u32 = 2;

/// Largest greyscale frame a camera driver hands out, matching the send
/// buffer asked for on every endpoint session.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Geometry and encoding requested for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRequest {
    /// Target width in pixels.
    pub width: u32,
    /// Target height in pixels.
    pub height: u32,
    /// Pixel encoding asked of the device.
    #[serde(default = "default_format")]
    pub format: FourCC,
}

const fn default_format() -> FourCC {
    FourCC::YUYV
}

impl FrameRequest {
    /// A request for `width` x `height` in the default encoding.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: default_format(),
        }
    }

    /// Use a different pixel encoding.
    #[must_use]
    pub const fn with_format(mut self, format: FourCC) -> Self {
        self.format = format;
        self
    }

    /// Exact size in bytes of the greyscale frame this request produces.
    /// Saturates instead of wrapping on targets with a narrow `usize`.
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        (self.width as usize).saturating_mul(self.height as usize)
    }

    /// Frame size, provided the geometry is non-empty and the frame fits in
    /// `max_bytes`. Checked before any buffer is allocated.
    pub fn checked_len(&self, max_bytes: usize) -> Result<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .filter(|&len| len > 0 && len <= max_bytes)
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "frame geometry {}x{} must be non-empty and at most {max_bytes} bytes",
                    self.width, self.height
                ))
            })
    }
}

/// Description of a frame written into a caller buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Encoding of the delivered bytes (always GREY).
    pub format: FourCC,
    /// Device sequence number of the raw frame.
    pub sequence: u32,
}

/// Exclusive handle to one open camera.
pub struct FrameSource<D> {
    device: Mutex<D>,
    buffer_count: u32,
}

impl<D: CameraDevice> FrameSource<D> {
    /// Take ownership of an open camera.
    pub fn new(device: D) -> Self {
        Self {
            device: Mutex::new(device),
            buffer_count: DEFAULT_BUFFER_COUNT,
        }
    }

    /// Number of buffers to queue per capture.
    #[must_use]
    pub fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count.max(1);
        self
    }

    /// Capabilities reported when the camera was opened.
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.device.lock().capabilities().clone()
    }

    /// Ask the device for `request`'s geometry and return what it settled on.
    pub fn configure(&self, request: &FrameRequest) -> Result<Format> {
        let mut device = self.device.lock();
        apply_format(&mut *device, request)
    }

    /// Capture one greyscale frame into `buffer`, which must be exactly
    /// `request.width * request.height` bytes long.
    pub fn capture(&self, request: &FrameRequest, buffer: &mut [u8]) -> Result<FrameInfo> {
        let expected_len = request.frame_len();
        if buffer.len() != expected_len {
            return Err(Error::BufferSizeMismatch {
                expected: expected_len,
                actual: buffer.len(),
            });
        }
        if expected_len == 0 {
            return Err(Error::InvalidRequest(format!(
                "cannot capture a {}x{} frame",
                request.width, request.height
            )));
        }

        let mut device = self.device.lock();
        let format = apply_format(&mut *device, request)?;

        if !device.is_open() {
            return Err(Error::DeviceUnavailable("camera is not open".to_owned()));
        }

        let mut stream = device
            .create_stream(self.buffer_count)
            .map_err(unavailable_if_gone)?;
        let frame = stream.next_frame().map_err(unavailable_if_gone)?;
        debug!(
            sequence = frame.metadata.sequence,
            bytes = frame.metadata.bytes_used,
            "raw frame"
        );

        let grey = to_grey(frame.used(), &format)?;
        let denoised = median_3x3(&grey);

        if !denoised.is_contiguous() {
            return Err(Error::NonContiguousBuffer {
                width: denoised.width,
                stride: denoised.stride,
            });
        }
        if (denoised.width, denoised.height) != (request.width, request.height) {
            warn!(
                expected_width = request.width,
                expected_height = request.height,
                actual_width = denoised.width,
                actual_height = denoised.height,
                "frame dimension mismatch"
            );
            return Err(Error::DimensionMismatch {
                expected: (request.width, request.height),
                actual: (denoised.width, denoised.height),
            });
        }

        buffer.copy_from_slice(&denoised.data);
        Ok(FrameInfo {
            width: request.width,
            height: request.height,
            format: FourCC::GREY,
            sequence: frame.metadata.sequence,
        })
    }
}

/// Set geometry and encoding, then read back what the device actually holds.
fn apply_format<D: CameraDevice>(device: &mut D, request: &FrameRequest) -> Result<Format> {
    let wanted = Format::new(request.width, request.height, request.format);
    device.set_format(&wanted).map_err(unavailable_if_gone)?;
    let actual = device.format().map_err(unavailable_if_gone)?;

    if (actual.width, actual.height) != (request.width, request.height) {
        warn!(
            requested_width = request.width,
            requested_height = request.height,
            actual_width = actual.width,
            actual_height = actual.height,
            "camera rejected requested geometry"
        );
        return Err(Error::ConfigurationRejected {
            requested: (request.width, request.height),
            actual: (actual.width, actual.height),
        });
    }
    if actual.fourcc.bytes_per_pixel().is_none() {
        return Err(Error::UnsupportedPixelFormat(actual.fourcc));
    }
    Ok(actual)
}

fn unavailable_if_gone(err: CameraError) -> Error {
    match err {
        CameraError::DeviceGone(reason) => Error::DeviceUnavailable(reason),
        other => Error::Camera(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, TestPattern};
    use crate::validation::{validate_gradient, validate_solid};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    const UNTOUCHED: u8 = 0xA5;

    #[test]
    fn test_capture_fills_exact_buffer() {
        let device = MockDevice::new().with_pattern(TestPattern::Solid(80, 128, 128));
        let source = FrameSource::new(device);
        let request = FrameRequest::new(64, 48);
        let mut buffer = vec![UNTOUCHED; request.frame_len()];

        let info = source.capture(&request, &mut buffer).expect("capture");
        assert_eq!((info.width, info.height), (64, 48));
        assert_eq!(info.format, FourCC::GREY);
        validate_solid(&buffer, 80, 0).expect("solid frame");
    }

    #[test]
    fn test_capture_bgr_gradient() {
        let source = FrameSource::new(MockDevice::new().with_pattern(TestPattern::Gradient));
        let request = FrameRequest::new(320, 240).with_format(FourCC::BGR3);
        let mut buffer = vec![0; request.frame_len()];

        source.capture(&request, &mut buffer).expect("capture");
        validate_gradient(&buffer, 320, 240).expect("gradient survives conversion");
    }

    #[test]
    fn test_clamped_geometry_is_rejected_without_capture() {
        let device = MockDevice::new().with_clamp(640, 480);
        let control = device.control();
        let source = FrameSource::new(device);
        let request = FrameRequest::new(320, 240);
        let mut buffer = vec![UNTOUCHED; request.frame_len()];

        let err = source.capture(&request, &mut buffer).expect_err("must fail");
        assert!(matches!(
            err,
            Error::ConfigurationRejected {
                requested: (320, 240),
                actual: (640, 480)
            }
        ));
        assert_eq!(control.frames_captured(), 0);
        assert!(buffer.iter().all(|&b| b == UNTOUCHED));
    }

    #[test]
    fn test_unplugged_camera_is_unavailable() {
        let device = MockDevice::new();
        let control = device.control();
        let source = FrameSource::new(device);
        control.unplug();

        let request = FrameRequest::new(16, 16);
        let mut buffer = vec![UNTOUCHED; request.frame_len()];
        let err = source.capture(&request, &mut buffer).expect_err("must fail");
        assert!(matches!(err, Error::DeviceUnavailable(_)));
        assert!(buffer.iter().all(|&b| b == UNTOUCHED));
    }

    #[test]
    fn test_padded_rows_are_not_copied() {
        let source = FrameSource::new(MockDevice::new().with_row_padding(8));
        let request = FrameRequest::new(32, 32);
        let mut buffer = vec![UNTOUCHED; request.frame_len()];

        let err = source.capture(&request, &mut buffer).expect_err("must fail");
        assert!(matches!(
            err,
            Error::NonContiguousBuffer {
                width: 32,
                stride: 36
            }
        ));
        assert!(buffer.iter().all(|&b| b == UNTOUCHED));
    }

    #[test]
    fn test_short_frame_reports_dimensions() {
        let source = FrameSource::new(MockDevice::new().with_missing_rows(3));
        let request = FrameRequest::new(32, 24);
        let mut buffer = vec![UNTOUCHED; request.frame_len()];

        let err = source.capture(&request, &mut buffer).expect_err("must fail");
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: (32, 24),
                actual: (32, 21)
            }
        ));
        assert!(buffer.iter().all(|&b| b == UNTOUCHED));
    }

    #[test]
    fn test_wrong_buffer_size_is_refused() {
        let source = FrameSource::new(MockDevice::new());
        let mut buffer = vec![0; 10];
        let err = source
            .capture(&FrameRequest::new(4, 4), &mut buffer)
            .expect_err("must fail");
        assert!(matches!(
            err,
            Error::BufferSizeMismatch {
                expected: 16,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_checked_len_bounds() {
        let max = DEFAULT_MAX_FRAME_BYTES;
        assert_eq!(FrameRequest::new(640, 480).checked_len(max).expect("fits"), 640 * 480);
        assert_eq!(FrameRequest::new(2048, 2048).checked_len(max).expect("fits"), max);
        for (width, height) in [(0, 480), (640, 0), (2049, 2048), (u32::MAX, u32::MAX)] {
            assert!(matches!(
                FrameRequest::new(width, height).checked_len(max),
                Err(Error::InvalidRequest(_))
            ));
        }
        assert_eq!(
            FrameRequest::new(u32::MAX, u32::MAX).frame_len(),
            (u32::MAX as usize).saturating_mul(u32::MAX as usize)
        );
    }

    #[test]
    fn test_concurrent_captures_do_not_overlap() {
        let device = MockDevice::new().with_capture_delay(Duration::from_millis(20));
        let control = device.control();
        let source = Arc::new(FrameSource::new(device));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || {
                    let request = FrameRequest::new(16 + i * 8, 16);
                    let mut buffer = vec![0; request.frame_len()];
                    source.capture(&request, &mut buffer).map(|info| info.width)
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let width = handle.join().expect("thread").expect("capture");
            assert_eq!(width as usize, 16 + i * 8);
        }
        assert_eq!(control.max_in_flight(), 1);
        assert_eq!(control.frames_captured(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_accepted_geometry_yields_exact_size(width in 1u32..96, height in 1u32..64) {
            let source = FrameSource::new(MockDevice::new());
            let request = FrameRequest::new(width, height);
            for _ in 0..2 {
                let mut buffer = vec![0; request.frame_len()];
                let info = source.capture(&request, &mut buffer).expect("capture");
                prop_assert_eq!(buffer.len(), (width * height) as usize);
                prop_assert_eq!((info.width, info.height), (width, height));
            }
        }
    }
}
