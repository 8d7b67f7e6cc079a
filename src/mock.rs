//! Simulated camera for tests and for running controllers without hardware.
//!
//! Besides producing test patterns, a [`MockDevice`] can misbehave the way
//! real UVC devices do: clamp the requested resolution, pad rows, deliver a
//! short buffer or vanish from the bus. A cloned [`MockControl`] stays with
//! the test after the device itself has been moved into a driver.

use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FourCC, Frame,
    FrameMetadata, Result,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared observation and fault-injection handle for a [`MockDevice`].
#[derive(Debug, Clone, Default)]
pub struct MockControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug, Default)]
struct ControlInner {
    unplugged: AtomicBool,
    set_format_calls: AtomicUsize,
    frames_captured: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockControl {
    /// Simulate the camera being pulled off the bus.
    pub fn unplug(&self) {
        self.inner.unplugged.store(true, Ordering::SeqCst);
    }

    /// Number of `set_format` calls seen so far.
    pub fn set_format_calls(&self) -> usize {
        self.inner.set_format_calls.load(Ordering::SeqCst)
    }

    /// Number of raw frames handed out so far.
    pub fn frames_captured(&self) -> usize {
        self.inner.frames_captured.load(Ordering::SeqCst)
    }

    /// Highest number of frame grabs that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    fn is_unplugged(&self) -> bool {
        self.inner.unplugged.load(Ordering::SeqCst)
    }
}

/// Mock device for testing without hardware.
#[derive(Debug)]
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    format: Format,
    frame_count: u32,
    pattern: TestPattern,
    clamp_to: Option<(u32, u32)>,
    row_padding: u32,
    missing_rows: u32,
    capture_delay: Duration,
    control: MockControl,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            frame_count: 0,
            pattern: TestPattern::ColorBars,
            clamp_to: None,
            row_padding: 0,
            missing_rows: 0,
            capture_delay: Duration::ZERO,
            control: MockControl::default(),
        }
    }

    /// Set the format for this mock device.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the test pattern every frame is rendered with.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Ignore requested geometry and always report this resolution instead.
    #[must_use]
    pub const fn with_clamp(mut self, width: u32, height: u32) -> Self {
        self.clamp_to = Some((width, height));
        self
    }

    /// Pad every row with this many extra bytes.
    #[must_use]
    pub const fn with_row_padding(mut self, bytes: u32) -> Self {
        self.row_padding = bytes;
        self
    }

    /// Deliver frames that are this many rows short of the negotiated height.
    #[must_use]
    pub const fn with_missing_rows(mut self, rows: u32) -> Self {
        self.missing_rows = rows;
        self
    }

    /// Hold every frame grab for this long.
    #[must_use]
    pub const fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Handle for observing and breaking this device from the outside.
    #[must_use]
    pub fn control(&self) -> MockControl {
        self.control.clone()
    }
}

impl CameraDevice for MockDevice {
    type Stream<'a> = MockStream<'a>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn is_open(&self) -> bool {
        !self.control.is_unplugged()
    }

    fn format(&self) -> Result<Format> {
        if self.control.is_unplugged() {
            return Err(CameraError::DeviceGone("mock unplugged".to_owned()));
        }
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        self.control
            .inner
            .set_format_calls
            .fetch_add(1, Ordering::SeqCst);
        if self.control.is_unplugged() {
            return Err(CameraError::DeviceGone("mock unplugged".to_owned()));
        }

        let (width, height) = self.clamp_to.unwrap_or((format.width, format.height));
        let mut actual = Format::new(width, height, format.fourcc);
        actual.stride += self.row_padding;
        actual.size = actual.stride * height;
        self.format = actual;
        Ok(self.format.clone())
    }

    fn create_stream(&mut self, _buffer_count: u32) -> Result<Self::Stream<'_>> {
        if self.control.is_unplugged() {
            return Err(CameraError::DeviceGone("mock unplugged".to_owned()));
        }
        Ok(MockStream { device: self })
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Mock capture stream for testing.
pub struct MockStream<'a> {
    device: &'a mut MockDevice,
}

impl CaptureStream for MockStream<'_> {
    fn next_frame(&mut self) -> Result<Frame> {
        let control = self.device.control.clone();
        let inner = &control.inner;
        let running = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.device.capture_delay.is_zero() {
            std::thread::sleep(self.device.capture_delay);
        }

        let format = &self.device.format;
        let mut data = generate_test_frame(format, self.device.pattern);
        let delivered_rows = format.height.saturating_sub(self.device.missing_rows);
        data.truncate((format.stride * delivered_rows) as usize);

        let seq = self.device.frame_count;
        self.device.frame_count += 1;
        inner.frames_captured.fetch_add(1, Ordering::SeqCst);
        inner.in_flight.fetch_sub(1, Ordering::SeqCst);

        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = data.len() as u32;
        Ok(Frame {
            data,
            metadata: FrameMetadata {
                sequence: seq,
                timestamp: Duration::from_millis(u64::from(seq) * 33), // ~30fps
                bytes_used,
            },
        })
    }
}

/// 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black, as
/// (Y, U, V) and the matching (R, G, B).
const BARS: [((u8, u8, u8), (u8, u8, u8)); 8] = [
    ((235, 128, 128), (235, 235, 235)),
    ((210, 16, 146), (235, 235, 11)),
    ((170, 166, 16), (12, 236, 237)),
    ((145, 54, 34), (13, 237, 13)),
    ((106, 202, 222), (237, 13, 237)),
    ((81, 90, 240), (238, 14, 13)),
    ((41, 240, 110), (15, 15, 239)),
    ((16, 128, 128), (16, 16, 16)),
];

/// Generate test frame data based on pattern, honouring the format's stride.
fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; (format.stride * format.height) as usize];
    let bar_width = (format.width / 8).max(1);

    for row in data.chunks_exact_mut(format.stride as usize) {
        for x in 0..format.width {
            let ((luma, u, v), rgb) = match pattern {
                TestPattern::ColorBars => {
                    let bar = BARS[((x / bar_width).min(7)) as usize];
                    (bar.0, bar.1)
                }
                TestPattern::Gradient => {
                    #[allow(clippy::cast_possible_truncation)]
                    let luma = ((x * 255) / format.width.max(1)) as u8;
                    ((luma, 128, 128), (luma, luma, luma))
                }
                TestPattern::Solid(luma, u, v) => ((luma, u, v), (luma, luma, luma)),
            };
            write_pixel(row, format.fourcc, x as usize, luma, (u, v), rgb);
        }
    }

    data
}

fn write_pixel(
    row: &mut [u8],
    fourcc: FourCC,
    x: usize,
    luma: u8,
    uv: (u8, u8),
    rgb: (u8, u8, u8),
) {
    let (r, g, b) = rgb;
    match fourcc {
        FourCC::YUYV => {
            // [Y0 U Y1 V] per pixel pair
            let pair = (x & !1) * 2;
            if let Some(bytes) = row.get_mut(pair..pair + 4) {
                bytes[x % 2 * 2] = luma;
                bytes[1] = uv.0;
                bytes[3] = uv.1;
            }
        }
        FourCC::BGR3 => {
            if let Some(bytes) = row.get_mut(x * 3..x * 3 + 3) {
                bytes.copy_from_slice(&[b, g, r]);
            }
        }
        FourCC::RGB3 => {
            if let Some(bytes) = row.get_mut(x * 3..x * 3 + 3) {
                bytes.copy_from_slice(&[r, g, b]);
            }
        }
        _ => {
            if let Some(byte) = row.get_mut(x) {
                *byte = luma;
            }
        }
    }
}
