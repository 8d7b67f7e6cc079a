//! V4L2 camera backed by the `v4l` crate.
//!
//! Unplugging a USB camera does not close its file descriptor: every later
//! ioctl fails with `ENODEV` (or `ENXIO` on some bridges). Those errors are
//! reported as [`CameraError::DeviceGone`] so the capture pipeline can tell
//! a vanished camera from a transient streaming hiccup.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;

use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceCapabilities, Format, FourCC, Frame,
    FrameMetadata, Result,
};

/// An open V4L2 capture node.
pub struct V4L2Device {
    device: v4l::Device,
    node: PathBuf,
    capabilities: DeviceCapabilities,
}

impl V4L2Device {
    /// Open a V4L2 device node (e.g. `/dev/video0`).
    ///
    /// Metadata and output-only nodes are refused.
    pub fn open(node: &Path) -> Result<Self> {
        let device = v4l::Device::with_path(node)
            .map_err(|err| CameraError::DeviceOpenFailed(format!("{}: {err}", node.display())))?;
        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(format!("{}: {err}", node.display())))?;

        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{} is not a video capture node",
                node.display()
            )));
        }

        Ok(Self {
            device,
            node: node.to_path_buf(),
            capabilities: DeviceCapabilities {
                driver: caps.driver,
                card: caps.card,
                bus_info: caps.bus,
                can_capture: true,
                can_stream: caps.capabilities.contains(Flags::STREAMING),
            },
        })
    }

    fn format_raw(&self) -> Result<v4l::Format> {
        self.device
            .format()
            .map_err(|err| self.classify("get format", err))
    }

    fn classify(&self, op: &str, err: io::Error) -> CameraError {
        let message = format!("{} {op}: {err}", self.node.display());
        if is_gone(&err) {
            CameraError::DeviceGone(message)
        } else {
            CameraError::StreamError(message)
        }
    }
}

fn is_gone(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENODEV | Errno::ENXIO)
    )
}

impl From<&v4l::Format> for Format {
    fn from(fmt: &v4l::Format) -> Self {
        Self {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        }
    }
}

impl CameraDevice for V4L2Device {
    type Stream<'a> = V4L2Stream<'a>;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn is_open(&self) -> bool {
        self.device.query_caps().is_ok()
    }

    fn format(&self) -> Result<Format> {
        self.format_raw().map(|fmt| Format::from(&fmt))
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = self.format_raw()?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        self.device
            .set_format(&fmt)
            .map(|fmt| Format::from(&fmt))
            .map_err(|err| self.classify("set format", err))
    }

    fn create_stream(&mut self, buffer_count: u32) -> Result<Self::Stream<'_>> {
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, buffer_count)
            .map_err(|err| self.classify("stream setup", err))?;
        Ok(V4L2Stream {
            stream,
            node: &self.node,
        })
    }
}

/// mmap streaming on a [`V4L2Device`].
pub struct V4L2Stream<'a> {
    stream: Stream<'a>,
    node: &'a Path,
}

impl CaptureStream for V4L2Stream<'_> {
    fn next_frame(&mut self) -> Result<Frame> {
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(err) if is_gone(&err) => {
                return Err(CameraError::DeviceGone(format!(
                    "{} dequeue: {err}",
                    self.node.display()
                )))
            }
            Err(err) => return Err(CameraError::StreamError(err.to_string())),
        };

        // V4L2 timestamps are monotonic and never negative.
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(Frame {
            data: buf.to_vec(),
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unplug_errnos_mean_gone() {
        assert!(is_gone(&io::Error::from_raw_os_error(Errno::ENODEV as i32)));
        assert!(is_gone(&io::Error::from_raw_os_error(Errno::ENXIO as i32)));
        assert!(!is_gone(&io::Error::from_raw_os_error(Errno::EAGAIN as i32)));
        assert!(!is_gone(&io::Error::other("no errno")));
    }

    #[test]
    fn test_open_refuses_non_v4l2_node() {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = dir.path().join("video0");
        std::fs::write(&node, b"").expect("node");
        assert!(matches!(
            V4L2Device::open(&node),
            Err(CameraError::DeviceOpenFailed(_))
        ));
    }
}
