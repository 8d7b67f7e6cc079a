//! Camera driver: the Closed / Open / Ready state machine around a
//! [`FrameSource`].

use std::path::{Path, PathBuf};
use tracing::info;

use super::{DeviceInfo, DriverState};
use crate::device::V4L2Device;
use crate::error::{Error, Result};
use crate::frame_source::{FrameInfo, FrameRequest, FrameSource, DEFAULT_MAX_FRAME_BYTES};
use crate::identity::DeviceKind;
use crate::mock::MockDevice;
use crate::traits::{self, CameraDevice, CameraError};

/// Cameras that can be opened from a device node.
pub trait OpenCamera: CameraDevice + Sized {
    /// Open the camera behind `node`.
    fn open_node(node: &Path) -> traits::Result<Self>;
}

impl OpenCamera for V4L2Device {
    fn open_node(node: &Path) -> traits::Result<Self> {
        Self::open(node)
    }
}

impl OpenCamera for MockDevice {
    /// The simulated camera only needs its node to exist.
    fn open_node(node: &Path) -> traits::Result<Self> {
        if node.exists() {
            Ok(Self::new())
        } else {
            Err(CameraError::DeviceOpenFailed(format!(
                "{} does not exist",
                node.display()
            )))
        }
    }
}

/// Driver for one camera.
pub struct CameraDriver<D> {
    id: String,
    node: PathBuf,
    buffer_count: u32,
    max_frame_bytes: usize,
    source: Option<FrameSource<D>>,
    target: Option<FrameRequest>,
}

impl<D: OpenCamera> CameraDriver<D> {
    /// A closed driver for the camera at `node`.
    pub fn new(id: &str, node: &Path, buffer_count: u32) -> Self {
        Self {
            id: id.to_owned(),
            node: node.to_owned(),
            buffer_count,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            source: None,
            target: None,
        }
    }

    /// Refuse geometries whose greyscale frame exceeds `bytes`.
    #[must_use]
    pub const fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub(crate) fn state(&self) -> DriverState {
        match (&self.source, &self.target) {
            (None, _) => DriverState::Closed,
            (Some(_), None) => DriverState::Unconfigured,
            (Some(_), Some(_)) => DriverState::Ready,
        }
    }

    pub(crate) fn identify(&self) -> DeviceInfo {
        let description = self.source.as_ref().map_or_else(
            || "camera (closed)".to_owned(),
            |source| {
                let caps = source.capabilities();
                format!("{} [{}] at {}", caps.card, caps.driver, caps.bus_info)
            },
        );
        DeviceInfo {
            kind: DeviceKind::Camera,
            id: self.id.clone(),
            node: self.node.clone(),
            description,
            state: self.state(),
        }
    }

    /// Persistent target, if configured.
    pub(crate) fn target(&self) -> Option<FrameRequest> {
        self.target
    }

    /// Closed -> Open. Opening an open camera keeps its configuration.
    pub(crate) fn open(&mut self) -> Result<()> {
        if self.source.is_none() {
            let device = D::open_node(&self.node).map_err(|err| match err {
                CameraError::DeviceOpenFailed(reason) | CameraError::DeviceGone(reason) => {
                    Error::DeviceUnavailable(reason)
                }
                other => Error::Camera(other),
            })?;
            self.source = Some(FrameSource::new(device).with_buffer_count(self.buffer_count));
            self.target = None;
            info!(camera = %self.id, node = %self.node.display(), "camera open");
        }
        Ok(())
    }

    /// Open -> Ready, or re-target a Ready camera. The device must accept the
    /// geometry as asked; a clamped answer leaves the previous target in place.
    pub(crate) fn configure(&mut self, request: FrameRequest) -> Result<()> {
        let source = self
            .source
            .as_ref()
            .ok_or(Error::NotReady(DriverState::Closed.as_str()))?;
        request.checked_len(self.max_frame_bytes)?;
        source.configure(&request)?;
        self.target = Some(request);
        info!(
            camera = %self.id,
            width = request.width,
            height = request.height,
            format = %request.format,
            "camera configured"
        );
        Ok(())
    }

    /// Capture one frame, with the configured target or a one-off override.
    pub(crate) fn acquire(&self, request: Option<FrameRequest>) -> Result<(FrameInfo, Vec<u8>)> {
        let (source, target) = match (&self.source, self.target) {
            (None, _) => return Err(Error::NotReady(DriverState::Closed.as_str())),
            (Some(_), None) => return Err(Error::NotReady(DriverState::Unconfigured.as_str())),
            (Some(source), Some(target)) => (source, target),
        };
        let request = request.unwrap_or(target);
        let mut buffer = vec![0u8; request.checked_len(self.max_frame_bytes)?];
        let info = source.capture(&request, &mut buffer)?;
        Ok((info, buffer))
    }

    /// Any state -> Closed.
    pub(crate) fn release(&mut self) {
        if self.source.take().is_some() {
            info!(camera = %self.id, "camera released");
        }
        self.target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FourCC;

    fn driver() -> (CameraDriver<MockDevice>, tempfile::NamedTempFile) {
        let node = tempfile::NamedTempFile::new().expect("temp node");
        (CameraDriver::new("video0", node.path(), 2), node)
    }

    #[test]
    fn test_state_machine() {
        let (mut camera, _node) = driver();
        assert_eq!(camera.state(), DriverState::Closed);

        camera.open().expect("open");
        assert_eq!(camera.state(), DriverState::Unconfigured);

        camera.configure(FrameRequest::new(64, 48)).expect("configure");
        assert_eq!(camera.state(), DriverState::Ready);

        let (info, data) = camera.acquire(None).expect("acquire");
        assert_eq!((info.width, info.height), (64, 48));
        assert_eq!(data.len(), 64 * 48);
        assert_eq!(camera.state(), DriverState::Ready);

        camera.release();
        assert_eq!(camera.state(), DriverState::Closed);
    }

    #[test]
    fn test_acquire_before_ready_fails() {
        let (mut camera, _node) = driver();
        assert!(matches!(camera.acquire(None), Err(Error::NotReady("closed"))));

        camera.open().expect("open");
        assert!(matches!(
            camera.acquire(None),
            Err(Error::NotReady("unconfigured"))
        ));
    }

    #[test]
    fn test_configure_closed_fails() {
        let (mut camera, _node) = driver();
        assert!(matches!(
            camera.configure(FrameRequest::new(8, 8)),
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn test_override_request_is_one_off() {
        let (mut camera, _node) = driver();
        camera.open().expect("open");
        camera.configure(FrameRequest::new(32, 32)).expect("configure");

        let one_off = FrameRequest::new(16, 8).with_format(FourCC::BGR3);
        let (info, data) = camera.acquire(Some(one_off)).expect("acquire");
        assert_eq!((info.width, info.height, data.len()), (16, 8, 128));
        assert_eq!(camera.target(), Some(FrameRequest::new(32, 32)));
    }

    #[test]
    fn test_out_of_range_geometry_is_refused() {
        let (camera, _node) = driver();
        let mut camera = camera.with_max_frame_bytes(64 * 64);
        camera.open().expect("open");
        camera.configure(FrameRequest::new(32, 32)).expect("configure");

        for request in [
            FrameRequest::new(u32::MAX, u32::MAX),
            FrameRequest::new(0, 16),
            FrameRequest::new(16, 0),
            FrameRequest::new(65, 64),
        ] {
            assert!(matches!(
                camera.acquire(Some(request)),
                Err(Error::InvalidRequest(_))
            ));
            assert!(matches!(
                camera.configure(request),
                Err(Error::InvalidRequest(_))
            ));
        }

        assert_eq!(camera.state(), DriverState::Ready);
        assert_eq!(camera.target(), Some(FrameRequest::new(32, 32)));
        let (_, data) = camera.acquire(Some(FrameRequest::new(64, 64))).expect("acquire");
        assert_eq!(data.len(), 64 * 64);
    }

    #[test]
    fn test_missing_node_is_unavailable() {
        let mut camera: CameraDriver<MockDevice> =
            CameraDriver::new("video9", Path::new("/nonexistent/video9"), 2);
        assert!(matches!(camera.open(), Err(Error::DeviceUnavailable(_))));
        assert_eq!(camera.state(), DriverState::Closed);
    }
}
