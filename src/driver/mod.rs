//! Device drivers.
//!
//! The set of drivers is closed: a [`Driver`] is either a motor board or a
//! camera, picked from the attached device's kind when it is constructed.
//! Both answer the same four capabilities (identify, configure, acquire,
//! release) plus `open` and `make_safe` for lifecycle handling.

pub mod camera;
pub mod motor;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::DriverSettings;
use crate::device::V4L2Device;
use crate::error::{Error, Result};
use crate::frame_source::{FrameInfo, FrameRequest};
use crate::identity::{Device, DeviceKind};

pub use camera::{CameraDriver, OpenCamera};
pub use motor::{MotorBoardDriver, MotorOptions, MotorPower, MotorStatus};

/// Lifecycle state of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    /// No handle on the peripheral.
    Closed,
    /// Handle open, no target configuration yet.
    Unconfigured,
    /// Configured and able to acquire.
    Ready,
}

impl DriverState {
    /// Lower-case name, as used on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Unconfigured => "unconfigured",
            Self::Ready => "ready",
        }
    }
}

/// Answer to `identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device type.
    pub kind: DeviceKind,
    /// Instance id.
    pub id: String,
    /// Device node.
    pub node: PathBuf,
    /// Human-readable description of the hardware.
    pub description: String,
    /// Current lifecycle state.
    pub state: DriverState,
}

/// Status document sent on connect and on `status` requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Current lifecycle state.
    pub state: DriverState,
    /// Camera target, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<FrameRequest>,
    /// Motor settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motors: Option<MotorStatus>,
}

/// Variant-specific configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Options {
    /// Target geometry and encoding for a camera.
    Camera(FrameRequest),
    /// Motor settings for a motor board.
    Motor(MotorOptions),
}

/// Result of `acquire`.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// Motor board reading.
    Reading(MotorStatus),
    /// Greyscale frame and its bytes.
    Frame(FrameInfo, Vec<u8>),
}

/// One driver instance, bound to one device.
pub enum Driver<D = V4L2Device> {
    /// Motor board.
    Motor(MotorBoardDriver),
    /// Camera.
    Camera(CameraDriver<D>),
}

impl<D: OpenCamera> Driver<D> {
    /// Closed driver of the variant matching `device`'s kind.
    pub fn for_device(device: &Device, settings: &DriverSettings) -> Self {
        match device.kind() {
            DeviceKind::Motor => Self::Motor(MotorBoardDriver::serial(
                &device.key.id,
                &device.node,
                settings.motor.baud_rate,
                settings.motor.timeout,
            )),
            DeviceKind::Camera => Self::Camera(
                CameraDriver::new(&device.key.id, &device.node, settings.camera.buffer_count)
                    .with_max_frame_bytes(settings.camera.max_frame_bytes),
            ),
        }
    }

    /// Open the peripheral and bring it to its default working state: a
    /// camera is configured with `default_target`, a motor board braked.
    pub fn start(&mut self, default_target: FrameRequest) -> Result<()> {
        self.open()?;
        if let Self::Camera(camera) = self {
            camera.configure(default_target)?;
        }
        Ok(())
    }

    /// Describe the device.
    pub fn identify(&self) -> DeviceInfo {
        match self {
            Self::Motor(motor) => motor.identify(),
            Self::Camera(camera) => camera.identify(),
        }
    }

    /// Current status document.
    pub fn status(&self) -> Status {
        match self {
            Self::Motor(motor) => Status {
                state: motor.state(),
                target: None,
                motors: Some(motor.status()),
            },
            Self::Camera(camera) => Status {
                state: camera.state(),
                target: camera.target(),
                motors: None,
            },
        }
    }

    /// Closed -> open.
    pub fn open(&mut self) -> Result<()> {
        match self {
            Self::Motor(motor) => motor.open(),
            Self::Camera(camera) => camera.open(),
        }
    }

    /// Apply variant-specific options.
    pub fn configure(&mut self, options: Options) -> Result<()> {
        match (self, options) {
            (Self::Motor(motor), Options::Motor(options)) => motor.configure(options),
            (Self::Camera(camera), Options::Camera(request)) => camera.configure(request),
            (Self::Motor(_), Options::Camera(_)) => Err(Error::InvalidRequest(
                "camera options sent to a motor board".to_owned(),
            )),
            (Self::Camera(_), Options::Motor(_)) => Err(Error::InvalidRequest(
                "motor options sent to a camera".to_owned(),
            )),
        }
    }

    /// Read the device. Cameras accept a one-off frame request.
    pub fn acquire(&self, request: Option<FrameRequest>) -> Result<Acquisition> {
        match self {
            Self::Motor(_) if request.is_some() => Err(Error::InvalidRequest(
                "motor boards take no frame request".to_owned(),
            )),
            Self::Motor(motor) => motor.acquire().map(Acquisition::Reading),
            Self::Camera(camera) => camera
                .acquire(request)
                .map(|(info, data)| Acquisition::Frame(info, data)),
        }
    }

    /// Any state -> closed.
    pub fn release(&mut self) {
        match self {
            Self::Motor(motor) => motor.release(),
            Self::Camera(camera) => camera.release(),
        }
    }

    /// Put the peripheral in a harmless state; used when the last client
    /// goes away.
    pub fn make_safe(&mut self) -> Result<()> {
        match self {
            Self::Motor(motor) if motor.state() == DriverState::Ready => motor.make_safe(),
            Self::Motor(_) | Self::Camera(_) => Ok(()),
        }
    }
}
