//! robotd: peripheral-management daemon for robot hardware.
//!
//! Each attached peripheral (a motor board, one or more cameras) gets its own
//! controller process serving a `SOCK_SEQPACKET` endpoint at
//! `<root_dir>/<kind>/<id>`. A supervisor tracks attach and detach events,
//! starts and stops controllers, and restarts crashed ones a bounded number
//! of times.
//!
//! Cameras sit behind the [`CameraDevice`] trait so the whole capture
//! pipeline runs the same against real V4L2 hardware and the simulated
//! [`mock::MockDevice`].

pub mod config;
pub mod controller;
pub mod device;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod frame_source;
pub mod identity;
pub mod imgproc;
pub mod logging;
pub mod mock;
pub mod protocol;
pub mod signals;
pub mod supervisor;
pub mod traits;
pub mod validation;

pub use config::Config;
pub use device::V4L2Device;
pub use driver::{Driver, DriverState};
pub use endpoint::{Client, Endpoint};
pub use error::{Error, ErrorCode, Result};
pub use frame_source::{FrameInfo, FrameRequest, FrameSource};
pub use identity::{Device, DeviceKey, DeviceKind};
pub use protocol::{Reply, Request, Response};
pub use supervisor::Supervisor;
pub use traits::{CameraDevice, CaptureStream, DeviceCapabilities, Format, FourCC, Frame};
