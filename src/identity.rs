//! Device identity and endpoint addressing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// The closed set of peripheral types robotd knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// MCV4B two-channel motor board on a USB serial bridge.
    Motor,
    /// V4L2 capture device.
    Camera,
}

impl DeviceKind {
    /// Directory name under the endpoint root.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Motor => "motor",
            Self::Camera => "camera",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "motor" => Ok(Self::Motor),
            "camera" => Ok(Self::Camera),
            other => Err(Error::InvalidDevice(format!("unknown device kind {other:?}"))),
        }
    }
}

/// What makes two devices "the same device": their kind and instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Device type.
    pub kind: DeviceKind,
    /// Instance id, unique within `kind`.
    pub id: String,
}

impl DeviceKey {
    /// Build a key, refusing ids that cannot be a single path component.
    pub fn new(kind: DeviceKind, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
            return Err(Error::InvalidDevice(format!(
                "{id:?} is not a valid {kind} id"
            )));
        }
        Ok(Self { kind, id })
    }

    /// Endpoint socket path for this device under `root`:
    /// `<root>/<kind>/<id>`.
    pub fn endpoint_path(&self, root: &Path) -> PathBuf {
        root.join(self.kind.as_str()).join(&self.id)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// One attached peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    /// Identity.
    #[serde(flatten)]
    pub key: DeviceKey,
    /// Device node of the raw peripheral (`/dev/video0`, a by-id tty link).
    pub node: PathBuf,
}

impl Device {
    /// Describe a device, validating its id.
    pub fn new(kind: DeviceKind, id: impl Into<String>, node: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            key: DeviceKey::new(kind, id)?,
            node: node.into(),
        })
    }

    /// Device type.
    pub const fn kind(&self) -> DeviceKind {
        self.key.kind
    }

    /// Whether the device node is still present.
    pub fn is_present(&self) -> bool {
        self.node.exists()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.node.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_path_layout() {
        let key = DeviceKey::new(DeviceKind::Camera, "video0").expect("valid id");
        assert_eq!(
            key.endpoint_path(Path::new("/var/robotd")),
            PathBuf::from("/var/robotd/camera/video0")
        );
    }

    #[test]
    fn test_ids_must_be_single_components() {
        for bad in ["", ".", "..", "a/b"] {
            assert!(DeviceKey::new(DeviceKind::Motor, bad).is_err(), "{bad:?}");
        }
        assert!(DeviceKey::new(DeviceKind::Motor, "SR0AB1").is_ok());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("camera".parse::<DeviceKind>().ok(), Some(DeviceKind::Camera));
        assert!("servo".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_device_deserializes_flat() {
        let device: Device =
            serde_json::from_str(r#"{"kind":"motor","id":"SR0AB1","node":"/dev/ttyUSB0"}"#)
                .expect("parse");
        assert_eq!(device.kind(), DeviceKind::Motor);
        assert_eq!(device.key.id, "SR0AB1");
    }
}
