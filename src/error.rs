//! Crate-wide error type.
//!
//! `Error` is what every fallible operation in robotd returns. Capture
//! failures are deliberately fine-grained: each check of the frame pipeline
//! has its own variant carrying the values needed to diagnose it, and each
//! variant maps to a stable [`ErrorCode`] so a client on the other end of an
//! endpoint sees the same distinction.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::traits::{CameraError, FourCC};

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Width and height pair used in diagnostics.
pub type Geometry = (u32, u32);

/// Everything that can go wrong inside robotd.
#[derive(Error, Debug)]
pub enum Error {
    /// Something already exists at the endpoint path.
    #[error("Endpoint address already in use: {}", .0.display())]
    AddressInUse(PathBuf),

    /// The filesystem refused access to the endpoint path.
    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// The driver is not in a state that allows the call.
    #[error("Driver not ready (state: {0})")]
    NotReady(&'static str),

    /// The peripheral is missing, unplugged or not open.
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device settled on a different geometry than requested.
    #[error(
        "Device rejected configuration: requested {}x{}, device reports {}x{}",
        .requested.0, .requested.1, .actual.0, .actual.1
    )]
    ConfigurationRejected {
        /// Geometry asked for.
        requested: Geometry,
        /// Geometry the device reported back.
        actual: Geometry,
    },

    /// The converted frame has padded rows.
    #[error("Frame buffer is not contiguous: width {width}, row stride {stride}")]
    NonContiguousBuffer {
        /// Visible pixels per row.
        width: u32,
        /// Pixels per row including padding.
        stride: u32,
    },

    /// The processed frame does not have the requested size.
    #[error(
        "Frame dimension mismatch: {}x{} expected, {}x{} actual",
        .expected.0, .expected.1, .actual.0, .actual.1
    )]
    DimensionMismatch {
        /// Requested geometry.
        expected: Geometry,
        /// Geometry of the processed frame.
        actual: Geometry,
    },

    /// The caller buffer is not exactly one frame long.
    #[error("Caller buffer holds {actual} bytes, frame needs exactly {expected}")]
    BufferSizeMismatch {
        /// Frame size in bytes.
        expected: usize,
        /// Caller buffer size in bytes.
        actual: usize,
    },

    /// The device delivers an encoding the pipeline cannot convert.
    #[error("Pixel format {0} is not supported by the capture pipeline")]
    UnsupportedPixelFormat(FourCC),

    /// A controller process exited abnormally or never became ready.
    #[error("Controller for {device} crashed: {reason}")]
    ControllerCrashed {
        /// Device key, `<kind>/<id>`.
        device: String,
        /// Exit status or startup failure.
        reason: String,
    },

    /// A packet could not be parsed as a request.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A well-formed request carries values the driver refuses.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A device identity that cannot name an endpoint.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// A message does not fit in one endpoint packet.
    #[error("Message of {size} bytes exceeds the endpoint packet limit")]
    MessageTooLarge {
        /// Encoded message size in bytes.
        size: usize,
    },

    /// Low-level camera failure.
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    /// Motor board serial link failure.
    #[error("Serial link error: {0}")]
    Link(#[from] serialport::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds unusable values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

/// Stable, machine-readable error codes carried in `error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// See [`Error::AddressInUse`].
    AddressInUse,
    /// See [`Error::PermissionDenied`].
    PermissionDenied,
    /// See [`Error::NotReady`].
    NotReady,
    /// Device missing, unplugged, or its link failed.
    DeviceUnavailable,
    /// See [`Error::ConfigurationRejected`].
    ConfigurationRejected,
    /// See [`Error::NonContiguousBuffer`].
    NonContiguousBuffer,
    /// See [`Error::DimensionMismatch`].
    DimensionMismatch,
    /// See [`Error::BufferSizeMismatch`].
    BufferSizeMismatch,
    /// See [`Error::UnsupportedPixelFormat`].
    UnsupportedPixelFormat,
    /// See [`Error::ControllerCrashed`].
    ControllerCrashed,
    /// Unparseable packet or unknown op; the session is closed after it.
    ProtocolError,
    /// Request values refused by the driver.
    InvalidRequest,
    /// See [`Error::MessageTooLarge`].
    MessageTooLarge,
    /// Anything else, details in the message.
    Internal,
}

impl Error {
    /// The wire code for this error.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AddressInUse(_) => ErrorCode::AddressInUse,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::NotReady(_) => ErrorCode::NotReady,
            Self::DeviceUnavailable(_) | Self::Link(_) => ErrorCode::DeviceUnavailable,
            Self::ConfigurationRejected { .. } => ErrorCode::ConfigurationRejected,
            Self::NonContiguousBuffer { .. } => ErrorCode::NonContiguousBuffer,
            Self::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            Self::BufferSizeMismatch { .. } => ErrorCode::BufferSizeMismatch,
            Self::UnsupportedPixelFormat(_) => ErrorCode::UnsupportedPixelFormat,
            Self::ControllerCrashed { .. } => ErrorCode::ControllerCrashed,
            Self::ProtocolError(_) | Self::Json(_) => ErrorCode::ProtocolError,
            Self::InvalidRequest(_) | Self::InvalidDevice(_) => ErrorCode::InvalidRequest,
            Self::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            Self::Camera(CameraError::DeviceGone(_)) => ErrorCode::DeviceUnavailable,
            Self::Camera(_) | Self::Config(_) | Self::Configuration(_) | Self::Io(_) => {
                ErrorCode::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_failures_have_distinct_codes() {
        let codes = [
            Error::ConfigurationRejected {
                requested: (320, 240),
                actual: (640, 480),
            }
            .code(),
            Error::NonContiguousBuffer {
                width: 4,
                stride: 8,
            }
            .code(),
            Error::DimensionMismatch {
                expected: (4, 4),
                actual: (4, 3),
            }
            .code(),
            Error::DeviceUnavailable("gone".to_owned()).code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_dimension_mismatch_reports_both_sides() {
        let err = Error::DimensionMismatch {
            expected: (320, 240),
            actual: (320, 238),
        };
        assert_eq!(
            err.to_string(),
            "Frame dimension mismatch: 320x240 expected, 320x238 actual"
        );
    }

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::ConfigurationRejected).expect("serialize");
        assert_eq!(json, "\"configuration_rejected\"");
    }
}
