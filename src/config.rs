//! Layered configuration using Figment.
//!
//! Configuration is assembled from, in increasing priority:
//! 1. built-in defaults,
//! 2. an optional TOML file (`--config`),
//! 3. environment variables prefixed with `ROBOTD_`, nested keys separated by
//!    a double underscore (`ROBOTD_SUPERVISOR__MAX_RESTARTS=3`).
//!
//! # Example
//! ```toml
//! root_dir = "/var/robotd"
//!
//! [supervisor]
//! grace_period = "2s"
//! max_restarts = 1
//!
//! [camera]
//! width = 640
//! height = 480
//! format = "YUYV"
//!
//! [[devices]]
//! kind = "motor"
//! id = "SR0AB1"
//! node = "/dev/serial/by-id/usb-Student_Robotics_MCV4B_SR0AB1-if00-port0"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame_source::{FrameRequest, DEFAULT_BUFFER_COUNT, DEFAULT_MAX_FRAME_BYTES};
use crate::identity::{Device, DeviceKey};
use crate::traits::FourCC;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the per-device endpoint sockets.
    pub root_dir: PathBuf,
    /// Supervisor timing and retry policy.
    pub supervisor: SupervisorSettings,
    /// Camera defaults.
    pub camera: CameraSettings,
    /// Motor board link settings.
    pub motor: MotorSettings,
    /// Device discovery.
    pub scan: ScanSettings,
    /// Log output.
    pub logging: LoggingConfig,
    /// Devices attached at startup regardless of discovery.
    pub devices: Vec<Device>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/robotd"),
            supervisor: SupervisorSettings::default(),
            camera: CameraSettings::default(),
            motor: MotorSettings::default(),
            scan: ScanSettings::default(),
            logging: LoggingConfig::default(),
            devices: Vec::new(),
        }
    }
}

/// Supervisor timing and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// How often controller processes are reaped and discovery re-run.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Time a controller gets to exit after SIGTERM before it is killed.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Time a new controller gets to bind its endpoint.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Respawns allowed after a controller crash before the device is marked
    /// failed.
    pub max_restarts: u32,
    /// Delay before the first respawn; doubled for each further attempt.
    #[serde(with = "humantime_serde")]
    pub restart_backoff: Duration,
    /// Program to run as the controller process; defaults to this executable.
    pub controller_exe: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            grace_period: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(5),
            max_restarts: 1,
            restart_backoff: Duration::from_secs(1),
            controller_exe: None,
        }
    }
}

/// Camera defaults applied when a camera controller starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Default frame width.
    pub width: u32,
    /// Default frame height.
    pub height: u32,
    /// Pixel encoding asked of the camera.
    pub format: FourCC,
    /// Buffers queued per capture.
    pub buffer_count: u32,
    /// Largest greyscale frame a client may ask for, in bytes.
    pub max_frame_bytes: usize,
    /// Drive cameras with the simulated device instead of V4L2.
    pub simulate: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: FourCC::YUYV,
            buffer_count: DEFAULT_BUFFER_COUNT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            simulate: false,
        }
    }
}

impl CameraSettings {
    /// The frame request a freshly started camera is configured with.
    pub const fn default_request(&self) -> FrameRequest {
        FrameRequest::new(self.width, self.height).with_format(self.format)
    }
}

/// Motor board serial link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Serial write timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            baud_rate: 1_000_000,
            timeout: Duration::from_millis(100),
        }
    }
}

/// The part of the configuration a controller process needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverSettings {
    /// Camera defaults.
    pub camera: CameraSettings,
    /// Motor link settings.
    pub motor: MotorSettings,
}

/// Device discovery by polling `/dev`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Whether the polling watcher runs at all.
    pub enabled: bool,
    /// Where `video*` nodes live.
    pub dev_dir: PathBuf,
    /// Sysfs class directory used to skip metadata-only video nodes.
    pub sysfs_video_dir: PathBuf,
    /// Stable serial port links.
    pub serial_by_id_dir: PathBuf,
    /// Substring identifying motor boards among serial links.
    pub motor_match: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dev_dir: PathBuf::from("/dev"),
            sysfs_video_dir: PathBuf::from("/sys/class/video4linux"),
            serial_by_id_dir: PathBuf::from("/dev/serial/by-id"),
            motor_match: "MCV4B".to_owned(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Single-line human-readable records.
    #[default]
    Compact,
    /// One JSON object per record.
    Json,
}

/// Log output settings. `RUST_LOG` overrides `level` when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Compact,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("ROBOTD_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(Error::Configuration(format!(
                "camera geometry {}x{} is empty",
                self.camera.width, self.camera.height
            )));
        }
        if self.camera.default_request().frame_len() > self.camera.max_frame_bytes {
            return Err(Error::Configuration(format!(
                "camera geometry {}x{} exceeds max_frame_bytes ({})",
                self.camera.width, self.camera.height, self.camera.max_frame_bytes
            )));
        }
        if self.camera.format.bytes_per_pixel().is_none() {
            return Err(Error::Configuration(format!(
                "camera format {} is not supported (use YUYV, BGR3, RGB3 or GREY)",
                self.camera.format
            )));
        }
        if self.supervisor.grace_period.is_zero() || self.supervisor.ready_timeout.is_zero() {
            return Err(Error::Configuration(
                "grace_period and ready_timeout must be non-zero".to_owned(),
            ));
        }
        if self.supervisor.poll_interval.is_zero() {
            return Err(Error::Configuration("poll_interval must be non-zero".to_owned()));
        }
        for device in &self.devices {
            DeviceKey::new(device.key.kind, device.key.id.clone())?;
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(Error::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }

    /// Settings handed to drivers.
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            camera: self.camera.clone(),
            motor: self.motor.clone(),
        }
    }
}
