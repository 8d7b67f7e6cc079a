//! MCV4B motor board: a write-only packet codec over a USB serial bridge.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::{DeviceInfo, DriverState};
use crate::error::{Error, Result};
use crate::identity::DeviceKind;

/// Both motors to brake.
const MAKE_SAFE_PACKET: [u8; 5] = [0x00, 0x02, 0x02, 0x03, 0x02];

/// Writable byte sink standing in for the serial port.
pub type Link = Box<dyn Write + Send>;

/// Opens the link for a device node.
pub type LinkOpener = Box<dyn Fn(&Path) -> Result<Link> + Send>;

/// Non-speed motor modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Let the motor spin freely.
    Coast,
    /// Short the motor windings.
    Brake,
}

/// Power setting for one motor: a mode or a speed in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MotorPower {
    /// Coast or brake.
    Mode(Mode),
    /// Signed fraction of full power.
    Speed(f32),
}

impl MotorPower {
    /// Wire byte for this setting.
    pub fn to_byte(self) -> Result<u8> {
        match self {
            Self::Mode(Mode::Coast) => Ok(1),
            Self::Mode(Mode::Brake) => Ok(2),
            Self::Speed(value) if (-1.0..=1.0).contains(&value) => {
                #[allow(clippy::cast_possible_truncation)]
                let offset = (100.0 * value) as i32;
                u8::try_from(128 + offset)
                    .map_err(|_| Error::InvalidRequest(format!("speed {value} out of range")))
            }
            Self::Speed(value) => Err(Error::InvalidRequest(format!(
                "unknown speed value: {value}"
            ))),
        }
    }
}

/// Latest settings of both motors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorStatus {
    /// Motor 0.
    pub m0: MotorPower,
    /// Motor 1.
    pub m1: MotorPower,
}

impl MotorStatus {
    const SAFE: Self = Self {
        m0: MotorPower::Mode(Mode::Brake),
        m1: MotorPower::Mode(Mode::Brake),
    };

    /// Actuation packet carrying both settings.
    pub fn packet(&self) -> Result<[u8; 12]> {
        Ok([
            2,
            2,
            3,
            2,
            2,
            1,
            3,
            1,
            2,
            self.m0.to_byte()?,
            3,
            self.m1.to_byte()?,
        ])
    }
}

/// Partial update of motor settings; absent motors keep their value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorOptions {
    /// New setting for motor 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m0: Option<MotorPower>,
    /// New setting for motor 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m1: Option<MotorPower>,
}

/// Driver for one motor board.
pub struct MotorBoardDriver {
    id: String,
    node: PathBuf,
    opener: LinkOpener,
    link: Option<Link>,
    status: MotorStatus,
}

impl MotorBoardDriver {
    /// Driver talking to the board through its serial port.
    pub fn serial(id: &str, node: &Path, baud_rate: u32, timeout: Duration) -> Self {
        Self::with_opener(
            id,
            node,
            Box::new(move |node: &Path| {
                let port = serialport::new(node.to_string_lossy(), baud_rate)
                    .timeout(timeout)
                    .open()?;
                Ok(Box::new(port) as Link)
            }),
        )
    }

    /// Driver using a custom link, e.g. an in-memory sink.
    pub fn with_opener(id: &str, node: &Path, opener: LinkOpener) -> Self {
        Self {
            id: id.to_owned(),
            node: node.to_owned(),
            opener,
            link: None,
            status: MotorStatus::SAFE,
        }
    }

    pub(crate) const fn state(&self) -> DriverState {
        if self.link.is_some() {
            DriverState::Ready
        } else {
            DriverState::Closed
        }
    }

    pub(crate) fn identify(&self) -> DeviceInfo {
        DeviceInfo {
            kind: DeviceKind::Motor,
            id: self.id.clone(),
            node: self.node.clone(),
            description: "MCV4B motor board".to_owned(),
            state: self.state(),
        }
    }

    pub(crate) const fn status(&self) -> MotorStatus {
        self.status
    }

    /// Open the link and brake both motors.
    pub(crate) fn open(&mut self) -> Result<()> {
        if self.link.is_none() {
            let link = (self.opener)(&self.node).map_err(|err| match err {
                Error::Link(err) => Error::DeviceUnavailable(err.to_string()),
                other => other,
            })?;
            self.link = Some(link);
            info!(board = %self.id, "motor link open");
        }
        self.make_safe()
    }

    /// Merge `options` into the current settings and send them.
    pub(crate) fn configure(&mut self, options: MotorOptions) -> Result<()> {
        let next = MotorStatus {
            m0: options.m0.unwrap_or(self.status.m0),
            m1: options.m1.unwrap_or(self.status.m1),
        };
        let packet = next.packet()?;
        self.write(&packet)?;
        self.status = next;
        Ok(())
    }

    /// Current settings as a reading.
    pub(crate) fn acquire(&self) -> Result<MotorStatus> {
        if self.link.is_none() {
            return Err(Error::NotReady(DriverState::Closed.as_str()));
        }
        Ok(self.status)
    }

    /// Brake both motors.
    pub(crate) fn make_safe(&mut self) -> Result<()> {
        self.write(&MAKE_SAFE_PACKET)?;
        self.status = MotorStatus::SAFE;
        Ok(())
    }

    /// Brake and close the link.
    pub(crate) fn release(&mut self) {
        if self.link.is_some() {
            if let Err(err) = self.make_safe() {
                warn!(board = %self.id, error = %err, "could not brake motors on release");
            }
        }
        self.link = None;
    }

    fn write(&mut self, packet: &[u8]) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or(Error::NotReady(DriverState::Closed.as_str()))?;
        link.write_all(packet)
            .and_then(|()| link.flush())
            .map_err(|err| Error::DeviceUnavailable(format!("motor link: {err}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory link shared with the test.
    #[derive(Clone, Default)]
    pub(crate) struct SharedSink(pub(crate) Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn driver_with_sink() -> (MotorBoardDriver, SharedSink) {
        let sink = SharedSink::default();
        let opened = sink.clone();
        let driver = MotorBoardDriver::with_opener(
            "SR0AB1",
            Path::new("/dev/null"),
            Box::new(move |_| Ok(Box::new(opened.clone()) as Link)),
        );
        (driver, sink)
    }

    #[test]
    fn test_power_bytes() {
        assert_eq!(MotorPower::Mode(Mode::Coast).to_byte().ok(), Some(1));
        assert_eq!(MotorPower::Mode(Mode::Brake).to_byte().ok(), Some(2));
        assert_eq!(MotorPower::Speed(0.0).to_byte().ok(), Some(128));
        assert_eq!(MotorPower::Speed(1.0).to_byte().ok(), Some(228));
        assert_eq!(MotorPower::Speed(-1.0).to_byte().ok(), Some(28));
        assert_eq!(MotorPower::Speed(0.555).to_byte().ok(), Some(183));
        assert!(MotorPower::Speed(1.5).to_byte().is_err());
        assert!(MotorPower::Speed(f32::NAN).to_byte().is_err());
    }

    #[test]
    fn test_power_json_forms() {
        let parsed: MotorOptions =
            serde_json::from_str(r#"{"m0": "coast", "m1": -0.5}"#).expect("parse");
        assert_eq!(parsed.m0, Some(MotorPower::Mode(Mode::Coast)));
        assert_eq!(parsed.m1, Some(MotorPower::Speed(-0.5)));
    }

    #[test]
    fn test_open_brakes_motors() {
        let (mut driver, sink) = driver_with_sink();
        driver.open().expect("open");
        assert_eq!(*sink.0.lock(), MAKE_SAFE_PACKET.to_vec());
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[test]
    fn test_configure_sends_full_packet() {
        let (mut driver, sink) = driver_with_sink();
        driver.open().expect("open");
        sink.0.lock().clear();

        driver
            .configure(MotorOptions {
                m0: Some(MotorPower::Speed(0.5)),
                m1: None,
            })
            .expect("configure");
        assert_eq!(*sink.0.lock(), vec![2, 2, 3, 2, 2, 1, 3, 1, 2, 178, 3, 2]);
        assert_eq!(
            driver.acquire().expect("reading").m0,
            MotorPower::Speed(0.5)
        );
    }

    #[test]
    fn test_invalid_speed_leaves_state_untouched() {
        let (mut driver, sink) = driver_with_sink();
        driver.open().expect("open");
        sink.0.lock().clear();

        let err = driver
            .configure(MotorOptions {
                m0: Some(MotorPower::Speed(2.0)),
                m1: None,
            })
            .expect_err("must fail");
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(sink.0.lock().is_empty());
        assert_eq!(driver.status(), MotorStatus::SAFE);
    }

    #[test]
    fn test_closed_board_is_not_ready() {
        let (mut driver, _sink) = driver_with_sink();
        assert!(matches!(driver.acquire(), Err(Error::NotReady(_))));
        assert!(matches!(
            driver.configure(MotorOptions::default()),
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn test_release_brakes_then_closes() {
        let (mut driver, sink) = driver_with_sink();
        driver.open().expect("open");
        driver
            .configure(MotorOptions {
                m0: Some(MotorPower::Speed(1.0)),
                m1: Some(MotorPower::Speed(1.0)),
            })
            .expect("configure");
        sink.0.lock().clear();

        driver.release();
        assert_eq!(*sink.0.lock(), MAKE_SAFE_PACKET.to_vec());
        assert_eq!(driver.state(), DriverState::Closed);
    }
}
