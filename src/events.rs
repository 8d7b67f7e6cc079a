//! Device events and where they come from.
//!
//! The supervisor consumes a single stream of [`SupervisorEvent`]s. Devices
//! enter it from static registration (the `devices` config list) and from a
//! [`PollingWatcher`] that diffs successive scans of `/dev`.

use crossbeam::channel::Sender;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ScanSettings;
use crate::identity::{Device, DeviceKey, DeviceKind};

/// A peripheral appeared or went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device is present and should get a controller.
    Attached(Device),
    /// The device with this key is gone.
    Detached(DeviceKey),
}

/// Everything the supervisor loop reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Attach or detach.
    Device(DeviceEvent),
    /// Detach everything and stop.
    Shutdown,
}

impl From<DeviceEvent> for SupervisorEvent {
    fn from(event: DeviceEvent) -> Self {
        Self::Device(event)
    }
}

/// Attach events for statically registered devices.
pub fn static_events(devices: &[Device]) -> Vec<DeviceEvent> {
    devices.iter().cloned().map(DeviceEvent::Attached).collect()
}

/// Finds devices by listing device directories.
pub struct PollingWatcher {
    settings: ScanSettings,
    known: BTreeMap<DeviceKey, Device>,
    ignored: BTreeSet<DeviceKey>,
}

impl PollingWatcher {
    /// Watcher that has seen nothing yet.
    pub const fn new(settings: ScanSettings) -> Self {
        Self {
            settings,
            known: BTreeMap::new(),
            ignored: BTreeSet::new(),
        }
    }

    /// Leave these devices alone; they are registered statically.
    #[must_use]
    pub fn ignoring<I: IntoIterator<Item = DeviceKey>>(mut self, keys: I) -> Self {
        self.ignored.extend(keys);
        self
    }

    /// Scan once and return what changed since the previous scan: detaches
    /// first, then attaches, each in key order.
    pub fn poll(&mut self) -> Vec<DeviceEvent> {
        let current: BTreeMap<DeviceKey, Device> = scan(&self.settings)
            .into_iter()
            .filter(|device| !self.ignored.contains(&device.key))
            .map(|device| (device.key.clone(), device))
            .collect();

        let mut events: Vec<DeviceEvent> = self
            .known
            .iter()
            .filter(|(key, device)| current.get(*key) != Some(*device))
            .map(|(key, _)| DeviceEvent::Detached(key.clone()))
            .collect();
        events.extend(
            current
                .iter()
                .filter(|(key, device)| self.known.get(*key) != Some(*device))
                .map(|(_, device)| DeviceEvent::Attached(device.clone())),
        );
        self.known = current;
        events
    }

    /// Poll every `interval` on a background thread, forwarding events.
    pub fn spawn(
        mut self,
        interval: Duration,
        events: Sender<SupervisorEvent>,
    ) -> io::Result<WatcherHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("device-watcher".to_owned())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    for event in self.poll() {
                        debug!(?event, "device change");
                        if events.send(event.into()).is_err() {
                            return;
                        }
                    }
                    thread::sleep(interval);
                }
            })?;
        Ok(WatcherHandle {
            handle: Some(handle),
            stop,
        })
    }
}

/// Running watcher thread; stopped and joined on drop.
pub struct WatcherHandle {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WatcherHandle {
    /// Stop polling and wait for the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("device watcher thread panicked");
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Every device currently visible.
pub fn scan(settings: &ScanSettings) -> BTreeSet<Device> {
    let mut found = BTreeSet::new();
    for (name, path) in list(&settings.dev_dir) {
        if name.starts_with("video") && is_capture_node(settings, &name) {
            if let Ok(device) = Device::new(DeviceKind::Camera, name, path) {
                found.insert(device);
            }
        }
    }
    for (name, path) in list(&settings.serial_by_id_dir) {
        if !name.contains(&settings.motor_match) {
            continue;
        }
        match motor_serial(&name).map(|serial| Device::new(DeviceKind::Motor, serial, path)) {
            Some(Ok(device)) => {
                found.insert(device);
            }
            _ => debug!(link = %name, "serial link without a usable serial number"),
        }
    }
    found
}

/// Serial number in a by-id link name such as
/// `usb-Student_Robotics_MCV4B_SR0AB1-if00-port0`.
fn motor_serial(link: &str) -> Option<&str> {
    let tail = link.rsplit('_').next()?;
    let serial = tail.split("-if").next()?;
    (!serial.is_empty() && serial != link).then_some(serial)
}

/// Video nodes other than index 0 are metadata streams, not captures. Nodes
/// without sysfs information are kept.
fn is_capture_node(settings: &ScanSettings, name: &str) -> bool {
    fs::read_to_string(settings.sysfs_video_dir.join(name).join("index"))
        .map_or(true, |index| index.trim() == "0")
}

fn list(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            Some((name, entry.path()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    struct Fixture {
        dir: tempfile::TempDir,
        settings: ScanSettings,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let settings = ScanSettings {
                enabled: true,
                dev_dir: dir.path().join("dev"),
                sysfs_video_dir: dir.path().join("sys"),
                serial_by_id_dir: dir.path().join("by-id"),
                motor_match: "MCV4B".to_owned(),
            };
            fs::create_dir_all(&settings.dev_dir).expect("mkdir");
            fs::create_dir_all(&settings.sysfs_video_dir).expect("mkdir");
            fs::create_dir_all(&settings.serial_by_id_dir).expect("mkdir");
            Self { dir, settings }
        }

        fn video(&self, name: &str, index: u32) -> PathBuf {
            let node = self.settings.dev_dir.join(name);
            fs::write(&node, b"").expect("node");
            let sys = self.settings.sysfs_video_dir.join(name);
            fs::create_dir_all(&sys).expect("sysfs");
            fs::write(sys.join("index"), format!("{index}\n")).expect("index");
            node
        }

        fn serial(&self, link: &str) -> PathBuf {
            let node = self.settings.serial_by_id_dir.join(link);
            fs::write(&node, b"").expect("link");
            node
        }
    }

    #[test]
    fn test_motor_serial_from_link_name() {
        assert_eq!(
            motor_serial("usb-Student_Robotics_MCV4B_SR0AB1-if00-port0"),
            Some("SR0AB1")
        );
        assert_eq!(motor_serial("MCV4B"), None);
    }

    #[test]
    fn test_scan_skips_metadata_nodes_and_other_serials() {
        let fixture = Fixture::new();
        let video0 = fixture.video("video0", 0);
        fixture.video("video1", 1);
        let motor = fixture.serial("usb-Student_Robotics_MCV4B_SR0AB1-if00-port0");
        fixture.serial("usb-FTDI_FT232R_A50285BI-if00-port0");
        fs::write(fixture.settings.dev_dir.join("ttyUSB0"), b"").expect("tty");

        let found: Vec<Device> = scan(&fixture.settings).into_iter().collect();
        assert_eq!(
            found,
            vec![
                Device::new(DeviceKind::Motor, "SR0AB1", motor).expect("motor"),
                Device::new(DeviceKind::Camera, "video0", video0).expect("camera"),
            ]
        );
    }

    #[test]
    fn test_poll_reports_changes_once() {
        let fixture = Fixture::new();
        let mut watcher = PollingWatcher::new(fixture.settings.clone());
        assert!(watcher.poll().is_empty());

        let video0 = fixture.video("video0", 0);
        let events = watcher.poll();
        assert_eq!(
            events,
            vec![DeviceEvent::Attached(
                Device::new(DeviceKind::Camera, "video0", &video0).expect("device")
            )]
        );
        assert!(watcher.poll().is_empty());

        fixture.video("video2", 0);
        fs::remove_file(&video0).expect("unplug");
        let events = watcher.poll();
        assert!(matches!(events.as_slice(), [
            DeviceEvent::Detached(gone),
            DeviceEvent::Attached(new),
        ] if gone.id == "video0" && new.key.id == "video2"));
        drop(fixture.dir);
    }

    #[test]
    fn test_static_devices_are_ignored_by_watcher() {
        let fixture = Fixture::new();
        let node = fixture.video("video0", 0);
        let registered = Device::new(DeviceKind::Camera, "video0", node).expect("device");
        let mut watcher = PollingWatcher::new(fixture.settings.clone())
            .ignoring([registered.key.clone()]);
        assert!(watcher.poll().is_empty());
        assert_eq!(
            static_events(&[registered.clone()]),
            vec![DeviceEvent::Attached(registered)]
        );
    }

    #[test]
    fn test_watcher_thread_forwards_events() {
        let fixture = Fixture::new();
        fixture.video("video0", 0);
        let (tx, rx) = channel::unbounded();
        let mut handle = PollingWatcher::new(fixture.settings.clone())
            .spawn(Duration::from_millis(10), tx)
            .expect("spawn");
        let event = rx.recv_timeout(Duration::from_secs(2)).expect("event");
        assert!(matches!(
            event,
            SupervisorEvent::Device(DeviceEvent::Attached(ref device)) if device.key.id == "video0"
        ));
        handle.stop();
    }
}
