//! Supervisor: the single owner of which devices are live.
//!
//! Every live device has exactly one controller process, started through a
//! [`Launcher`], and one endpoint at `<root_dir>/<kind>/<id>`. The supervisor
//! reacts to attach and detach events in arrival order and, on every tick,
//! reaps exited controllers and restarts crashed ones with exponential backoff
//! until `max_restarts` is used up. A device whose controller keeps crashing
//! stays in the table as failed until it is detached or attached again.

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SupervisorSettings};
use crate::endpoint;
use crate::error::{Error, Result};
use crate::events::{static_events, DeviceEvent, PollingWatcher, SupervisorEvent};
use crate::identity::{Device, DeviceKey};
use crate::signals;

const READY_POLL: Duration = Duration::from_millis(10);

/// How a controller process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited with this status code.
    Code(i32),
    /// Killed by this signal.
    Signal(i32),
}

impl ExitReason {
    /// Exit status 0.
    pub const fn is_clean(self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        status
            .code()
            .map_or_else(|| Self::Signal(status.signal().unwrap_or(0)), Self::Code)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit status {code}"),
            Self::Signal(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// A running controller process.
pub trait ControllerProcess {
    /// OS process id.
    fn pid(&self) -> u32;
    /// Exit reason if the process has ended; never blocks.
    fn try_exit(&mut self) -> io::Result<Option<ExitReason>>;
    /// Ask the process to stop (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;
    /// Force the process to stop (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;
    /// Block until the process has ended.
    fn wait(&mut self) -> io::Result<ExitReason>;
}

/// Starts controller processes.
pub trait Launcher {
    /// Process handle type.
    type Process: ControllerProcess;

    /// Start a controller serving `device` on `endpoint`. Readiness is
    /// checked by the caller.
    fn launch(&mut self, device: &Device, endpoint: &Path) -> io::Result<Self::Process>;
}

/// Launches controllers by re-running a `robotd` executable with the
/// `controller` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
    config: Option<PathBuf>,
}

impl ProcessLauncher {
    /// Launcher running `exe`, handing it the same configuration file.
    pub const fn new(exe: PathBuf, config: Option<PathBuf>) -> Self {
        Self { exe, config }
    }

    /// Launcher running the current executable.
    pub fn current(config: Option<PathBuf>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config))
    }
}

impl Launcher for ProcessLauncher {
    type Process = OsProcess;

    fn launch(&mut self, device: &Device, endpoint: &Path) -> io::Result<OsProcess> {
        let mut command = Command::new(&self.exe);
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        let child = command
            .arg("controller")
            .arg("--kind")
            .arg(device.kind().as_str())
            .arg("--id")
            .arg(&device.key.id)
            .arg("--node")
            .arg(&device.node)
            .arg("--endpoint")
            .arg(endpoint)
            .stdin(Stdio::null())
            .spawn()?;
        debug!(device = %device.key, pid = child.id(), "controller spawned");
        Ok(OsProcess { child })
    }
}

/// Controller running as a child process.
#[derive(Debug)]
pub struct OsProcess {
    child: Child,
}

impl ControllerProcess for OsProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<ExitReason>> {
        Ok(self.child.try_wait()?.map(ExitReason::from))
    }

    fn terminate(&mut self) -> io::Result<()> {
        let pid = i32::try_from(self.child.id())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(errno.into()),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<ExitReason> {
        Ok(self.child.wait()?.into())
    }
}

/// What the supervisor knows about one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Controller running with this pid.
    Running {
        /// Controller pid.
        pid: u32,
    },
    /// Controller crashed; restart number `attempt` is pending.
    Restarting {
        /// Restart attempt, starting at 1.
        attempt: u32,
    },
    /// Restarts exhausted; nothing runs for this device.
    Failed,
}

enum State<P> {
    Running(P),
    Backoff { until: Instant },
    Failed,
}

struct Record<P> {
    device: Device,
    endpoint: PathBuf,
    state: State<P>,
    restarts: u32,
}

/// Owner of the live-device table.
pub struct Supervisor<L: Launcher> {
    launcher: L,
    root_dir: PathBuf,
    settings: SupervisorSettings,
    records: BTreeMap<DeviceKey, Record<L::Process>>,
}

impl<L: Launcher> Supervisor<L> {
    /// Supervisor placing endpoints under `root_dir`.
    pub const fn new(launcher: L, root_dir: PathBuf, settings: SupervisorSettings) -> Self {
        Self {
            launcher,
            root_dir,
            settings,
            records: BTreeMap::new(),
        }
    }

    /// Create the endpoint root and clear anything an earlier run left in it.
    pub fn prepare_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root_dir)?;
        fs::set_permissions(&self.root_dir, fs::Permissions::from_mode(0o755))?;
        for entry in fs::read_dir(&self.root_dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            debug!(path = %path.display(), "removed leftover endpoint state");
        }
        Ok(())
    }

    /// Status of `key`, if the supervisor tracks it.
    pub fn status(&self, key: &DeviceKey) -> Option<DeviceStatus> {
        self.records.get(key).map(|record| match &record.state {
            State::Running(process) => DeviceStatus::Running {
                pid: process.pid(),
            },
            State::Backoff { .. } => DeviceStatus::Restarting {
                attempt: record.restarts,
            },
            State::Failed => DeviceStatus::Failed,
        })
    }

    /// Number of devices with a running controller.
    pub fn live_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| matches!(record.state, State::Running(_)))
            .count()
    }

    /// A device appeared: start its controller.
    pub fn on_attach(&mut self, device: Device) {
        match self.records.get(&device.key) {
            Some(record) if !matches!(record.state, State::Failed) => {
                error!(
                    device = %device.key,
                    "attach for a device that is already live, ignoring"
                );
                return;
            }
            Some(_) => info!(device = %device.key, "re-attaching failed device"),
            None => info!(device = %device, "device attached"),
        }
        let record = Record {
            endpoint: device.key.endpoint_path(&self.root_dir),
            device,
            state: State::Failed,
            restarts: 0,
        };
        let key = record.device.key.clone();
        let record = self.start(record);
        self.records.insert(key, record);
    }

    /// A device went away: stop its controller and remove its endpoint.
    pub fn on_detach(&mut self, key: &DeviceKey) {
        let Some(record) = self.records.remove(key) else {
            info!(device = %key, "detach for unknown device, ignoring");
            return;
        };
        if let State::Running(process) = record.state {
            self.stop(key, process);
        }
        remove_endpoint(key, &record.endpoint);
        info!(device = %key, "device detached");
    }

    /// A controller ended. A clean exit detaches the device; a crash while
    /// the device is still plugged in schedules a restart or marks it failed.
    pub fn on_controller_exit(&mut self, key: &DeviceKey, reason: ExitReason) {
        let Some(record) = self.records.remove(key) else {
            return;
        };
        remove_endpoint(key, &record.endpoint);
        if reason.is_clean() {
            info!(device = %key, "controller exited, device detached");
        } else if !record.device.is_present() {
            info!(device = %key, %reason, "controller exited after its device went away");
        } else {
            let record = self.crashed(record, &reason.to_string());
            self.records.insert(key.clone(), record);
        }
    }

    /// Reap exited controllers and start restarts that are due.
    pub fn tick(&mut self) {
        let mut exited = Vec::new();
        for (key, record) in &mut self.records {
            if let State::Running(process) = &mut record.state {
                match process.try_exit() {
                    Ok(Some(reason)) => exited.push((key.clone(), reason)),
                    Ok(None) => {}
                    Err(err) => warn!(device = %key, error = %err, "could not poll controller"),
                }
            }
        }
        for (key, reason) in exited {
            self.on_controller_exit(&key, reason);
        }

        let now = Instant::now();
        let due: Vec<DeviceKey> = self
            .records
            .iter()
            .filter(|(_, record)| matches!(record.state, State::Backoff { until } if until <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            if let Some(record) = self.records.remove(&key) {
                info!(device = %key, attempt = record.restarts, "restarting controller");
                let record = self.start(record);
                self.records.insert(key, record);
            }
        }
    }

    /// Handle events until shutdown is requested or every sender is gone,
    /// then detach everything.
    pub fn run(&mut self, events: &Receiver<SupervisorEvent>) {
        loop {
            match events.recv_timeout(self.settings.poll_interval) {
                Ok(SupervisorEvent::Device(DeviceEvent::Attached(device))) => {
                    self.on_attach(device);
                }
                Ok(SupervisorEvent::Device(DeviceEvent::Detached(key))) => self.on_detach(&key),
                Ok(SupervisorEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.tick();
        }
        self.shutdown();
    }

    /// Detach every device.
    pub fn shutdown(&mut self) {
        let keys: Vec<DeviceKey> = self.records.keys().cloned().collect();
        info!(devices = keys.len(), "supervisor shutting down");
        for key in keys {
            self.on_detach(&key);
        }
    }

    fn start(&mut self, mut record: Record<L::Process>) -> Record<L::Process> {
        match self.launch(&record.device, &record.endpoint) {
            Ok(process) => {
                info!(device = %record.device.key, pid = process.pid(), "controller ready");
                record.state = State::Running(process);
                record
            }
            Err(err) => {
                remove_endpoint(&record.device.key, &record.endpoint);
                self.crashed(record, &err.to_string())
            }
        }
    }

    fn crashed(&self, mut record: Record<L::Process>, reason: &str) -> Record<L::Process> {
        let key = &record.device.key;
        if record.restarts < self.settings.max_restarts {
            record.restarts += 1;
            let delay = self
                .settings
                .restart_backoff
                .saturating_mul(2u32.saturating_pow(record.restarts - 1));
            warn!(
                device = %key,
                reason,
                attempt = record.restarts,
                delay = ?delay,
                "controller crashed, restarting after backoff"
            );
            record.state = State::Backoff {
                until: Instant::now() + delay,
            };
        } else {
            error!(
                device = %key,
                reason,
                restarts = record.restarts,
                "controller crashed and restarts are exhausted, device marked failed"
            );
            record.state = State::Failed;
        }
        record
    }

    /// Launch a controller and wait until its endpoint is bound.
    fn launch(&mut self, device: &Device, endpoint: &Path) -> Result<L::Process> {
        if fs::symlink_metadata(endpoint).is_ok() {
            warn!(device = %device.key, path = %endpoint.display(), "removing stale endpoint");
            endpoint::remove_path(endpoint)?;
        }
        if let Some(parent) = endpoint.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut process = self.launcher.launch(device, endpoint)?;
        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            if is_socket(endpoint) {
                return Ok(process);
            }
            if let Some(reason) = process.try_exit()? {
                return Err(Error::ControllerCrashed {
                    device: device.key.to_string(),
                    reason: format!("{reason} before its endpoint was ready"),
                });
            }
            if Instant::now() >= deadline {
                self.stop(&device.key, process);
                return Err(Error::ControllerCrashed {
                    device: device.key.to_string(),
                    reason: format!(
                        "endpoint not ready within {:?}",
                        self.settings.ready_timeout
                    ),
                });
            }
            thread::sleep(READY_POLL);
        }
    }

    /// SIGTERM, then SIGKILL once the grace period is over.
    fn stop(&self, key: &DeviceKey, mut process: L::Process) {
        if let Err(err) = process.terminate() {
            warn!(device = %key, error = %err, "could not signal controller");
        }
        let deadline = Instant::now() + self.settings.grace_period;
        loop {
            match process.try_exit() {
                Ok(Some(reason)) => {
                    debug!(device = %key, %reason, "controller stopped");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(READY_POLL),
                Ok(None) | Err(_) => break,
            }
        }
        warn!(device = %key, "controller ignored SIGTERM, killing it");
        if let Err(err) = process.kill() {
            warn!(device = %key, error = %err, "could not kill controller");
        }
        match process.wait() {
            Ok(reason) => debug!(device = %key, %reason, "controller killed"),
            Err(err) => error!(device = %key, error = %err, "could not reap controller"),
        }
    }
}

fn is_socket(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_socket())
}

fn remove_endpoint(key: &DeviceKey, path: &Path) {
    if let Err(err) = endpoint::remove_path(path) {
        warn!(device = %key, error = %err, "could not remove endpoint");
    }
}

/// Run the daemon: supervise statically registered and discovered devices
/// until SIGINT or SIGTERM.
pub fn supervise(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let signals = signals::block_termination()?;
    let (tx, rx) = channel::unbounded();

    let shutdown = tx.clone();
    signals::on_termination(signals, move |_| {
        let _ = shutdown.send(SupervisorEvent::Shutdown);
    })?;

    let launcher = match &config.supervisor.controller_exe {
        Some(exe) => ProcessLauncher::new(exe.clone(), config_path.map(Path::to_path_buf)),
        None => ProcessLauncher::current(config_path.map(Path::to_path_buf))?,
    };
    let mut supervisor =
        Supervisor::new(launcher, config.root_dir.clone(), config.supervisor.clone());
    supervisor.prepare_root()?;
    info!(root = %config.root_dir.display(), "supervisor started");

    for event in static_events(&config.devices) {
        let _ = tx.send(event.into());
    }

    let _watcher = if config.scan.enabled {
        let watcher = PollingWatcher::new(config.scan.clone())
            .ignoring(config.devices.iter().map(|device| device.key.clone()));
        Some(watcher.spawn(config.supervisor.poll_interval, tx)?)
    } else {
        drop(tx);
        None
    };

    supervisor.run(&rx);
    Ok(())
}
