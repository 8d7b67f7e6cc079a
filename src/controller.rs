//! Controller process: one driver served over one endpoint.
//!
//! Every session runs on its own thread, but all of them funnel into the same
//! driver behind a mutex, so at most one driver call is in flight. A session
//! first receives the driver status, then gets one reply per request. When
//! the last session leaves, the driver is made safe.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::config::DriverSettings;
use crate::driver::{Driver, OpenCamera};
use crate::endpoint::{Endpoint, Session};
use crate::error::{Error, Result};
use crate::identity::{Device, DeviceKey};
use crate::protocol::{Reply, Request, Response};
use crate::signals;

/// A driver bound to its endpoint.
pub struct Controller<D> {
    key: DeviceKey,
    driver: Arc<Mutex<Driver<D>>>,
    endpoint: Arc<Endpoint>,
    sessions: Arc<AtomicUsize>,
}

/// Stops a running controller from another thread.
pub struct ShutdownHandle<D> {
    key: DeviceKey,
    driver: Arc<Mutex<Driver<D>>>,
    endpoint: Arc<Endpoint>,
}

impl<D: OpenCamera + Send + 'static> Controller<D> {
    /// Bring the device up with its default settings, then bind the endpoint.
    /// A device that cannot be opened never gets an endpoint.
    pub fn bind(device: &Device, endpoint: &Path, settings: &DriverSettings) -> Result<Self> {
        let mut driver = Driver::for_device(device, settings);
        driver.start(settings.camera.default_request())?;
        match Endpoint::create(endpoint) {
            Ok(endpoint) => Ok(Self::with_driver(device.key.clone(), driver, endpoint)),
            Err(err) => {
                driver.release();
                Err(err)
            }
        }
    }

    /// Serve an already constructed driver.
    pub fn with_driver(key: DeviceKey, driver: Driver<D>, endpoint: Endpoint) -> Self {
        Self {
            key,
            driver: Arc::new(Mutex::new(driver)),
            endpoint: Arc::new(endpoint),
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handle used to stop [`serve`](Self::serve).
    pub fn shutdown_handle(&self) -> ShutdownHandle<D> {
        ShutdownHandle {
            key: self.key.clone(),
            driver: Arc::clone(&self.driver),
            endpoint: Arc::clone(&self.endpoint),
        }
    }

    /// Accept sessions until the endpoint is closed.
    pub fn serve(&self) -> Result<()> {
        info!(device = %self.key, path = %self.endpoint.path().display(), "controller ready");
        while let Some(session) = self.endpoint.accept()? {
            let driver = Arc::clone(&self.driver);
            let sessions = Arc::clone(&self.sessions);
            let key = self.key.clone();
            thread::Builder::new()
                .name(format!("session-{}", self.key.id))
                .spawn(move || serve_session(&key, &driver, &sessions, &session))?;
        }
        debug!(device = %self.key, "endpoint closed, controller stopping");
        Ok(())
    }
}

impl<D: OpenCamera> ShutdownHandle<D> {
    /// Release the device, then close and remove the endpoint.
    pub fn shutdown(&self) {
        self.driver.lock().release();
        info!(device = %self.key, "device released");
        if let Err(err) = self.endpoint.destroy() {
            warn!(device = %self.key, error = %err, "could not remove endpoint");
        }
    }
}

/// Run a controller until SIGTERM or SIGINT: the entry point of the
/// `controller` subcommand.
pub fn run<D: OpenCamera + Send + 'static>(
    device: &Device,
    endpoint: &Path,
    settings: &DriverSettings,
) -> Result<()> {
    let signals = signals::block_termination()?;
    let controller = Controller::<D>::bind(device, endpoint, settings)?;
    let handle = controller.shutdown_handle();
    signals::on_termination(signals, move |_| handle.shutdown())?;
    controller.serve()
}

/// Counts live sessions; the last one out makes the device safe.
struct SessionGuard<'a, D: OpenCamera> {
    key: &'a DeviceKey,
    driver: &'a Mutex<Driver<D>>,
    sessions: &'a AtomicUsize,
}

impl<'a, D: OpenCamera> SessionGuard<'a, D> {
    fn enter(
        key: &'a DeviceKey,
        driver: &'a Mutex<Driver<D>>,
        sessions: &'a AtomicUsize,
    ) -> Self {
        sessions.fetch_add(1, Ordering::AcqRel);
        Self {
            key,
            driver,
            sessions,
        }
    }
}

impl<D: OpenCamera> Drop for SessionGuard<'_, D> {
    fn drop(&mut self) {
        // Decrement under the driver lock so a session joining concurrently
        // cannot see a half-finished make-safe.
        let mut driver = self.driver.lock();
        if self.sessions.fetch_sub(1, Ordering::AcqRel) == 1 {
            match driver.make_safe() {
                Ok(()) => debug!(device = %self.key, "last session left, device made safe"),
                Err(err) => warn!(device = %self.key, error = %err, "make-safe failed"),
            }
        }
    }
}

fn serve_session<D: OpenCamera>(
    key: &DeviceKey,
    driver: &Mutex<Driver<D>>,
    sessions: &AtomicUsize,
    session: &Session,
) {
    let _guard = SessionGuard::enter(key, driver, sessions);
    debug!(device = %key, "session opened");

    let greeting = Response::new(Reply::Status(driver.lock().status()));
    if let Err(err) = reply(session, &greeting) {
        debug!(device = %key, error = %err, "could not greet session");
        return;
    }

    loop {
        let packet = match session.receive() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(err) => {
                warn!(device = %key, error = %err, "session receive failed");
                break;
            }
        };
        let request = match Request::from_packet(&packet) {
            Ok(request) => request,
            Err(err) => {
                warn!(device = %key, error = %err, "malformed request, closing session");
                let _ = reply(session, &Response::error(&err));
                break;
            }
        };
        let response = handle(&mut driver.lock(), request).unwrap_or_else(|err| {
            debug!(device = %key, error = %err, "request failed");
            Response::error(&err)
        });
        if let Err(err) = reply(session, &response) {
            error!(device = %key, error = %err, "could not send reply");
            break;
        }
    }
    debug!(device = %key, "session closed");
}

/// Send `response`, replacing it with an error reply when it does not fit in
/// one packet.
fn reply(session: &Session, response: &Response) -> Result<()> {
    match session.send(&response.to_packet()?) {
        Err(err @ Error::MessageTooLarge { .. }) => {
            session.send(&Response::error(&err).to_packet()?)
        }
        other => other,
    }
}

fn handle<D: OpenCamera>(driver: &mut Driver<D>, request: Request) -> Result<Response> {
    Ok(match request {
        Request::Identify => Response::new(Reply::Info(driver.identify())),
        Request::Status => Response::new(Reply::Status(driver.status())),
        Request::Open => {
            driver.open()?;
            Response::new(Reply::Opened)
        }
        Request::Configure { options } => {
            driver.configure(options)?;
            Response::new(Reply::Configured)
        }
        Request::Acquire { request } => driver.acquire(request)?.into(),
        Request::Release => {
            driver.release();
            Response::new(Reply::Released)
        }
    })
}
