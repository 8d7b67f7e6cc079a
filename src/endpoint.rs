//! Per-device endpoint: a `SOCK_SEQPACKET` Unix socket bound at the device's
//! endpoint path.
//!
//! Sequenced packets keep message boundaries, so one `send` is always one
//! `receive` on the other side. The largest message a session can carry is
//! bounded by the socket send buffer, which is raised to
//! [`SEND_BUFFER_SIZE`] on every session; the kernel may cap it further
//! (`net.core.wmem_max`).
//!
//! The socket is bound under a staging name next to its final path and
//! linked into place only once it listens with its final permissions, so a
//! visible endpoint path always accepts connections.

use nix::errno::Errno;
use nix::sys::socket::{
    self, accept, bind, connect, listen, recv, send, setsockopt, sockopt, AddressFamily, Backlog,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{Request, Response};

/// Requested send buffer per session.
pub const SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;

const BACKLOG: i32 = 16;

/// Listening endpoint.
#[derive(Debug)]
pub struct Endpoint {
    fd: OwnedFd,
    path: PathBuf,
    closed: AtomicBool,
}

impl Endpoint {
    /// Bind and listen at `path`, creating its parent directory. The path
    /// must not exist yet.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(path, err))?;
        }
        let staging = staging_path(path);
        remove_path(&staging)?;
        let bound = listen_at(&staging, path);
        // link(2) refuses an existing target, unlike rename(2).
        let published = bound.and_then(|fd| match fs::hard_link(&staging, path) {
            Ok(()) => Ok(fd),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::AddressInUse(path.to_owned()))
            }
            Err(err) => Err(io_error(path, err)),
        });
        remove_path(&staging)?;
        let fd = published?;
        debug!(path = %path.display(), "endpoint bound");
        Ok(Self {
            fd,
            path: path.to_owned(),
            closed: AtomicBool::new(false),
        })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next client. Returns `None` once the endpoint has been
    /// closed.
    pub fn accept(&self) -> Result<Option<Session>> {
        loop {
            match accept(self.fd.as_raw_fd()) {
                Ok(raw) => return Session::from_raw(raw).map(Some),
                Err(Errno::EINTR | Errno::ECONNABORTED) => continue,
                Err(_) if self.closed.load(Ordering::Acquire) => return Ok(None),
                Err(errno) => return Err(Error::Io(errno.into())),
            }
        }
    }

    /// Stop accepting; a blocked [`accept`](Self::accept) returns `None`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Wakes a thread blocked in accept(2).
            let _ = socket::shutdown(self.fd.as_raw_fd(), socket::Shutdown::Both);
        }
    }

    /// Close the endpoint and remove its path. Safe to call more than once.
    pub fn destroy(&self) -> Result<()> {
        self.close();
        remove_path(&self.path)
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.{}.bind", std::process::id()))
}

/// Listen on a socket bound at `staging`; errors name the endpoint `path`.
fn listen_at(staging: &Path, path: &Path) -> Result<OwnedFd> {
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|errno| errno_error(path, errno))?;
    let addr = UnixAddr::new(staging).map_err(|errno| errno_error(path, errno))?;
    bind(fd.as_raw_fd(), &addr).map_err(|errno| errno_error(path, errno))?;
    listen(&fd, Backlog::new(BACKLOG).map_err(|errno| errno_error(path, errno))?)
        .map_err(|errno| errno_error(path, errno))?;
    fs::set_permissions(staging, fs::Permissions::from_mode(0o777))
        .map_err(|err| io_error(path, err))?;
    Ok(fd)
}

/// Remove an endpoint path if it exists.
pub fn remove_path(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(io_error(path, err)),
        _ => Ok(()),
    }
}

/// One connected client, seen from the controller.
#[derive(Debug)]
pub struct Session {
    fd: OwnedFd,
}

impl Session {
    fn from_raw(raw: RawFd) -> Result<Self> {
        // SAFETY: accept(2) returned a fresh descriptor that nothing else owns.
        #[allow(unsafe_code)]
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        setsockopt(&fd, sockopt::SndBuf, &SEND_BUFFER_SIZE)
            .map_err(|errno| Error::Io(errno.into()))?;
        Ok(Self { fd })
    }

    /// Wait for the next message. `None` means the peer went away.
    pub fn receive(&self) -> Result<Option<Vec<u8>>> {
        recv_packet(&self.fd)
    }

    /// Send one message.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        send_packet(&self.fd, message)
    }
}

/// Client side of an endpoint.
#[derive(Debug)]
pub struct Client {
    fd: OwnedFd,
}

impl Client {
    /// Connect to the endpoint at `path` and read the controller's greeting.
    pub fn connect(path: &Path) -> Result<(Self, Response)> {
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|errno| errno_error(path, errno))?;
        let addr = UnixAddr::new(path).map_err(|errno| errno_error(path, errno))?;
        connect(fd.as_raw_fd(), &addr).map_err(|errno| errno_error(path, errno))?;
        let client = Self { fd };
        let greeting = client.receive()?;
        Ok((client, greeting))
    }

    /// Send a request and wait for its reply.
    pub fn request(&self, request: &Request) -> Result<Response> {
        self.send_raw(&request.to_packet()?)?;
        self.receive()
    }

    /// Send an arbitrary packet.
    pub fn send_raw(&self, packet: &[u8]) -> Result<()> {
        send_packet(&self.fd, packet)
    }

    /// Wait for the next reply.
    pub fn receive(&self) -> Result<Response> {
        let packet = recv_packet(&self.fd)?.ok_or_else(|| {
            Error::DeviceUnavailable("endpoint closed the connection".to_owned())
        })?;
        Response::from_packet(&packet)
    }

    /// Wait for the next raw packet; `None` once the controller hung up.
    pub fn receive_raw(&self) -> Result<Option<Vec<u8>>> {
        recv_packet(&self.fd)
    }
}

fn recv_packet(fd: &OwnedFd) -> Result<Option<Vec<u8>>> {
    loop {
        // With MSG_TRUNC the kernel reports the full packet length.
        let size = match recv(
            fd.as_raw_fd(),
            &mut [],
            MsgFlags::MSG_PEEK | MsgFlags::MSG_TRUNC,
        ) {
            Ok(0) | Err(Errno::ECONNRESET) => return Ok(None),
            Ok(size) => size,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(Error::Io(errno.into())),
        };
        let mut packet = vec![0u8; size];
        match recv(fd.as_raw_fd(), &mut packet, MsgFlags::empty()) {
            Ok(0) | Err(Errno::ECONNRESET) => return Ok(None),
            Ok(read) => {
                packet.truncate(read);
                return Ok(Some(packet));
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(Error::Io(errno.into())),
        }
    }
}

fn send_packet(fd: &OwnedFd, packet: &[u8]) -> Result<()> {
    loop {
        match send(fd.as_raw_fd(), packet, MsgFlags::MSG_NOSIGNAL) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EMSGSIZE | Errno::ENOBUFS) => {
                return Err(Error::MessageTooLarge { size: packet.len() })
            }
            Err(errno) => return Err(Error::Io(errno.into())),
        }
    }
}

fn errno_error(path: &Path, errno: Errno) -> Error {
    match errno {
        Errno::EADDRINUSE => Error::AddressInUse(path.to_owned()),
        Errno::EACCES | Errno::EPERM => Error::PermissionDenied(path.to_owned()),
        other => Error::Io(io::Error::from(other)),
    }
}

fn io_error(path: &Path, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::PermissionDenied {
        Error::PermissionDenied(path.to_owned())
    } else {
        Error::Io(err)
    }
}
