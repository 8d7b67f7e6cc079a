//! Termination signals, taken synchronously on a dedicated thread.

use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::thread;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Block SIGINT and SIGTERM in the calling thread and every thread it spawns
/// afterwards. Call before starting any other thread.
pub fn block_termination() -> Result<SigSet> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block().map_err(|errno| Error::Io(errno.into()))?;
    Ok(set)
}

/// Run `on_signal` on a new thread once one of `set` arrives.
pub fn on_termination<F>(set: SigSet, on_signal: F) -> io::Result<thread::JoinHandle<()>>
where
    F: FnOnce(Signal) + Send + 'static,
{
    thread::Builder::new()
        .name("signals".to_owned())
        .spawn(move || match set.wait() {
            Ok(signal) => {
                info!(signal = %signal, "termination requested");
                on_signal(signal);
            }
            Err(errno) => error!(error = %errno, "sigwait failed"),
        })
}
