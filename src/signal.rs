//! Bridge from SIGINT/SIGTERM to [`Shutdown`].
//!
//! The termination signals are blocked before any thread is spawned, so
//! every thread inherits the mask and none of them is ever interrupted.
//! A dedicated thread collects the signals with `sigwait` and triggers the
//! shutdown context from ordinary code, where logging is safe.

use crate::shutdown::Shutdown;
use std::io;
use std::mem::MaybeUninit;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// The set of signals that request shutdown.
#[derive(Clone, Copy)]
pub struct TerminationSignals {
    set: libc::sigset_t,
}

impl TerminationSignals {
    /// Block SIGINT and SIGTERM on the calling thread.
    ///
    /// Must run before other threads are spawned for the mask to be
    /// inherited everywhere.
    pub fn block() -> io::Result<Self> {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigemptyset initializes the set before it is read.
        let set = unsafe {
            if libc::sigemptyset(set.as_mut_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            let mut set = set.assume_init();
            for signo in [libc::SIGINT, libc::SIGTERM] {
                if libc::sigaddset(&mut set, signo) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            set
        };

        // SAFETY: `set` is a valid, initialized signal set.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(Self { set })
    }

    /// Spawn the thread that waits for the signals and triggers `shutdown`.
    ///
    /// The thread is never joined; it stays parked in `sigwait` until the
    /// process exits. Signals after the first have no further effect.
    pub fn spawn_listener(self, shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || loop {
                let mut signo: libc::c_int = 0;
                // SAFETY: `self.set` is initialized and blocked on this thread.
                let rc = unsafe { libc::sigwait(&self.set, &mut signo) };
                if rc != 0 {
                    error!(error = %io::Error::from_raw_os_error(rc), "sigwait failed");
                    return;
                }

                if shutdown.trigger() {
                    info!(signal = signal_name(signo), "Caught signal, exiting");
                } else {
                    info!(signal = signal_name(signo), "Shutdown already in progress");
                }
            })
    }
}

fn signal_name(signo: libc::c_int) -> &'static str {
    match signo {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        _ => "unknown",
    }
}
