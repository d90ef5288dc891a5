//! Process-wide shutdown state.
//!
//! A `Shutdown` is created once in `main` and cloned into every worker.
//! Triggering it sets an atomic flag, wakes every `sleep` in progress and
//! wakes the accept loop's poller, so each loop notices within one
//! iteration instead of after its next timeout.

use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` only for the first caller.
    pub fn trigger(&self) -> bool {
        {
            let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.inner.triggered.swap(true, Ordering::SeqCst) {
                return false;
            }
            self.inner.wakeup.notify_all();
        }

        let waker = self.inner.waker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waker) = waker.as_ref() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake accept loop");
            }
        }
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Install the waker used to interrupt the accept loop's poll.
    ///
    /// If shutdown was already requested the waker fires immediately.
    pub fn attach_waker(&self, waker: Arc<Waker>) {
        let mut slot = self.inner.waker.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_triggered() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake accept loop");
            }
        }
        *slot = Some(waker);
    }

    /// Sleep for `duration` or until shutdown is requested.
    ///
    /// Returns `true` if shutdown was requested, either before or during
    /// the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .inner
                .wakeup
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
