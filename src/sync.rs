//! Synchronization primitives for the engine.
//!
//! The init event is the only place the core ever blocks. It is a one-shot
//! Condvar-backed gate with a cancellable wait, standing in for the host
//! kernel's cancellable single-object wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::status::Status;

/// Cooperative cancellation flag for a blocking transact call.
///
/// Clones observe the same flag. The host sets it when the calling thread is
/// terminating or the I/O packet is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Wakes any waiter promptly.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// How often a waiter re-checks its cancel token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One-shot event gating request admission until the handshake completes.
#[derive(Debug, Default)]
pub struct InitEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

#[expect(
    clippy::expect_used,
    reason = "Mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl InitEvent {
    /// A fresh, unsignaled event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, releasing all current and future waiters.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock().expect("poisoned");
        *signaled = true;
        self.cond.notify_all();
    }

    /// Whether the event has been signaled.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.signaled.lock().expect("poisoned")
    }

    /// Block until the event is signaled, the token is cancelled, or the
    /// optional deadline elapses. Cancellation and timeout both surface as
    /// [`Status::Cancelled`].
    pub fn wait(&self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<(), Status> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = self.signaled.lock().expect("poisoned");
        loop {
            if *signaled {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(Status::Cancelled);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(Status::Cancelled);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(signaled, CANCEL_POLL_INTERVAL)
                .expect("poisoned");
            signaled = guard;
        }
    }
}
