//! Queue kick signalling.
//!
//! The transport turns a guest write to `QUEUE_NOTIFY` into [`QueueKick::kick`];
//! the worker serving the queue sleeps in [`QueueKick::wait`] instead of
//! polling the available ring.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Result of waiting for a kick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickWait {
    /// The queue was kicked.
    Kicked,
    /// The timeout elapsed without a kick.
    TimedOut,
    /// The kick was stopped; the worker should exit.
    Stopped,
}

#[derive(Debug, Default)]
struct KickState {
    pending: bool,
    stopped: bool,
}

/// Wait/wake pair for one queue.
#[derive(Debug, Default)]
pub struct QueueKick {
    state: Mutex<KickState>,
    cond: Condvar,
}

impl QueueKick {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, KickState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal the queue. Kicks coalesce until a waiter consumes them.
    pub fn kick(&self) {
        let mut state = self.lock();
        state.pending = true;
        self.cond.notify_all();
    }

    /// Consume a pending kick without blocking.
    pub fn take(&self) -> bool {
        std::mem::take(&mut self.lock().pending)
    }

    /// Block until kicked, stopped or `timeout` elapses (`None` waits forever).
    pub fn wait(&self, timeout: Option<Duration>) -> KickWait {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return KickWait::Stopped;
            }
            if std::mem::take(&mut state.pending) {
                return KickWait::Kicked;
            }
            match timeout {
                Some(timeout) => {
                    let (guard, result) = self
                        .cond
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    if result.timed_out() && !state.pending && !state.stopped {
                        return KickWait::TimedOut;
                    }
                }
                None => {
                    state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Stop the queue: current and future waits return `Stopped`.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        self.cond.notify_all();
    }

    /// Undo [`stop`](Self::stop).
    pub fn resume(&self) {
        let mut state = self.lock();
        state.stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }
}
