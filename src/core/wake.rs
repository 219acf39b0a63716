//! Condvar-based wake notifications between the engine and the sweeper.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Shared state for Condvar-based wake notifications.
#[derive(Debug, Default)]
pub struct WakeState {
    /// Something changed that may need a sweep (new preemption deadline,
    /// explicit request).
    pub sweep_pending: bool,
    /// Flag to signal shutdown of the sweeper.
    pub shutdown: bool,
}

/// Why [`SweepSignal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The engine asked for a sweep.
    Notified,
    /// The timeout elapsed.
    Timeout,
    /// Shutdown was requested.
    Shutdown,
}

/// Wake channel signalled by the engine and waited on by sweepers.
#[derive(Debug, Default)]
pub struct SweepSignal {
    state: Mutex<WakeState>,
    condvar: Condvar,
}

impl SweepSignal {
    /// Create a signal with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the sweeper to run as soon as possible.
    pub fn notify(&self) {
        self.state.lock().sweep_pending = true;
        self.condvar.notify_all();
    }

    /// Signal shutdown to any waiting sweeper.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.condvar.notify_all();
    }

    /// True once shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Consume a pending notification without blocking.
    pub fn take_pending(&self) -> bool {
        std::mem::take(&mut self.state.lock().sweep_pending)
    }

    /// Block until notified, shut down, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let mut state = self.state.lock();
        if !state.sweep_pending && !state.shutdown {
            let _ = self.condvar.wait_for(&mut state, timeout);
        }
        if state.shutdown {
            Wake::Shutdown
        } else if std::mem::take(&mut state.sweep_pending) {
            Wake::Notified
        } else {
            Wake::Timeout
        }
    }
}
