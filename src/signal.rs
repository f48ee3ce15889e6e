//! Stop signal shared by polling workers and supervisory loops.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// A resettable stop flag that sleeping loops can wait on.
///
/// `trigger` wakes every waiter immediately, so `stop()` never has to wait
/// out a full polling interval.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.lock() = false;
    }

    pub fn is_triggered(&self) -> bool {
        *self.lock()
    }

    /// Sleep for `timeout` or until triggered. Returns `true` if triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(|p| p.into_inner())
    }
}
