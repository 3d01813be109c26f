use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::lock::{condvar_wait, condvar_wait_timeout, mutex_lock};

const SOURCE: &str = "sync::shutdown";

/// One-shot cancellation signal shared between the bus and its blocking loops.
///
/// Waiters sleep on a condvar so that [`ShutdownSignal::trigger`] wakes them
/// immediately instead of at the end of their timeout.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *mutex_lock(&self.triggered, SOURCE, "trigger") = true;
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *mutex_lock(&self.triggered, SOURCE, "is_triggered")
    }

    /// Sleep for `timeout` unless the signal fires first.
    ///
    /// Returns `true` when the wait ended because of the signal. A timeout
    /// past the range of [`Instant`] waits for the signal alone.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut triggered = mutex_lock(&self.triggered, SOURCE, "wait_timeout");
        while !*triggered {
            let Some(deadline) = deadline else {
                triggered = condvar_wait(&self.wake, triggered, SOURCE, "wait_timeout");
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            triggered = condvar_wait_timeout(
                &self.wake,
                triggered,
                deadline - now,
                SOURCE,
                "wait_timeout",
            );
        }
        true
    }
}
