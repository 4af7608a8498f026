//! Binary signal shared between the interrupt handler and calling tasks

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A binary semaphore: signalling an already signalled `Signal` has no
/// further effect, and a successful wait consumes the signal.
#[derive(Debug, Default)]
pub struct Signal {
    raised: Mutex<bool>,
    changed: Condvar,
}

impl Signal {
    /// Create a signal in the given state
    pub fn new(raised: bool) -> Self {
        Self {
            raised: Mutex::new(raised),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        // A panic while holding the guard cannot leave the flag inconsistent.
        self.raised.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raise the signal, waking one waiter
    pub fn signal(&self) {
        *self.lock() = true;
        self.changed.notify_one();
    }

    /// Consume the signal if it is raised
    pub fn try_wait(&self) -> bool {
        core::mem::replace(&mut *self.lock(), false)
    }

    /// Wait for the signal and consume it. `None` waits forever, as does a
    /// timeout too large to represent as a deadline. Returns `false` if the
    /// timeout expired first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut raised = self.lock();
        while !*raised {
            raised = match deadline {
                None => self
                    .changed
                    .wait(raised)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.changed
                        .wait_timeout(raised, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
        *raised = false;
        true
    }

    /// Current state, without consuming it
    pub fn is_raised(&self) -> bool {
        *self.lock()
    }
}
