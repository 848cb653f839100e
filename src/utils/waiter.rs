//! Timed wait that can be cut short by new work

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Event used by dedicated threads to pace themselves
///
/// `wait_until` sleeps until a deadline or until `notify` is called,
/// whichever comes first. A notification that arrives while nobody is
/// waiting is remembered and consumed by the next wait.
#[derive(Default)]
pub struct ThreadWaiter {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl ThreadWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the waiting thread early
    pub fn notify(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_one();
    }

    /// Block until `deadline` or a notification. Returns `true` when woken.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *signalled, false)
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}
