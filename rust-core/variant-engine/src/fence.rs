//! One-shot completion fences
//!
//! A fence signals once and stays signaled; any number of threads may wait,
//! including from inside another compile job. Signaled does not mean
//! succeeded: success or failure lives on the object that owns the fence
//! and is read only after the wait returns.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Signal-once, multi-waiter completion fence.
pub struct Fence {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Fence {
    /// Create an unsignaled fence.
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Create a permanently signaled fence, for objects that become visible
    /// only after their content is complete.
    pub fn new_signaled() -> Self {
        Self {
            signaled: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    /// Non-blocking poll.
    pub fn signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until the fence signals.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Block until the fence signals or `timeout` elapses. Returns whether
    /// the fence signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }

    /// Signal the fence, waking all waiters. Idempotent.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}
