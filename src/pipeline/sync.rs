//! Start/stop gate for queueing operations.
//!
//! Every queueing entry point holds a [`QueueGuard`] for its whole duration.
//! [`QueueSync::stop`] closes the gate and waits for admitted guards to drop,
//! so once it returns no queueing operation is running and none can start.

use parking_lot::{Condvar, Mutex};

/// Counter value meaning the gate is closed.
const STOPPED: i64 = -1;

#[derive(Debug)]
pub struct QueueSync {
    /// Serializes admissions against `stop()`.
    guard_lock: Mutex<()>,
    count: Mutex<i64>,
    drained: Condvar,
}

impl QueueSync {
    /// Create a gate in the stopped state.
    pub fn new() -> Self {
        Self {
            guard_lock: Mutex::new(()),
            count: Mutex::new(STOPPED),
            drained: Condvar::new(),
        }
    }

    /// Open the gate. No-op when already running.
    pub fn start(&self) {
        let mut count = self.count.lock();
        if *count == STOPPED {
            *count = 0;
        }
    }

    /// Close the gate and wait for admitted operations to finish.
    pub fn stop(&self) {
        let _admissions = self.guard_lock.lock();
        let mut count = self.count.lock();
        if *count == STOPPED {
            return;
        }
        while *count != 0 {
            self.drained.wait(&mut count);
        }
        *count = STOPPED;
    }

    pub fn is_running(&self) -> bool {
        *self.count.lock() != STOPPED
    }

    /// Operations currently admitted.
    pub fn in_flight(&self) -> usize {
        (*self.count.lock()).max(0) as usize
    }

    /// Try to admit an operation.
    pub fn guard(&self) -> QueueGuard<'_> {
        let _admissions = self.guard_lock.lock();
        let mut count = self.count.lock();
        if *count == STOPPED {
            return QueueGuard {
                sync: self,
                running: false,
            };
        }
        *count += 1;
        QueueGuard {
            sync: self,
            running: true,
        }
    }
}

impl Default for QueueSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission token. Callers must reject the operation with
/// [`Status::NotSupported`](crate::error::Status::NotSupported) when
/// [`QueueGuard::is_running`] is false.
#[must_use]
pub struct QueueGuard<'a> {
    sync: &'a QueueSync,
    running: bool,
}

impl QueueGuard<'_> {
    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if !self.running {
            return;
        }
        let mut count = self.sync.count.lock();
        *count -= 1;
        if *count == 0 {
            self.sync.drained.notify_all();
        }
    }
}
