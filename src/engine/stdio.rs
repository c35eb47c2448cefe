use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::core::lock;
use crate::engine::scheduler::TaskKey;

/// Exclusive access to standard output for multi-line writes.
#[derive(Default)]
pub(crate) struct StdioLock {
    holder: Mutex<Option<TaskKey>>,
    cond: Condvar,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StdioMisuse {
    Reentrant,
    NotHolder,
}

impl StdioLock {
    /// Returns `Ok(false)` when cancelled while waiting for another holder.
    pub(crate) fn acquire(&self, key: TaskKey, cancelled: &AtomicBool) -> Result<bool, StdioMisuse> {
        let mut holder = lock(&self.holder);
        if *holder == Some(key) {
            return Err(StdioMisuse::Reentrant);
        }
        while holder.is_some() {
            if cancelled.load(Ordering::SeqCst) {
                return Ok(false);
            }
            holder = self.cond.wait(holder).unwrap_or_else(|e| e.into_inner());
        }
        *holder = Some(key);
        Ok(true)
    }

    pub(crate) fn release(&self, key: TaskKey) -> Result<(), StdioMisuse> {
        let mut holder = lock(&self.holder);
        if *holder != Some(key) {
            return Err(StdioMisuse::NotHolder);
        }
        *holder = None;
        self.cond.notify_all();
        Ok(())
    }

    pub(crate) fn is_held_by(&self, key: TaskKey) -> bool {
        *lock(&self.holder) == Some(key)
    }

    /// Writes one line, waiting while another task holds the lock.
    pub(crate) fn println(&self, key: TaskKey, line: &str, cancelled: &AtomicBool) {
        let mut holder = lock(&self.holder);
        while holder.is_some_and(|h| h != key) && !cancelled.load(Ordering::SeqCst) {
            holder = self.cond.wait(holder).unwrap_or_else(|e| e.into_inner());
        }
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{line}") {
            tracing::warn!("Couldn't write to stdout: {e}");
        }
        drop(holder);
    }

    pub(crate) fn wake_all(&self) {
        let _holder = lock(&self.holder);
        self.cond.notify_all();
    }
}
