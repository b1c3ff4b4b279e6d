//! A lock with a visible holder count.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{KeyMutex, LockMode};
use crate::error::GuardianResult;

/// Wraps a backend mutex and counts the callers currently holding or
/// waiting on it.
///
/// The count is only changed by `KeyedLock` while it holds its map
/// mutex, which is what lets the map drop idle sections safely.
pub struct CriticalSection {
    mutex: Box<dyn KeyMutex>,
    num_locks: AtomicUsize,
}

impl CriticalSection {
    pub fn new(mutex: Box<dyn KeyMutex>) -> Self {
        Self {
            mutex,
            num_locks: AtomicUsize::new(0),
        }
    }

    /// Callers holding or waiting on this section.
    pub fn num_locks(&self) -> usize {
        self.num_locks.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.num_locks() > 0
    }

    pub(super) fn retain(&self) {
        self.num_locks.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference, returning how many remain.
    pub(super) fn release_ref(&self) -> usize {
        let previous = self
            .num_locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub async fn acquire(&self, mode: LockMode) -> GuardianResult<()> {
        match mode {
            LockMode::Write => self.mutex.lock().await,
            LockMode::Read => self.mutex.rlock().await,
        }
    }

    pub async fn release(&self, mode: LockMode) -> GuardianResult<()> {
        match mode {
            LockMode::Write => self.mutex.unlock().await,
            LockMode::Read => self.mutex.runlock().await,
        }
    }
}
