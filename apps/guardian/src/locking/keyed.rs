//! Map of per-key critical sections with reference-counted lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CriticalSection, LockBackend, LockMode};
use crate::error::{GuardianError, GuardianResult};

/// Serializes work per key while keeping the map bounded by the number
/// of keys currently in use.
///
/// Entries are created on first acquire and removed when the last
/// holder (or waiter) lets go. Clone is cheap.
#[derive(Clone)]
pub struct KeyedLock {
    inner: Arc<Inner>,
}

struct Inner {
    sections: Mutex<HashMap<String, Arc<CriticalSection>>>,
    backend: LockBackend,
}

impl KeyedLock {
    pub fn new(backend: LockBackend) -> Self {
        Self {
            inner: Arc::new(Inner {
                sections: Mutex::new(HashMap::new()),
                backend,
            }),
        }
    }

    /// Exclusive lock for read-then-write sequences.
    pub async fn lock(&self, key: &str) -> GuardianResult<KeyGuard> {
        self.acquire(key, LockMode::Write).await
    }

    /// Shared lock for read-only sequences.
    pub async fn rlock(&self, key: &str) -> GuardianResult<KeyGuard> {
        self.acquire(key, LockMode::Read).await
    }

    async fn acquire(&self, key: &str, mode: LockMode) -> GuardianResult<KeyGuard> {
        let section = self.retain(key)?;
        // Built before waiting so a cancelled or failed wait still drops the reference.
        let mut guard = KeyGuard {
            owner: self.clone(),
            key: key.to_string(),
            section: Some(Arc::clone(&section)),
            mode,
            acquired: false,
        };

        section.acquire(mode).await?;
        guard.acquired = true;
        Ok(guard)
    }

    /// Number of keys with live holders or waiters.
    pub fn len(&self) -> usize {
        self.sections().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Holders plus waiters for `key`.
    pub fn num_locks(&self, key: &str) -> usize {
        self.sections()
            .ok()
            .and_then(|s| s.get(key).map(|section| section.num_locks()))
            .unwrap_or(0)
    }

    fn sections(&self) -> GuardianResult<MutexGuard<'_, HashMap<String, Arc<CriticalSection>>>> {
        self.inner
            .sections
            .lock()
            .map_err(|e| GuardianError::Internal(format!("Keyed lock map poisoned: {e}")))
    }

    fn retain(&self, key: &str) -> GuardianResult<Arc<CriticalSection>> {
        let mut sections = self.sections()?;
        let section = sections
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CriticalSection::new(self.inner.backend.new_mutex(key))));
        section.retain();
        Ok(Arc::clone(section))
    }

    fn forget(&self, key: &str, section: &Arc<CriticalSection>) {
        match self.sections() {
            Ok(mut sections) => {
                if section.release_ref() == 0
                    && sections
                        .get(key)
                        .is_some_and(|current| Arc::ptr_eq(current, section))
                {
                    sections.remove(key);
                }
            }
            Err(e) => tracing::error!(key, error = %e, "Failed to drop lock reference"),
        }
    }
}

/// Held lock on one key.
///
/// Prefer `unlock().await`. Dropping the guard releases in a background
/// task on the current runtime.
pub struct KeyGuard {
    owner: KeyedLock,
    key: String,
    section: Option<Arc<CriticalSection>>,
    mode: LockMode,
    acquired: bool,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock. Release failures are logged, not returned.
    pub async fn unlock(mut self) {
        if let Some(section) = self.section.take() {
            if self.acquired
                && let Err(e) = section.release(self.mode).await
            {
                tracing::warn!(key = %self.key, error = %e, "Failed to release lock");
            }
            self.owner.forget(&self.key, &section);
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let Some(section) = self.section.take() else {
            return;
        };

        if !self.acquired {
            self.owner.forget(&self.key, &section);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let owner = self.owner.clone();
                let key = std::mem::take(&mut self.key);
                let mode = self.mode;
                handle.spawn(async move {
                    if let Err(e) = section.release(mode).await {
                        tracing::warn!(key = %key, error = %e, "Failed to release dropped lock");
                    }
                    owner.forget(&key, &section);
                });
            }
            Err(_) => {
                tracing::warn!(key = %self.key, "Lock guard dropped outside a runtime");
                self.owner.forget(&self.key, &section);
            }
        }
    }
}
