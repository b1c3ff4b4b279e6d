//! In-process readers-writer lock with explicit release.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::KeyMutex;
use crate::error::{GuardianError, GuardianResult};

/// Permits held by a writer. Readers take one each.
const MAX_READERS: u32 = u32::MAX >> 3;

/// Readers-writer lock whose acquire and release are separate calls.
///
/// Built on a semaphore the same way `tokio::sync::RwLock` is, but
/// without guards so a holder can release from another scope.
pub struct LocalMutex {
    permits: Semaphore,
    writer: AtomicBool,
    readers: AtomicUsize,
}

impl LocalMutex {
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(MAX_READERS as usize),
            writer: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
        }
    }
}

impl Default for LocalMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyMutex for LocalMutex {
    async fn lock(&self) -> GuardianResult<()> {
        self.permits
            .acquire_many(MAX_READERS)
            .await
            .map_err(|e| GuardianError::Internal(format!("local lock closed: {e}")))?
            .forget();
        self.writer.store(true, Ordering::Release);
        Ok(())
    }

    async fn unlock(&self) -> GuardianResult<()> {
        if !self.writer.swap(false, Ordering::AcqRel) {
            return Err(GuardianError::LockNotHeld("local write lock".to_string()));
        }
        self.permits.add_permits(MAX_READERS as usize);
        Ok(())
    }

    async fn rlock(&self) -> GuardianResult<()> {
        self.permits
            .acquire()
            .await
            .map_err(|e| GuardianError::Internal(format!("local lock closed: {e}")))?
            .forget();
        self.readers.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn runlock(&self) -> GuardianResult<()> {
        self.readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| GuardianError::LockNotHeld("local read lock".to_string()))?;
        self.permits.add_permits(1);
        Ok(())
    }
}
