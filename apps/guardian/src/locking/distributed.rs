//! Lease-based mutex shared across service instances.
//!
//! A lease is a `(name, token)` pair with a TTL held by a `LeaseStore`.
//! Acquisition retries until the caller's timeout and release only
//! succeeds for the token that won the lease. Reads take the same
//! exclusive lease as writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::KeyMutex;
use crate::error::{GuardianError, GuardianResult};

const RETRY_DELAY: Duration = Duration::from_millis(25);

/// Backing store for leases (e.g. a shared cache with set-if-absent).
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease if it is free or expired. Returns whether it was taken.
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration) -> GuardianResult<bool>;

    /// Drop the lease if `token` still holds it. Returns whether it was held.
    async fn release(&self, name: &str, token: &str) -> GuardianResult<bool>;
}

/// Single-node lease store.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(
        &self,
    ) -> GuardianResult<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.leases
            .lock()
            .map_err(|e| GuardianError::Internal(format!("Lease map mutex poisoned: {e}")))
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, name: &str, token: &str, ttl: Duration) -> GuardianResult<bool> {
        let now = Instant::now();
        let mut leases = self.leases()?;

        if let Some((_, expires_at)) = leases.get(name)
            && *expires_at > now
        {
            return Ok(false);
        }

        leases.insert(name.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, name: &str, token: &str) -> GuardianResult<bool> {
        let mut leases = self.leases()?;

        match leases.get(name) {
            Some((holder, expires_at)) if holder == token && *expires_at > Instant::now() => {
                leases.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Mutex for one key, backed by a lease.
pub struct DistributedMutex {
    store: Arc<dyn LeaseStore>,
    name: String,
    expiry: Duration,
    timeout: Duration,
    token: Mutex<Option<String>>,
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn LeaseStore>, key: &str, expiry: Duration, timeout: Duration) -> Self {
        Self {
            store,
            name: format!("guardian-lock:{key}"),
            expiry,
            timeout,
            token: Mutex::new(None),
        }
    }

    fn token_slot(&self) -> GuardianResult<std::sync::MutexGuard<'_, Option<String>>> {
        self.token
            .lock()
            .map_err(|e| GuardianError::Internal(format!("Lease token mutex poisoned: {e}")))
    }

    async fn acquire(&self) -> GuardianResult<()> {
        let token = uuid::Uuid::new_v4().to_string();

        let attempt = async {
            loop {
                if self
                    .store
                    .try_acquire(&self.name, &token, self.expiry)
                    .await?
                {
                    return Ok::<(), GuardianError>(());
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result?,
            Err(_) => return Err(GuardianError::LockTimeout(self.name.clone())),
        }

        *self.token_slot()? = Some(token);
        tracing::trace!(lock = %self.name, "Acquired lease");
        Ok(())
    }

    async fn release(&self) -> GuardianResult<()> {
        let token = self
            .token_slot()?
            .take()
            .ok_or_else(|| GuardianError::LockNotHeld(self.name.clone()))?;

        if self.store.release(&self.name, &token).await? {
            tracing::trace!(lock = %self.name, "Released lease");
            Ok(())
        } else {
            Err(GuardianError::LockNotHeld(self.name.clone()))
        }
    }
}

#[async_trait]
impl KeyMutex for DistributedMutex {
    async fn lock(&self) -> GuardianResult<()> {
        self.acquire().await
    }

    async fn unlock(&self) -> GuardianResult<()> {
        self.release().await
    }

    async fn rlock(&self) -> GuardianResult<()> {
        self.acquire().await
    }

    async fn runlock(&self) -> GuardianResult<()> {
        self.release().await
    }
}
