//! Per-key locking for user critical sections.
//!
//! `KeyedLock` hands out one `CriticalSection` per live key and drops it
//! once the last holder releases. The lock behind each section is
//! pluggable: an in-process readers-writer lock, or a lease-based mutex
//! shared across service instances.

pub mod critical_section;
pub mod distributed;
pub mod keyed;
pub mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use critical_section::CriticalSection;
pub use distributed::{DistributedMutex, LeaseStore, MemoryLeaseStore};
pub use keyed::{KeyGuard, KeyedLock};
pub use local::LocalMutex;

use crate::error::GuardianResult;

/// Acquire/release capability shared by every lock backend.
#[async_trait]
pub trait KeyMutex: Send + Sync {
    async fn lock(&self) -> GuardianResult<()>;
    async fn unlock(&self) -> GuardianResult<()>;
    async fn rlock(&self) -> GuardianResult<()>;
    async fn runlock(&self) -> GuardianResult<()>;
}

/// Whether a holder intends to mutate the guarded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Lock backend selected at startup.
#[derive(Clone)]
pub enum LockBackend {
    Local,
    Distributed {
        store: Arc<dyn LeaseStore>,
        /// Lease lifetime; a crashed holder frees the key after this.
        expiry: Duration,
        /// Upper bound on a single acquisition attempt.
        timeout: Duration,
    },
}

impl LockBackend {
    fn new_mutex(&self, key: &str) -> Box<dyn KeyMutex> {
        match self {
            Self::Local => Box::new(LocalMutex::new()),
            Self::Distributed {
                store,
                expiry,
                timeout,
            } => Box::new(DistributedMutex::new(
                Arc::clone(store),
                key,
                *expiry,
                *timeout,
            )),
        }
    }
}

impl std::fmt::Debug for LockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Distributed {
                expiry, timeout, ..
            } => f
                .debug_struct("distributed")
                .field("expiry", expiry)
                .field("timeout", timeout)
                .finish(),
        }
    }
}
