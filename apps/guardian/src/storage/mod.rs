//! Storage layer for the guardian service.
//!
//! Uses ReDB for embedded key-value storage with ACID transactions.
//! Registered users live in per-bucket tables; OTP throttling windows
//! share the same database file.

pub mod redb;

pub use self::redb::{RedbBucket, Storage};

use crate::error::GuardianResult;

/// Persistent key-value bucket contract.
///
/// `get` fails with `KeyNotFound` when the key is absent and `has`
/// reports absence the same way. After `close`, every operation fails
/// with `StorageClosed`.
pub trait Storer: Send + Sync {
    fn put(&self, key: &[u8], data: &[u8]) -> GuardianResult<()>;
    fn get(&self, key: &[u8]) -> GuardianResult<Vec<u8>>;
    fn has(&self, key: &[u8]) -> GuardianResult<()>;
    fn close(&self) -> GuardianResult<()>;
}
