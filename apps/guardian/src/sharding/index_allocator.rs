//! Per-bucket index allocation.

use std::sync::{Arc, RwLock};

use crate::error::{GuardianError, GuardianResult};
use crate::storage::Storer;

/// Key under which each bucket keeps its last handed-out index.
pub const LAST_INDEX_KEY: &[u8] = b"lastAllocatedIndex";

/// Hands out strictly increasing indexes for one bucket and proxies the
/// bucket's key-value operations.
///
/// The counter is persisted big-endian in the bucket itself, so a restart
/// resumes from the last allocation.
pub struct BucketIndexHandler {
    store: Arc<dyn Storer>,
    index_lock: RwLock<()>,
}

impl BucketIndexHandler {
    /// Wrap a bucket, initialising its counter to 0 when absent.
    pub fn new(store: Arc<dyn Storer>) -> GuardianResult<Self> {
        match store.has(LAST_INDEX_KEY) {
            Ok(()) => {}
            Err(GuardianError::KeyNotFound) => store.put(LAST_INDEX_KEY, &0_u32.to_be_bytes())?,
            Err(e) => return Err(e),
        }

        Ok(Self {
            store,
            index_lock: RwLock::new(()),
        })
    }

    /// Allocate the next index in this bucket. The first allocation returns 1.
    pub fn allocate_bucket_index(&self) -> GuardianResult<u32> {
        let _guard = self
            .index_lock
            .write()
            .map_err(|e| GuardianError::Internal(format!("Bucket index lock poisoned: {e}")))?;

        let last = self.read_last_index()?;
        let next = last
            .checked_add(1)
            .ok_or_else(|| GuardianError::IndexOverflow(format!("bucket counter at {last}")))?;
        self.store.put(LAST_INDEX_KEY, &next.to_be_bytes())?;

        Ok(next)
    }

    /// Last index handed out by this bucket (0 when none yet).
    pub fn get_last_index(&self) -> GuardianResult<u32> {
        let _guard = self
            .index_lock
            .read()
            .map_err(|e| GuardianError::Internal(format!("Bucket index lock poisoned: {e}")))?;

        self.read_last_index()
    }

    fn read_last_index(&self) -> GuardianResult<u32> {
        let raw = self.store.get(LAST_INDEX_KEY)?;
        let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| {
            GuardianError::Deserialization(format!(
                "bucket counter has {} bytes, expected 4",
                raw.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn put(&self, key: &[u8], data: &[u8]) -> GuardianResult<()> {
        self.store.put(key, data)
    }

    pub fn get(&self, key: &[u8]) -> GuardianResult<Vec<u8>> {
        self.store.get(key)
    }

    pub fn has(&self, key: &[u8]) -> GuardianResult<()> {
        self.store.has(key)
    }

    pub fn close(&self) -> GuardianResult<()> {
        self.store.close()
    }
}
