//! Bucketed user store with globally unique index allocation.

use std::collections::HashMap;

use super::{BucketIdProvider, BucketIndexHandler};
use crate::error::{GuardianError, GuardianResult};

/// Spacing between consecutive final indexes. Each user owns the guardian
/// key pair at `index` and `index + 1`.
pub const INDEX_MULTIPLIER: u32 = 2;

/// Routes keys to their bucket and encodes `(bucket, base index)` into a
/// single global index.
pub struct ShardedIndexStore {
    provider: BucketIdProvider,
    buckets: HashMap<u32, BucketIndexHandler>,
}

impl ShardedIndexStore {
    pub fn new(
        provider: BucketIdProvider,
        buckets: HashMap<u32, BucketIndexHandler>,
    ) -> GuardianResult<Self> {
        if buckets.is_empty() {
            return Err(GuardianError::InvalidValue(
                "sharded store needs at least one bucket".to_string(),
            ));
        }

        Ok(Self { provider, buckets })
    }

    /// Allocate the global index for `key`.
    ///
    /// `final = INDEX_MULTIPLIER * (base * num_buckets + bucket_id)`.
    pub fn allocate_index(&self, key: &[u8]) -> GuardianResult<u32> {
        let (bucket_id, bucket) = self.bucket_for(key)?;
        let base_index = bucket.allocate_bucket_index()?;

        final_index(base_index, bucket_id, self.provider.num_buckets())
    }

    pub fn put(&self, key: &[u8], data: &[u8]) -> GuardianResult<()> {
        self.bucket_for(key)?.1.put(key, data)
    }

    pub fn get(&self, key: &[u8]) -> GuardianResult<Vec<u8>> {
        self.bucket_for(key)?.1.get(key)
    }

    pub fn has(&self, key: &[u8]) -> GuardianResult<()> {
        self.bucket_for(key)?.1.has(key)
    }

    /// Total allocations across all buckets. Any failing bucket aborts the count.
    pub fn count(&self) -> GuardianResult<u32> {
        self.buckets.values().try_fold(0_u32, |total, bucket| {
            let last = bucket.get_last_index()?;
            total
                .checked_add(last)
                .ok_or_else(|| GuardianError::IndexOverflow("registered users count".to_string()))
        })
    }

    /// Close every bucket, returning the last error seen.
    pub fn close(&self) -> GuardianResult<()> {
        let mut last_err = None;
        for (bucket_id, bucket) in &self.buckets {
            if let Err(e) = bucket.close() {
                tracing::error!(bucket_id, error = %e, "Failed to close bucket");
                last_err = Some(e);
            }
        }

        last_err.map_or(Ok(()), Err)
    }

    fn bucket_for(&self, key: &[u8]) -> GuardianResult<(u32, &BucketIndexHandler)> {
        let bucket_id = self.provider.bucket_for_address(key);
        self.buckets
            .get(&bucket_id)
            .map(|bucket| (bucket_id, bucket))
            .ok_or(GuardianError::InvalidBucketId(bucket_id))
    }
}

fn final_index(base_index: u32, bucket_id: u32, num_buckets: u32) -> GuardianResult<u32> {
    base_index
        .checked_mul(num_buckets)
        .and_then(|v| v.checked_add(bucket_id))
        .and_then(|v| v.checked_mul(INDEX_MULTIPLIER))
        .ok_or_else(|| {
            GuardianError::IndexOverflow(format!(
                "base index {base_index} in bucket {bucket_id} of {num_buckets}"
            ))
        })
}
