//! Sharded storage for registered users.
//!
//! - `bucket_id`: deterministic key-to-bucket mapping
//! - `index_allocator`: per-bucket persisted counters
//! - `sharded_store`: routing plus global index encoding

pub mod bucket_id;
pub mod index_allocator;
pub mod sharded_store;

use std::collections::HashMap;
use std::sync::Arc;

pub use bucket_id::BucketIdProvider;
pub use index_allocator::BucketIndexHandler;
pub use sharded_store::{INDEX_MULTIPLIER, ShardedIndexStore};

use crate::error::GuardianResult;
use crate::storage::Storage;

/// Build a sharded store with `num_buckets` redb-backed buckets.
pub fn open_sharded_store(storage: &Storage, num_buckets: u32) -> GuardianResult<ShardedIndexStore> {
    let provider = BucketIdProvider::new(num_buckets)?;

    let mut buckets = HashMap::with_capacity(num_buckets as usize);
    for id in 0..num_buckets {
        let bucket = Arc::new(storage.bucket(id)?);
        buckets.insert(id, BucketIndexHandler::new(bucket)?);
    }

    tracing::info!(num_buckets, "Opened sharded user store");

    ShardedIndexStore::new(provider, buckets)
}
