//! ReDB storage implementation for the guardian service.
//!
//! Provides persistent storage for:
//! - Registered users, one table per bucket (`bucket_<id>`)
//! - OTP throttling windows (`otp_rate_limits`)
//!
//! Bucket tables use raw byte keys and values. Throttling windows are
//! JSON-serialized under string keys.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use super::Storer;
use crate::error::{GuardianError, GuardianResult};

const RATE_LIMITS: TableDefinition<&str, &[u8]> = TableDefinition::new("otp_rate_limits");

/// Storage wrapper for ReDB.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
}

impl Storage {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> GuardianResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| GuardianError::Storage(e.to_string()))?;
        Self::init_tables(&db)?;

        tracing::info!(path = %path.display(), "Opened storage database");

        Ok(Self { db: Arc::new(db) })
    }

    /// Open an in-memory database, used by tests and throwaway instances.
    pub fn open_memory() -> GuardianResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| GuardianError::Storage(e.to_string()))?;
        Self::init_tables(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn init_tables(db: &Database) -> GuardianResult<()> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RATE_LIMITS)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Open (creating if needed) the table backing bucket `id`.
    pub fn bucket(&self, id: u32) -> GuardianResult<RedbBucket> {
        let table = format!("bucket_{id}");

        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(TableDefinition::<&[u8], &[u8]>::new(&table))?;
        }
        write_txn.commit()?;

        Ok(RedbBucket {
            db: Arc::clone(&self.db),
            table,
            closed: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // OTP throttling windows
    // =========================================================================

    /// Get a throttling window by key.
    pub fn get_rate_limit<T: DeserializeOwned>(&self, key: &str) -> GuardianResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RATE_LIMITS)?;

        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write a throttling window inside one write transaction.
    ///
    /// `update` receives the current value and returns the value to store
    /// (`None` removes the entry) plus the caller's result.
    pub fn update_rate_limit<T, R, F>(&self, key: &str, update: F) -> GuardianResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> (Option<T>, R),
    {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(RATE_LIMITS)?;
            let current: Option<T> = match table.get(key)? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };

            let (next, result) = update(current);
            match next {
                Some(value) => {
                    let bytes = serde_json::to_vec(&value)?;
                    table.insert(key, bytes.as_slice())?;
                }
                None => {
                    table.remove(key)?;
                }
            }
            result
        };
        write_txn.commit()?;
        tracing::trace!(key, "Updated rate limit window");
        Ok(result)
    }

    /// Delete a throttling window.
    pub fn delete_rate_limit(&self, key: &str) -> GuardianResult<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(RATE_LIMITS)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;

        if deleted {
            tracing::debug!(key, "Deleted rate limit window");
        }
        Ok(deleted)
    }
}

/// One bucket of the registered-users space, backed by its own table.
pub struct RedbBucket {
    db: Arc<Database>,
    table: String,
    closed: AtomicBool,
}

impl RedbBucket {
    fn definition(&self) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
        TableDefinition::new(&self.table)
    }

    fn ensure_open(&self) -> GuardianResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GuardianError::StorageClosed);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.table
    }
}

impl Storer for RedbBucket {
    fn put(&self, key: &[u8], data: &[u8]) -> GuardianResult<()> {
        self.ensure_open()?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(self.definition())?;
            table.insert(key, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> GuardianResult<Vec<u8>> {
        self.ensure_open()?;

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;

        table
            .get(key)?
            .map(|v| v.value().to_vec())
            .ok_or(GuardianError::KeyNotFound)
    }

    fn has(&self, key: &[u8]) -> GuardianResult<()> {
        self.ensure_open()?;

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.definition())?;

        if table.get(key)?.is_some() {
            Ok(())
        } else {
            Err(GuardianError::KeyNotFound)
        }
    }

    fn close(&self) -> GuardianResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(table = %self.table, "Closed bucket");
        }
        Ok(())
    }
}
