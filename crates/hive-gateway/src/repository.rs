//! Persistence interface for compute records.
//!
//! The registry writes through a [`ComputeRepository`] on every mutation.
//! Two implementations ship with the crate: [`MemoryRepository`] for
//! controllers without a state directory, and [`JsonRepository`] which keeps
//! one row per compute in `<state_dir>/computes.json`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use hive_persist::{JsonStore, PersistError};
use hive_proto::{ComputeId, ComputeRecord};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::error::ComputeError;

/// A persistence failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

impl From<PersistError> for StorageError {
    fn from(err: PersistError) -> Self {
        Self(err.to_string())
    }
}

impl From<StorageError> for ComputeError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.0)
    }
}

/// Storage for compute records, keyed by identifier.
pub trait ComputeRepository: Send + Sync + fmt::Debug {
    /// Insert or replace the row for `record.compute_id`.
    fn save(&self, record: &ComputeRecord) -> Result<(), StorageError>;

    /// Fetch one row.
    fn load(&self, id: &ComputeId) -> Result<Option<ComputeRecord>, StorageError>;

    /// Fetch every row.
    fn list(&self) -> Result<Vec<ComputeRecord>, StorageError>;

    /// Remove a row. Removing an absent row is not an error.
    fn delete(&self, id: &ComputeId) -> Result<(), StorageError>;
}

/// Repository that keeps rows in memory only.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    rows: Mutex<HashMap<ComputeId, ComputeRecord>>,
}

impl MemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComputeRepository for MemoryRepository {
    fn save(&self, record: &ComputeRecord) -> Result<(), StorageError> {
        self.rows
            .lock()
            .insert(record.compute_id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, id: &ComputeId) -> Result<Option<ComputeRecord>, StorageError> {
        Ok(self.rows.lock().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<ComputeRecord>, StorageError> {
        Ok(self.rows.lock().values().cloned().collect())
    }

    fn delete(&self, id: &ComputeId) -> Result<(), StorageError> {
        self.rows.lock().remove(id);
        Ok(())
    }
}

/// Repository backed by a [`JsonStore`] snapshot.
///
/// Every mutation rewrites the snapshot; if the write fails the in-memory
/// mirror is rolled back so it never drifts from disk.
#[derive(Debug)]
pub struct JsonRepository {
    rows: Mutex<HashMap<String, ComputeRecord>>,
    store: JsonStore,
}

impl JsonRepository {
    /// Open `<state_dir>/computes.json`, loading existing rows.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing snapshot cannot be read or decoded.
    pub fn open(state_dir: &Path) -> Result<Self, StorageError> {
        let store = JsonStore::new(state_dir, "computes");
        let rows: HashMap<String, ComputeRecord> = store.try_load()?;
        debug!(count = rows.len(), path = %store.path().display(), "loaded compute rows");
        Ok(Self {
            rows: Mutex::new(rows),
            store,
        })
    }
}

impl ComputeRepository for JsonRepository {
    fn save(&self, record: &ComputeRecord) -> Result<(), StorageError> {
        let mut rows = self.rows.lock();
        let key = record.compute_id.to_string();
        let previous = rows.insert(key.clone(), record.clone());
        if let Err(e) = self.store.save(&*rows) {
            match previous {
                Some(previous) => rows.insert(key, previous),
                None => rows.remove(&key),
            };
            return Err(e.into());
        }
        Ok(())
    }

    fn load(&self, id: &ComputeId) -> Result<Option<ComputeRecord>, StorageError> {
        Ok(self.rows.lock().get(id.as_str()).cloned())
    }

    fn list(&self) -> Result<Vec<ComputeRecord>, StorageError> {
        Ok(self.rows.lock().values().cloned().collect())
    }

    fn delete(&self, id: &ComputeId) -> Result<(), StorageError> {
        let mut rows = self.rows.lock();
        let Some(previous) = rows.remove(id.as_str()) else {
            return Ok(());
        };
        if let Err(e) = self.store.save(&*rows) {
            rows.insert(id.to_string(), previous);
            return Err(e.into());
        }
        Ok(())
    }
}
