//! Compute registry: the authoritative in-memory set of compute records.

use std::collections::HashMap;
use std::sync::Arc;

use hive_proto::{Capabilities, ComputeId, ComputeRecord, ComputeSpec, ComputeUpdate, ConnectionStatus};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{ComputeError, Result};
use crate::repository::ComputeRepository;

#[derive(Debug, Default)]
struct RegistryInner {
    computes: HashMap<ComputeId, ComputeRecord>,
    /// Insertion order, for deterministic listing.
    order: Vec<ComputeId>,
}

impl RegistryInner {
    fn insert(&mut self, record: ComputeRecord) {
        self.order.push(record.compute_id.clone());
        self.computes.insert(record.compute_id.clone(), record);
    }

    fn get_mut(&mut self, id: &ComputeId) -> Result<&mut ComputeRecord> {
        self.computes
            .get_mut(id)
            .ok_or_else(|| ComputeError::NotFound(id.clone()))
    }
}

/// Registry of compute records with write-through persistence.
///
/// Reads take a shared lock; mutations take the exclusive lock and persist
/// before touching memory, so a failed write leaves the registry unchanged.
/// The lock is never held across an `.await`.
#[derive(Debug)]
pub struct ComputeRegistry {
    inner: RwLock<RegistryInner>,
    repository: Arc<dyn ComputeRepository>,
}

impl ComputeRegistry {
    /// Create an empty registry writing through to `repository`.
    #[must_use]
    pub fn new(repository: Arc<dyn ComputeRepository>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            repository,
        }
    }

    /// Populate the registry from the repository.
    ///
    /// Records are ordered by creation time and start `disconnected`.
    /// Identifiers already present in memory are left alone.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository cannot be listed.
    pub fn load(&self) -> Result<usize> {
        let mut rows = self.repository.list()?;
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.compute_id.cmp(&b.compute_id))
        });

        let mut inner = self.inner.write();
        let mut loaded = 0;
        for mut record in rows {
            if inner.computes.contains_key(&record.compute_id) {
                continue;
            }
            record.status = ConnectionStatus::Disconnected;
            record.capabilities = None;
            inner.insert(record);
            loaded += 1;
        }
        info!(count = loaded, "loaded computes from storage");
        Ok(loaded)
    }

    /// Create a compute record.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed spec, `Conflict` if the identifier
    /// is taken and `Storage` if persisting fails.
    pub fn create(&self, spec: ComputeSpec) -> Result<ComputeRecord> {
        let record = ComputeRecord::from_spec(spec)?;
        let id = record.compute_id.clone();

        let mut inner = self.inner.write();
        if inner.computes.contains_key(&id) || self.repository.load(&id)?.is_some() {
            return Err(ComputeError::Conflict(format!("compute {id} already exists")));
        }

        self.repository.save(&record)?;
        inner.insert(record.clone());
        info!(compute_id = %id, host = %record.host, port = record.port, "compute created");
        Ok(record)
    }

    /// Get a copy of a compute record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the identifier is unknown.
    pub fn get(&self, id: &ComputeId) -> Result<ComputeRecord> {
        self.inner
            .read()
            .computes
            .get(id)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(id.clone()))
    }

    /// Check whether an identifier is registered.
    #[must_use]
    pub fn contains(&self, id: &ComputeId) -> bool {
        self.inner.read().computes.contains_key(id)
    }

    /// All records, in insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<ComputeRecord> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.computes.get(id).cloned())
            .collect()
    }

    /// Merge a partial update into a record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Validation` for an invalid merged record, or
    /// `Storage` if persisting fails.
    pub fn update(&self, id: &ComputeId, update: ComputeUpdate) -> Result<ComputeRecord> {
        let mut inner = self.inner.write();
        let current = inner.get_mut(id)?;

        let mut updated = current.clone();
        updated.apply(update)?;
        self.repository.save(&updated)?;
        *current = updated.clone();

        debug!(compute_id = %id, "compute updated");
        Ok(updated)
    }

    /// Delete a record from memory and storage.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the identifier is unknown, `Conflict` if its
    /// connection is still open, and `Storage` if the row cannot be removed.
    pub fn delete(&self, id: &ComputeId) -> Result<ComputeRecord> {
        let mut inner = self.inner.write();
        let record = inner
            .computes
            .get(id)
            .ok_or_else(|| ComputeError::NotFound(id.clone()))?;

        if record.status.is_open() {
            return Err(ComputeError::Conflict(format!(
                "compute {id} is still {}; disconnect it first",
                record.status.label()
            )));
        }

        self.repository.delete(id)?;
        inner.order.retain(|existing| existing != id);
        let removed = inner
            .computes
            .remove(id)
            .ok_or_else(|| ComputeError::NotFound(id.clone()))?;

        info!(compute_id = %id, "compute deleted");
        Ok(removed)
    }

    /// Current connection status of a record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the identifier is unknown.
    pub fn status(&self, id: &ComputeId) -> Result<ConnectionStatus> {
        self.inner
            .read()
            .computes
            .get(id)
            .map(|record| record.status.clone())
            .ok_or_else(|| ComputeError::NotFound(id.clone()))
    }

    /// Set the connection status of a record.
    ///
    /// Capabilities are cleared for every status other than `connected`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the identifier is unknown.
    pub(crate) fn set_status(&self, id: &ComputeId, status: ConnectionStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner.get_mut(id)?;
        if !status.is_connected() {
            record.capabilities = None;
        }
        record.status = status;
        Ok(())
    }

    /// Mark a record connected with the capabilities from its handshake.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the identifier is unknown.
    pub(crate) fn set_connected(&self, id: &ComputeId, capabilities: Capabilities) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner.get_mut(id)?;
        record.status = ConnectionStatus::Connected;
        record.capabilities = Some(capabilities);
        Ok(())
    }

    /// Number of registered computes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().computes.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().computes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, StorageError};
    use hive_proto::Protocol;

    // ==================== Helper Functions ====================

    fn make_registry() -> ComputeRegistry {
        ComputeRegistry::new(Arc::new(MemoryRepository::new()))
    }

    fn id(s: &str) -> ComputeId {
        ComputeId::parse(s).unwrap()
    }

    fn spec_with_id(s: &str) -> ComputeSpec {
        ComputeSpec::new("10.0.0.5", 8001).with_id(id(s))
    }

    /// Repository whose writes always fail.
    #[derive(Debug, Default)]
    struct BrokenRepository;

    impl ComputeRepository for BrokenRepository {
        fn save(&self, _record: &ComputeRecord) -> std::result::Result<(), StorageError> {
            Err(StorageError("database is locked".to_string()))
        }

        fn load(&self, _id: &ComputeId) -> std::result::Result<Option<ComputeRecord>, StorageError> {
            Ok(None)
        }

        fn list(&self) -> std::result::Result<Vec<ComputeRecord>, StorageError> {
            Err(StorageError("database is locked".to_string()))
        }

        fn delete(&self, _id: &ComputeId) -> std::result::Result<(), StorageError> {
            Err(StorageError("database is locked".to_string()))
        }
    }

    // ==================== Create Tests ====================

    #[test]
    fn test_registry_new_is_empty() {
        let registry = make_registry();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_create_generates_id() {
        let registry = make_registry();

        let record = registry.create(ComputeSpec::new("10.0.0.5", 8001)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&record.compute_id).unwrap().compute_id, record.compute_id);
        assert_eq!(record.status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_create_duplicate_id_conflicts() {
        let registry = make_registry();
        registry.create(spec_with_id("local")).unwrap();

        let result = registry.create(spec_with_id("local"));

        assert!(matches!(result, Err(ComputeError::Conflict(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_conflicts_with_persisted_row() {
        let repository = Arc::new(MemoryRepository::new());
        let existing = ComputeRecord::from_spec(spec_with_id("stale")).unwrap();
        repository.save(&existing).unwrap();
        let registry = ComputeRegistry::new(repository);

        let result = registry.create(spec_with_id("stale"));

        assert!(matches!(result, Err(ComputeError::Conflict(_))));
    }

    #[test]
    fn test_create_invalid_spec() {
        let registry = make_registry();

        let result = registry.create(ComputeSpec::new("not a host", 8001));

        assert!(matches!(result, Err(ComputeError::Validation(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_storage_failure_leaves_registry_empty() {
        let registry = ComputeRegistry::new(Arc::new(BrokenRepository));

        let result = registry.create(spec_with_id("local"));

        assert!(matches!(result, Err(ComputeError::Storage(_))));
        assert!(registry.is_empty());
    }

    // ==================== Get / List Tests ====================

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = make_registry();
        assert!(matches!(
            registry.get(&id("nope")),
            Err(ComputeError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_keeps_insertion_order() {
        let registry = make_registry();
        for name in ["zeta", "alpha", "mid"] {
            registry.create(spec_with_id(name)).unwrap();
        }

        let ids: Vec<String> = registry
            .list()
            .into_iter()
            .map(|r| r.compute_id.to_string())
            .collect();

        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }

    // ==================== Update Tests ====================

    #[test]
    fn test_update_merges_and_keeps_id() {
        let registry = make_registry();
        registry.create(spec_with_id("local")).unwrap();

        let updated = registry
            .update(
                &id("local"),
                ComputeUpdate {
                    protocol: Some(Protocol::Https),
                    name: Some("Main".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.compute_id, id("local"));
        assert_eq!(updated.protocol, Protocol::Https);
        assert_eq!(updated.name, "Main");
        assert_eq!(updated.host, "10.0.0.5");
        assert_eq!(registry.get(&id("local")).unwrap(), updated);
    }

    #[test]
    fn test_update_revalidates_address() {
        let registry = make_registry();
        registry.create(spec_with_id("local")).unwrap();

        let result = registry.update(
            &id("local"),
            ComputeUpdate {
                port: Some(0),
                ..Default::default()
            },
        );

        assert!(matches!(result, Err(ComputeError::Validation(_))));
        assert_eq!(registry.get(&id("local")).unwrap().port, 8001);
    }

    #[test]
    fn test_update_keeps_status() {
        let registry = make_registry();
        registry.create(spec_with_id("local")).unwrap();
        registry
            .set_status(&id("local"), ConnectionStatus::failed("boom"))
            .unwrap();

        let updated = registry
            .update(
                &id("local"),
                ComputeUpdate {
                    name: Some("x".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(updated.status.is_failed());
    }

    #[test]
    fn test_update_unknown_is_not_found() {
        let registry = make_registry();
        let result = registry.update(&id("nope"), ComputeUpdate::default());
        assert!(matches!(result, Err(ComputeError::NotFound(_))));
    }

    // ==================== Delete Tests ====================

    #[test]
    fn test_delete_then_get_is_not_found() {
        let registry = make_registry();
        registry.create(spec_with_id("local")).unwrap();

        registry.delete(&id("local")).unwrap();

        assert!(matches!(
            registry.get(&id("local")),
            Err(ComputeError::NotFound(_))
        ));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let registry = make_registry();
        assert!(matches!(
            registry.delete(&id("nope")),
            Err(ComputeError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_connected_is_conflict() {
        let registry = make_registry();
        registry.create(spec_with_id("local")).unwrap();
        registry
            .set_status(&id("local"), ConnectionStatus::Connected)
            .unwrap();

        let result = registry.delete(&id("local"));

        assert!(matches!(result, Err(ComputeError::Conflict(_))));
        assert!(registry.contains(&id("local")));
    }

    #[test]
    fn test_delete_removes_persisted_row() {
        let repository = Arc::new(MemoryRepository::new());
        let registry = ComputeRegistry::new(Arc::clone(&repository) as Arc<dyn ComputeRepository>);
        registry.create(spec_with_id("local")).unwrap();

        registry.delete(&id("local")).unwrap();

        assert!(repository.load(&id("local")).unwrap().is_none());
    }

    // ==================== Load / Status Tests ====================

    #[test]
    fn test_load_restores_disconnected_records() {
        let repository = Arc::new(MemoryRepository::new());
        let mut first = ComputeRecord::from_spec(spec_with_id("first")).unwrap();
        first.status = ConnectionStatus::Connected;
        let mut second = ComputeRecord::from_spec(spec_with_id("second")).unwrap();
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        repository.save(&second).unwrap();
        repository.save(&first).unwrap();

        let registry = ComputeRegistry::new(repository);
        assert_eq!(registry.load().unwrap(), 2);

        let records = registry.list();
        assert_eq!(records[0].compute_id, id("first"));
        assert_eq!(records[1].compute_id, id("second"));
        assert!(records.iter().all(|r| r.status == ConnectionStatus::Disconnected));
    }

    #[test]
    fn test_load_storage_failure() {
        let registry = ComputeRegistry::new(Arc::new(BrokenRepository));
        assert!(matches!(registry.load(), Err(ComputeError::Storage(_))));
    }

    #[test]
    fn test_set_connected_and_status_clear_capabilities() {
        let registry = make_registry();
        registry.create(spec_with_id("local")).unwrap();
        let caps = Capabilities {
            version: "3.0.0".to_string(),
            platform: None,
            cpus: None,
            memory: None,
            disk_size: None,
            node_types: vec![],
        };

        registry.set_connected(&id("local"), caps).unwrap();
        assert!(registry.status(&id("local")).unwrap().is_connected());
        assert!(registry.get(&id("local")).unwrap().capabilities.is_some());

        registry
            .set_status(&id("local"), ConnectionStatus::Disconnected)
            .unwrap();
        assert!(registry.get(&id("local")).unwrap().capabilities.is_none());
    }
}
