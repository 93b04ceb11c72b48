//! The controller context tying registry, connections, forwarding and jobs
//! together.

use std::sync::Arc;

use hive_proto::{ComputeId, ComputeRecord, ComputeSpec, ComputeUpdate, ForwardMethod, IdlePcRequest};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::error::{ComputeError, Result};
use crate::forward::ForwardingGateway;
use crate::jobs::{IdlePcJob, JobRunner};
use crate::registry::ComputeRegistry;
use crate::repository::{ComputeRepository, JsonRepository, MemoryRepository};
use crate::supervisor::{SupervisorHandle, start_supervisor};
use crate::transport::{Connector, HttpConnector};

/// Entry point for managing a fleet of compute nodes.
///
/// Built explicitly from its configuration, repository and connector; call
/// [`start`](Self::start) to load persisted records and
/// [`shutdown`](Self::shutdown) to close every session.
#[derive(Debug)]
pub struct Controller {
    config: ControllerConfig,
    registry: Arc<ComputeRegistry>,
    connections: Arc<ConnectionManager>,
    gateway: ForwardingGateway,
    jobs: JobRunner,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

impl Controller {
    /// Create a controller.
    #[must_use]
    pub fn new(
        config: ControllerConfig,
        repository: Arc<dyn ComputeRepository>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let registry = Arc::new(ComputeRegistry::new(repository));
        let settings = ConnectionSettings {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            expected_version: config.expected_version.clone(),
        };
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&registry),
            connector,
            settings,
        ));

        Self {
            gateway: ForwardingGateway::new(Arc::clone(&connections)),
            jobs: JobRunner::new(Arc::clone(&connections), config.job_timeout()),
            registry,
            connections,
            config,
            supervisor: Mutex::new(None),
        }
    }

    /// Create a controller with the HTTP connector, persisting to
    /// `state_dir` when configured and to memory otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or an existing
    /// snapshot cannot be read.
    pub fn from_config(config: ControllerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ComputeError::Validation(e.to_string()))?;

        let repository: Arc<dyn ComputeRepository> = match &config.state_dir {
            Some(dir) => Arc::new(JsonRepository::open(dir)?),
            None => Arc::new(MemoryRepository::new()),
        };
        let connector = HttpConnector::new().with_request_timeout(config.request_timeout());
        Ok(Self::new(config, repository, Arc::new(connector)))
    }

    /// Load persisted records and start the supervisor if enabled.
    ///
    /// Returns the number of records loaded.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the repository cannot be read.
    pub fn start(&self) -> Result<usize> {
        let loaded = self.registry.load()?;

        let supervisor = &self.config.supervisor;
        if supervisor.enabled {
            let mut slot = self.supervisor.lock();
            if slot.is_none() {
                *slot = Some(start_supervisor(
                    Arc::clone(&self.connections),
                    supervisor.check_interval(),
                    supervisor.reconnect(),
                ));
            }
        }

        info!(computes = loaded, supervisor = supervisor.enabled, "controller started");
        Ok(loaded)
    }

    /// Stop the supervisor and disconnect every compute.
    pub async fn shutdown(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            handle.stop();
        }
        self.connections.disconnect_all().await;
        info!("controller stopped");
    }

    /// Register a compute, optionally connecting to it right away.
    ///
    /// If the immediate connection fails the record is removed again.
    ///
    /// # Errors
    ///
    /// Returns the registry error, or the connection error of a failed
    /// immediate connect.
    pub async fn create_compute(&self, spec: ComputeSpec, connect: bool) -> Result<ComputeRecord> {
        let record = self.registry.create(spec)?;
        if !connect {
            return Ok(record);
        }

        let id = record.compute_id.clone();
        if let Err(err) = self.connections.connect(&id, true).await {
            self.connections.forget(&id);
            if let Err(e) = self.registry.delete(&id) {
                warn!(compute_id = %id, error = %e, "failed to roll back compute");
            }
            return Err(err);
        }
        self.registry.get(&id)
    }

    /// Get a compute record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the identifier is unknown.
    pub fn get_compute(&self, id: &ComputeId) -> Result<ComputeRecord> {
        self.registry.get(id)
    }

    /// All compute records, in creation order.
    #[must_use]
    pub fn list_computes(&self) -> Vec<ComputeRecord> {
        self.registry.list()
    }

    /// Update a compute.
    ///
    /// An open session is torn down when the address, scheme or credentials
    /// change; the next request reconnects.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Validation` or `Storage`.
    pub async fn update_compute(&self, id: &ComputeId, update: ComputeUpdate) -> Result<ComputeRecord> {
        self.connections.reconfigure(id, update).await
    }

    /// Disconnect and delete a compute.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `Storage` if the row cannot be removed.
    pub async fn delete_compute(&self, id: &ComputeId) -> Result<ComputeRecord> {
        self.connections.remove(id).await
    }

    /// Connect to a compute, reporting failures.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Authentication`, `Unreachable` or `Remote`.
    pub async fn connect(&self, id: &ComputeId) -> Result<ComputeRecord> {
        self.connections.connect(id, true).await?;
        self.registry.get(id)
    }

    /// Forward a request to a compute node.
    ///
    /// # Errors
    ///
    /// See [`ForwardingGateway::forward`].
    pub async fn forward(
        &self,
        id: &ComputeId,
        method: ForwardMethod,
        emulator: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        self.gateway.forward(id, method, emulator, path, body).await
    }

    /// List the images an emulator has on a compute node.
    ///
    /// # Errors
    ///
    /// See [`ForwardingGateway::list_images`].
    pub async fn images(&self, id: &ComputeId, emulator: &str) -> Result<Vec<String>> {
        self.gateway.list_images(id, emulator).await
    }

    /// Find the idle value for a router image on a compute node.
    ///
    /// # Errors
    ///
    /// See [`JobRunner::find_idle_value`].
    pub async fn auto_idlepc(&self, id: &ComputeId, request: IdlePcRequest) -> Result<String> {
        self.jobs
            .find_idle_value(id, &request.platform, &request.image, request.ram)
            .await
    }

    /// Start an idle-value search and return its handle.
    ///
    /// # Errors
    ///
    /// See [`JobRunner::submit`].
    pub async fn submit_idlepc(&self, id: &ComputeId, request: IdlePcRequest) -> Result<IdlePcJob> {
        self.jobs.submit(id, request).await
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The compute registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ComputeRegistry> {
        &self.registry
    }

    /// The connection manager.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// The forwarding gateway.
    #[must_use]
    pub const fn gateway(&self) -> &ForwardingGateway {
        &self.gateway
    }

    /// The job runner.
    #[must_use]
    pub const fn jobs(&self) -> &JobRunner {
        &self.jobs
    }

    /// Check whether the reconnect supervisor is running.
    #[must_use]
    pub fn supervisor_running(&self) -> bool {
        self.supervisor
            .lock()
            .as_ref()
            .is_some_and(SupervisorHandle::is_running)
    }
}
