//! Connection manager: session lifecycle and status transitions per compute.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hive_proto::{Capabilities, ComputeId, ComputeRecord, ComputeUpdate, ConnectionStatus};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ComputeError, Result};
use crate::registry::ComputeRegistry;
use crate::transport::{Connector, NodeRequest, NodeResponse, NodeSession, TransportError};

/// Timeouts and version requirements applied to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Timeout for opening a session and the capability handshake.
    pub connect_timeout: Duration,
    /// Default timeout for requests sent on a session.
    pub request_timeout: Duration,
    /// Required `major.minor` of the node version.
    pub expected_version: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(crate::config::DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(crate::config::DEFAULT_REQUEST_TIMEOUT_SECS),
            expected_version: None,
        }
    }
}

/// The session slot of one compute.
///
/// The async lock serializes status transitions of that compute: connect,
/// disconnect and failure marking all go through it.
#[derive(Debug, Default)]
struct SessionSlot {
    session: tokio::sync::Mutex<Option<Arc<dyn NodeSession>>>,
}

/// Owns the sessions to compute nodes and drives their status.
#[derive(Debug)]
pub struct ConnectionManager {
    registry: Arc<ComputeRegistry>,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    slots: Mutex<HashMap<ComputeId, Arc<SessionSlot>>>,
}

impl ConnectionManager {
    /// Create a connection manager.
    #[must_use]
    pub fn new(
        registry: Arc<ComputeRegistry>,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            registry,
            connector,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The registry whose records this manager drives.
    #[must_use]
    pub fn registry(&self) -> &Arc<ComputeRegistry> {
        &self.registry
    }

    /// Session settings.
    #[must_use]
    pub const fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn slot(&self, id: &ComputeId) -> Arc<SessionSlot> {
        Arc::clone(self.slots.lock().entry(id.clone()).or_default())
    }

    /// Connect to a compute.
    ///
    /// A no-op when the compute is already connected. Otherwise the status
    /// moves to `connecting`, a session is opened and the capability
    /// handshake runs; the status ends as `connected` or `failed`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown identifier. When `report_failure` is
    /// set, a failed attempt is returned as `Authentication`, `Unreachable`
    /// or `Remote`; otherwise it is only recorded in the status.
    pub async fn connect(&self, id: &ComputeId, report_failure: bool) -> Result<()> {
        self.connect_session(id).await.map(|_| ()).or_else(|err| {
            if report_failure || matches!(err, ComputeError::NotFound(_)) {
                Err(err)
            } else {
                Ok(())
            }
        })
    }

    async fn connect_session(&self, id: &ComputeId) -> Result<Arc<dyn NodeSession>> {
        // Fail fast on unknown identifiers without creating a slot.
        self.registry.get(id)?;

        let slot = self.slot(id);
        let mut guard = slot.session.lock().await;

        // The record may have changed while we waited for the lock.
        let record = self.registry.get(id)?;
        if let Some(session) = guard.as_ref() {
            if record.status.is_connected() {
                return Ok(Arc::clone(session));
            }
        }
        *guard = None;

        self.registry.set_status(id, ConnectionStatus::Connecting)?;
        let attempt = PendingConnect::new(&self.registry, id);
        debug!(compute_id = %id, host = %record.host, port = record.port, "connecting to compute");

        let outcome = self.handshake(&record).await;
        attempt.settle();
        match outcome {
            Ok((session, capabilities)) => {
                let version = capabilities.version.clone();
                self.registry.set_connected(id, capabilities)?;
                *guard = Some(Arc::clone(&session));
                info!(compute_id = %id, version = %version, "compute connected");
                Ok(session)
            }
            Err(err) => {
                warn!(compute_id = %id, error = %err, "failed to connect to compute");
                if let Err(e) = self
                    .registry
                    .set_status(id, ConnectionStatus::failed(err.to_string()))
                {
                    debug!(compute_id = %id, error = %e, "compute vanished during connect");
                }
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        record: &ComputeRecord,
    ) -> Result<(Arc<dyn NodeSession>, Capabilities)> {
        let id = &record.compute_id;
        let timeout = self.settings.connect_timeout;

        let session = self
            .connector
            .open(&record.endpoint(), timeout)
            .map_err(|e| ComputeError::unreachable(id, e.to_string()))?;

        let response = session
            .send(NodeRequest::get("capabilities").with_timeout(timeout))
            .await
            .map_err(|e| ComputeError::unreachable(id, e.to_string()))?;

        let capabilities = self.check_capabilities(id, &response)?;
        Ok((session, capabilities))
    }

    fn check_capabilities(&self, id: &ComputeId, response: &NodeResponse) -> Result<Capabilities> {
        match response.status {
            401 | 403 => {
                return Err(ComputeError::Authentication {
                    compute_id: id.clone(),
                    message: response.error_message(),
                });
            }
            _ if !response.is_success() => {
                return Err(ComputeError::remote(id, response.status, response.error_message()));
            }
            _ => {}
        }

        let capabilities: Capabilities = response.json().map_err(|_| {
            ComputeError::remote(
                id,
                response.status,
                "invalid capabilities response, not a compute server",
            )
        })?;

        if let Some(expected) = &self.settings.expected_version {
            if !capabilities.is_compatible_with(expected) {
                return Err(ComputeError::remote(
                    id,
                    response.status,
                    format!(
                        "incompatible version {} on compute, expected {expected}",
                        capabilities.version
                    ),
                ));
            }
        }
        Ok(capabilities)
    }

    /// Check whether a compute is connected.
    #[must_use]
    pub fn is_connected(&self, id: &ComputeId) -> bool {
        self.registry
            .status(id)
            .is_ok_and(|status| status.is_connected())
    }

    /// The active session of a compute, connecting first when needed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or the connection error of a failed attempt.
    pub async fn session(&self, id: &ComputeId) -> Result<Arc<dyn NodeSession>> {
        self.connect_session(id).await
    }

    /// Send a request on `session`.
    ///
    /// A transport failure marks the compute `failed` and is returned as
    /// `Unreachable`. Non-2xx responses are returned as-is.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the request could not be completed.
    pub async fn request(
        &self,
        id: &ComputeId,
        session: &Arc<dyn NodeSession>,
        request: NodeRequest,
    ) -> Result<NodeResponse> {
        let request = if request.timeout.is_some() {
            request
        } else {
            request.with_timeout(self.settings.request_timeout)
        };

        match session.send(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                let reason = err.to_string();
                self.mark_failed(id, session, &reason).await;
                Err(transport_error(id, &err))
            }
        }
    }

    /// Mark a compute `failed`, if `session` is still its active session.
    ///
    /// A late failure of an old session never clobbers a newer one.
    pub async fn mark_failed(&self, id: &ComputeId, session: &Arc<dyn NodeSession>, reason: &str) {
        let slot = self.slot(id);
        let mut guard = slot.session.lock().await;
        let is_active = guard
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, session));
        if !is_active {
            debug!(compute_id = %id, "ignoring failure of a stale session");
            return;
        }

        *guard = None;
        warn!(compute_id = %id, reason = %reason, "compute session failed");
        if let Err(e) = self
            .registry
            .set_status(id, ConnectionStatus::failed(reason))
        {
            debug!(compute_id = %id, error = %e, "compute vanished before failure was recorded");
        }
    }

    /// Tear down the session of a compute and mark it `disconnected`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown identifier.
    pub async fn disconnect(&self, id: &ComputeId) -> Result<()> {
        self.registry.get(id)?;
        let slot = self.slot(id);
        let mut guard = slot.session.lock().await;
        let had_session = guard.take().is_some();
        self.registry.set_status(id, ConnectionStatus::Disconnected)?;
        if had_session {
            info!(compute_id = %id, "compute disconnected");
        }
        Ok(())
    }

    /// Disconnect every compute.
    pub async fn disconnect_all(&self) {
        let ids: Vec<ComputeId> = self.slots.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                debug!(compute_id = %id, error = %e, "skipping disconnect");
            }
        }
    }

    /// Drop the slot of a deleted compute.
    pub fn forget(&self, id: &ComputeId) {
        self.slots.lock().remove(id);
    }

    /// Apply an update to a record under its session lock.
    ///
    /// When the update changes the address, scheme or credentials, the
    /// session is torn down and the status reset to `disconnected` before
    /// any queued connect can reuse it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `Validation` or `Storage`.
    pub async fn reconfigure(&self, id: &ComputeId, update: ComputeUpdate) -> Result<ComputeRecord> {
        self.registry.get(id)?;
        let slot = self.slot(id);
        let mut guard = slot.session.lock().await;

        let changes_endpoint = update.changes_endpoint();
        let updated = self.registry.update(id, update)?;
        if !changes_endpoint {
            return Ok(updated);
        }

        if guard.take().is_some() {
            info!(compute_id = %id, "endpoint changed, compute disconnected");
        }
        self.registry.set_status(id, ConnectionStatus::Disconnected)?;
        self.registry.get(id)
    }

    /// Tear down the session of a compute and delete its record.
    ///
    /// Teardown and removal happen under the session lock, so a connect
    /// queued behind it finds the record gone.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `Storage` if the row cannot be removed.
    pub async fn remove(&self, id: &ComputeId) -> Result<ComputeRecord> {
        self.registry.get(id)?;
        let slot = self.slot(id);
        let mut guard = slot.session.lock().await;

        let had_session = guard.take().is_some();
        self.registry.set_status(id, ConnectionStatus::Disconnected)?;
        let removed = self.registry.delete(id)?;
        self.slots.lock().remove(id);
        if had_session {
            info!(compute_id = %id, "compute disconnected");
        }
        Ok(removed)
    }
}

/// Resets a `connecting` record if its connect future is dropped mid-attempt.
///
/// Dropped while the slot lock is still held, so no other transition can
/// interleave.
struct PendingConnect<'a> {
    registry: &'a ComputeRegistry,
    id: &'a ComputeId,
    armed: bool,
}

impl<'a> PendingConnect<'a> {
    const fn new(registry: &'a ComputeRegistry, id: &'a ComputeId) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(compute_id = %self.id, "connect cancelled");
        if let Err(e) = self
            .registry
            .set_status(self.id, ConnectionStatus::Disconnected)
        {
            debug!(compute_id = %self.id, error = %e, "compute vanished during connect");
        }
    }
}

/// Map a transport failure on a compute to a [`ComputeError`].
pub(crate) fn transport_error(id: &ComputeId, err: &TransportError) -> ComputeError {
    ComputeError::unreachable(id, err.to_string())
}
