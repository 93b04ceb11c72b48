//! Forwarding gateway: relays emulator requests to compute nodes.

use std::sync::Arc;

use hive_proto::{ComputeId, ForwardMethod};
use serde_json::Value;
use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::error::{ComputeError, ErrorKind, Result};
use crate::transport::{NodeRequest, NodeResponse};

/// Relays requests to `/v3/compute/{emulator}/{path}` on a compute node.
#[derive(Debug, Clone)]
pub struct ForwardingGateway {
    connections: Arc<ConnectionManager>,
}

impl ForwardingGateway {
    /// Create a gateway sending through `connections`.
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Forward a request to a compute node and return its JSON payload.
    ///
    /// Connects first when the compute is not connected. `body` is sent for
    /// `POST` and `PUT` only. Nothing is retried.
    ///
    /// # Errors
    ///
    /// Returns `Remote` with the node's status and message for a non-2xx
    /// answer, `Unreachable` if the request could not be completed (the
    /// compute is then `failed`), or the connection error of a failed
    /// connect.
    pub async fn forward(
        &self,
        id: &ComputeId,
        method: ForwardMethod,
        emulator: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let route = route(emulator, path);
        let mut request = NodeRequest::new(method, &route);
        if let Some(body) = body {
            request = request.with_body(body);
        }

        let session = self.connections.session(id).await?;
        debug!(compute_id = %id, method = %method, route = %route, "forwarding request");
        let response = self.connections.request(id, &session, request).await?;
        decode_payload(id, &response)
    }

    /// List the image names an emulator has on a compute node.
    ///
    /// Retried once, with a fresh connect, if the compute is unreachable.
    ///
    /// # Errors
    ///
    /// Same as [`forward`](Self::forward).
    pub async fn list_images(&self, id: &ComputeId, emulator: &str) -> Result<Vec<String>> {
        let payload = match self
            .forward(id, ForwardMethod::Get, emulator, "images", None)
            .await
        {
            Err(err) if err.kind() == ErrorKind::Unreachable => {
                info!(compute_id = %id, error = %err, "retrying image listing");
                self.forward(id, ForwardMethod::Get, emulator, "images", None)
                    .await?
            }
            other => other?,
        };
        Ok(parse_image_names(&payload))
    }
}

fn route(emulator: &str, path: &str) -> String {
    let emulator = emulator.trim_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        emulator.to_string()
    } else {
        format!("{emulator}/{path}")
    }
}

/// Map a node response to its payload, or to `Remote` for a non-2xx status.
pub(crate) fn decode_payload(id: &ComputeId, response: &NodeResponse) -> Result<Value> {
    if response.is_success() {
        Ok(response.payload())
    } else {
        Err(ComputeError::remote(id, response.status, response.error_message()))
    }
}

/// Extract image names from an image listing.
///
/// Entries are either strings or objects naming the image in `filename`,
/// `path` or `image`; anything else is skipped.
fn parse_image_names(payload: &Value) -> Vec<String> {
    let Some(entries) = payload.as_array() else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(name.clone()),
            Value::Object(map) => ["filename", "path", "image"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::to_string),
            _ => None,
        })
        .collect()
}
