//! Transport seam between the controller and compute nodes.
//!
//! A [`Connector`] opens a [`NodeSession`] to an [`Endpoint`]; a session sends
//! [`NodeRequest`]s under the node's `/v3/compute` prefix. [`HttpConnector`]
//! is the production implementation on top of `reqwest`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use hive_proto::{Endpoint, ForwardMethod};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

/// Path prefix of the compute node API.
pub const COMPUTE_API_PREFIX: &str = "/v3/compute";

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The node could not be reached.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection dropped mid-request.
    #[error("connection dropped: {0}")]
    Dropped(String),

    /// The client could not be configured.
    #[error("transport configuration error: {0}")]
    Config(String),
}

/// A request to a compute node, relative to [`COMPUTE_API_PREFIX`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRequest {
    /// HTTP method.
    pub method: ForwardMethod,
    /// Path below the API prefix, without a leading `/`.
    pub path: String,
    /// JSON body, sent for write methods only.
    pub body: Option<Value>,
    /// Per-request timeout overriding the session default.
    pub timeout: Option<Duration>,
}

impl NodeRequest {
    /// Create a request without a body.
    #[must_use]
    pub fn new(method: ForwardMethod, path: impl AsRef<str>) -> Self {
        Self {
            method,
            path: path.as_ref().trim_start_matches('/').to_string(),
            body: None,
            timeout: None,
        }
    }

    /// Create a `GET` request.
    #[must_use]
    pub fn get(path: impl AsRef<str>) -> Self {
        Self::new(ForwardMethod::Get, path)
    }

    /// Create a `POST` request with a JSON body.
    #[must_use]
    pub fn post(path: impl AsRef<str>, body: Value) -> Self {
        Self::new(ForwardMethod::Post, path).with_body(body)
    }

    /// Set the JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Body to put on the wire: `None` for `GET` and `DELETE`.
    #[must_use]
    pub fn wire_body(&self) -> Option<&Value> {
        if self.method.is_write() {
            self.body.as_ref()
        } else {
            None
        }
    }
}

/// A response from a compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
}

impl NodeResponse {
    /// Create a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Create a response with a JSON body.
    #[must_use]
    pub fn json_body(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    /// Check for a 2xx status.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Decode the body as `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Body as text, lossily decoded.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body as a JSON payload: empty is `null`, non-JSON text is a string.
    #[must_use]
    pub fn payload(&self) -> Value {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Value::Null;
        }
        self.json().unwrap_or_else(|_| Value::String(self.text()))
    }

    /// Error message reported by the node.
    ///
    /// The `message` field of a JSON body, else the raw text, else the
    /// canonical reason of the status code.
    #[must_use]
    pub fn error_message(&self) -> String {
        if let Ok(Value::Object(map)) = self.json::<Value>() {
            if let Some(Value::String(message)) = map.get("message") {
                return message.clone();
            }
        }

        let text = self.text();
        let text = text.trim();
        if !text.is_empty() {
            return text.to_string();
        }

        reqwest::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .map_or_else(|| format!("HTTP {}", self.status), str::to_string)
    }
}

/// An open session to one compute node.
pub trait NodeSession: Send + Sync + fmt::Debug {
    /// Send one request and wait for the complete response.
    fn send(&self, request: NodeRequest) -> BoxFuture<'_, Result<NodeResponse, TransportError>>;
}

/// Opens sessions to compute nodes.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a session to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be set up.
    fn open(
        &self,
        endpoint: &Endpoint,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn NodeSession>, TransportError>;
}

/// [`Connector`] speaking HTTP(S) through `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    request_timeout: Option<Duration>,
}

impl HttpConnector {
    /// Create a connector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout applied to requests that do not carry their own.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

impl Connector for HttpConnector {
    fn open(
        &self,
        endpoint: &Endpoint,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn NodeSession>, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Arc::new(HttpSession {
            client,
            base_url: format!("{}{COMPUTE_API_PREFIX}", endpoint.base_url()),
            credentials: endpoint
                .credentials
                .as_ref()
                .map(|c| (c.user.clone(), c.password.as_ref().map(|p| p.expose().to_string()))),
            default_timeout: self.request_timeout,
        }))
    }
}

/// Session holding one `reqwest::Client` for one node.
struct HttpSession {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
    default_timeout: Option<Duration>,
}

impl fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSession")
            .field("base_url", &self.base_url)
            .field("user", &self.credentials.as_ref().map(|(user, _)| user))
            .finish_non_exhaustive()
    }
}

impl HttpSession {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn execute(&self, request: NodeRequest) -> Result<NodeResponse, TransportError> {
        let method = match request.method {
            ForwardMethod::Get => reqwest::Method::GET,
            ForwardMethod::Post => reqwest::Method::POST,
            ForwardMethod::Put => reqwest::Method::PUT,
            ForwardMethod::Delete => reqwest::Method::DELETE,
        };
        let url = self.url(&request.path);
        trace!(method = %request.method, url = %url, "sending node request");

        let mut builder = self.client.request(method, &url);
        if let Some((user, password)) = &self.credentials {
            builder = builder.basic_auth(user, password.as_deref());
        }
        let timeout = request.timeout.or(self.default_timeout);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.wire_body() {
            builder = builder.json(body);
        }

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout(timeout.unwrap_or_default())
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Dropped(e.to_string())
            }
        };

        let response = builder.send().await.map_err(map_err)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_err)?;
        Ok(NodeResponse::new(status, body.to_vec()))
    }
}

impl NodeSession for HttpSession {
    fn send(&self, request: NodeRequest) -> BoxFuture<'_, Result<NodeResponse, TransportError>> {
        Box::pin(self.execute(request))
    }
}
