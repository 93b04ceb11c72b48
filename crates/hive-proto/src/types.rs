//! Core types for compute records and their connection state.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtoError;
use crate::validation::{
    validate_compute_id, validate_host, validate_name, validate_port, validate_user,
    ValidationError,
};

/// Stable identifier of a compute node.
///
/// Either supplied by the caller at creation time or generated as a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ComputeId(String);

impl ComputeId {
    /// Generate a new random `ComputeId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a caller-supplied `ComputeId`.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty, too long or malformed.
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        validate_compute_id(s)?;
        Ok(Self(s.to_string()))
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ComputeId {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_compute_id(&value)?;
        Ok(Self(value))
    }
}

impl From<ComputeId> for String {
    fn from(id: ComputeId) -> Self {
        id.0
    }
}

impl FromStr for ComputeId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ComputeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport scheme used to reach a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP.
    #[default]
    Http,
    /// HTTP over TLS.
    Https,
}

impl Protocol {
    /// URL scheme for this protocol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(ProtoError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A password that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    /// Wrap a password.
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    /// Access the plain-text password.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Credentials presented to a compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub user: String,
    /// Optional password.
    pub password: Option<Password>,
}

/// Everything needed to open a session to a compute node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Transport scheme.
    pub protocol: Protocol,
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Optional credentials.
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    /// Base URL of the node, e.g. `http://10.0.0.5:8001`.
    ///
    /// IPv6 literals are bracketed.
    #[must_use]
    pub fn base_url(&self) -> String {
        let is_ipv6 = matches!(self.host.parse::<IpAddr>(), Ok(IpAddr::V6(_)));
        if is_ipv6 {
            format!("{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.protocol, self.host, self.port)
        }
    }
}

/// Connection status of a compute node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session is open.
    #[default]
    Disconnected,
    /// A session is being opened.
    Connecting,
    /// A session is open and the handshake succeeded.
    Connected,
    /// The last connection attempt or request failed.
    Failed {
        /// Why the node is considered failed.
        reason: String,
    },
}

impl ConnectionStatus {
    /// Create a failed status.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Check if the node is connected.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a session is open or being opened.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Connected | Self::Connecting)
    }

    /// Check if the node is in the failed state.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Short label of the state.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Capabilities reported by a compute node during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Server version, e.g. `3.0.1`.
    pub version: String,
    /// Host platform of the node.
    #[serde(default)]
    pub platform: Option<String>,
    /// Number of CPUs.
    #[serde(default)]
    pub cpus: Option<u32>,
    /// Total memory in bytes.
    #[serde(default)]
    pub memory: Option<u64>,
    /// Disk size in bytes.
    #[serde(default)]
    pub disk_size: Option<u64>,
    /// Node types the compute can run.
    #[serde(default)]
    pub node_types: Vec<String>,
}

impl Capabilities {
    /// `(major, minor)` of the reported version, if it parses.
    #[must_use]
    pub fn major_minor(&self) -> Option<(u32, u32)> {
        parse_major_minor(&self.version)
    }

    /// Check whether the node's `major.minor` matches `expected`.
    #[must_use]
    pub fn is_compatible_with(&self, expected: &str) -> bool {
        match (self.major_minor(), parse_major_minor(expected)) {
            (Some(actual), Some(wanted)) => actual == wanted,
            _ => false,
        }
    }
}

/// Parse the leading `major.minor` of a version string such as `3.0.0a2`.
#[must_use]
pub fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = leading_number(parts.next()?)?;
    let minor = parts.next().and_then(leading_number).unwrap_or(0);
    Some((major, minor))
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Caller input for creating a compute record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeSpec {
    /// Requested identifier; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_id: Option<ComputeId>,
    /// Transport scheme.
    #[serde(default)]
    pub protocol: Protocol,
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Display name; defaults to `host:port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User for basic authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password for basic authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,
}

impl ComputeSpec {
    /// Create a spec for the given address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            compute_id: None,
            protocol: Protocol::default(),
            host: host.into(),
            port,
            name: None,
            user: None,
            password: None,
        }
    }

    /// Set the requested identifier.
    #[must_use]
    pub fn with_id(mut self, id: ComputeId) -> Self {
        self.compute_id = Some(id);
        self
    }

    /// Set the transport scheme.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set basic-auth credentials.
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(Password::new(password));
        self
    }

    /// Validate the spec.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_host(&self.host)?;
        validate_port(self.port)?;
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        validate_credentials(self.user.as_deref(), self.password.as_ref())
    }
}

/// Partial update of a compute record. Only supplied fields are merged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComputeUpdate {
    /// New transport scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// New host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// New port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// New display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// New password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,
}

impl ComputeUpdate {
    /// Check whether the update carries no field at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.protocol.is_none()
            && self.host.is_none()
            && self.port.is_none()
            && self.name.is_none()
            && self.user.is_none()
            && self.password.is_none()
    }

    /// Check whether the update touches how the node is reached.
    #[must_use]
    pub const fn changes_endpoint(&self) -> bool {
        self.protocol.is_some()
            || self.host.is_some()
            || self.port.is_some()
            || self.user.is_some()
            || self.password.is_some()
    }
}

/// A registered compute node.
///
/// `status` and `capabilities` are runtime state and are not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeRecord {
    /// Immutable identifier.
    pub compute_id: ComputeId,
    /// Display name.
    pub name: String,
    /// Transport scheme.
    pub protocol: Protocol,
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// User for basic authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password for basic authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,
    /// Connection status.
    #[serde(skip)]
    pub status: ConnectionStatus,
    /// Capabilities reported by the last successful handshake.
    #[serde(skip)]
    pub capabilities: Option<Capabilities>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl ComputeRecord {
    /// Build a record from a validated spec, generating an identifier if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the spec is invalid.
    pub fn from_spec(spec: ComputeSpec) -> Result<Self, ValidationError> {
        spec.validate()?;
        let now = Utc::now();
        let name = spec
            .name
            .unwrap_or_else(|| format!("{}:{}", spec.host, spec.port));
        Ok(Self {
            compute_id: spec.compute_id.unwrap_or_else(ComputeId::generate),
            name,
            protocol: spec.protocol,
            host: spec.host,
            port: spec.port,
            user: spec.user,
            password: spec.password,
            status: ConnectionStatus::Disconnected,
            capabilities: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Merge an update into the record.
    ///
    /// The merged result is validated before anything is changed; the
    /// identifier is never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged record would be invalid.
    pub fn apply(&mut self, update: ComputeUpdate) -> Result<(), ValidationError> {
        let mut merged = self.clone();
        if let Some(protocol) = update.protocol {
            merged.protocol = protocol;
        }
        if let Some(host) = update.host {
            merged.host = host;
        }
        if let Some(port) = update.port {
            merged.port = port;
        }
        if let Some(name) = update.name {
            merged.name = name;
        }
        if let Some(user) = update.user {
            merged.user = Some(user);
        }
        if let Some(password) = update.password {
            merged.password = Some(password);
        }
        merged.validate()?;
        merged.updated_at = Utc::now();
        *self = merged;
        Ok(())
    }

    /// Validate the address, name and credential fields.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_host(&self.host)?;
        validate_port(self.port)?;
        validate_name(&self.name)?;
        validate_credentials(self.user.as_deref(), self.password.as_ref())
    }

    /// Endpoint used to open a session to this node.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            credentials: self.user.as_ref().map(|user| Credentials {
                user: user.clone(),
                password: self.password.clone(),
            }),
        }
    }

    /// Operator-facing view of the record, without the password.
    #[must_use]
    pub fn summary(&self) -> ComputeSummary {
        ComputeSummary {
            compute_id: self.compute_id.clone(),
            name: self.name.clone(),
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            connected: self.status.is_connected(),
            status: self.status.clone(),
            capabilities: self.capabilities.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn validate_credentials(
    user: Option<&str>,
    password: Option<&Password>,
) -> Result<(), ValidationError> {
    match (user, password) {
        (Some(user), _) => validate_user(user),
        (None, Some(_)) => Err(ValidationError::new("password", "password requires a user")),
        (None, None) => Ok(()),
    }
}

/// Serializable, password-free view of a compute record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComputeSummary {
    /// Identifier.
    pub compute_id: ComputeId,
    /// Display name.
    pub name: String,
    /// Transport scheme.
    pub protocol: Protocol,
    /// Host.
    pub host: String,
    /// Port.
    pub port: u16,
    /// User, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Shorthand for `status == connected`.
    pub connected: bool,
    /// Connection status.
    pub status: ConnectionStatus,
    /// Last reported capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// HTTP method of a forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForwardMethod {
    /// Read.
    Get,
    /// Create or act.
    Post,
    /// Replace or update.
    Put,
    /// Remove.
    Delete,
}

impl ForwardMethod {
    /// Method name as sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the method carries a request body.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl fmt::Display for ForwardMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardMethod {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ProtoError::UnknownMethod(s.to_string())),
        }
    }
}

/// Parameters of an idle-value search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdlePcRequest {
    /// Router platform, e.g. `c7200`.
    pub platform: String,
    /// Image file name on the compute.
    pub image: String,
    /// Memory in megabytes.
    pub ram: u32,
}

impl IdlePcRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(platform: impl Into<String>, image: impl Into<String>, ram: u32) -> Self {
        Self {
            platform: platform.into(),
            image: image.into(),
            ram,
        }
    }

    /// Validate the request.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is empty or `ram` is zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.platform.trim().is_empty() {
            return Err(ValidationError::new("platform", "platform cannot be empty"));
        }
        if self.image.trim().is_empty() {
            return Err(ValidationError::new("image", "image cannot be empty"));
        }
        if self.ram == 0 {
            return Err(ValidationError::new("ram", "ram must be greater than zero"));
        }
        Ok(())
    }
}
