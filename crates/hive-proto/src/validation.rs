//! Input validation for compute addresses and identifiers.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ProtoError;

/// Maximum length of a compute identifier.
pub const MAX_COMPUTE_ID_LENGTH: usize = 64;

/// Maximum length for hostnames (RFC 1035).
pub const MAX_HOSTNAME_LENGTH: usize = 253;

/// Maximum length of a user-assigned compute name.
pub const MAX_NAME_LENGTH: usize = 255;

/// Regex for caller-supplied compute identifiers.
static COMPUTE_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap_or_else(|_| unreachable!()));

/// Regex for valid hostnames (RFC 1123).
static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*$")
        .unwrap_or_else(|_| unreachable!())
});

/// Validation error with detailed information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field that failed validation.
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    /// Create a new validation error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for ProtoError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}

/// Validate a compute host.
///
/// Accepts IPv4/IPv6 literals and RFC 1123 hostnames.
///
/// # Errors
///
/// Returns an error if the host is empty or malformed.
pub fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.is_empty() {
        return Err(ValidationError::new("host", "host cannot be empty"));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    if host.len() > MAX_HOSTNAME_LENGTH {
        return Err(ValidationError::new(
            "host",
            format!("host exceeds {MAX_HOSTNAME_LENGTH} characters"),
        ));
    }

    if !HOSTNAME_REGEX.is_match(host) {
        return Err(ValidationError::new(
            "host",
            format!("'{host}' is not a valid IP address or hostname"),
        ));
    }

    Ok(())
}

/// Validate a compute port.
///
/// # Errors
///
/// Returns an error if the port is zero.
pub fn validate_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::new("port", "port must be between 1 and 65535"));
    }
    Ok(())
}

/// Validate a caller-supplied compute identifier.
///
/// # Errors
///
/// Returns an error if the identifier is empty, too long or contains
/// characters outside `[A-Za-z0-9_.-]`.
pub fn validate_compute_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::new("compute_id", "compute ID cannot be empty"));
    }

    if id.len() > MAX_COMPUTE_ID_LENGTH {
        return Err(ValidationError::new(
            "compute_id",
            format!("compute ID exceeds {MAX_COMPUTE_ID_LENGTH} characters"),
        ));
    }

    if !COMPUTE_ID_REGEX.is_match(id) {
        return Err(ValidationError::new(
            "compute_id",
            format!("'{id}' contains invalid characters"),
        ));
    }

    Ok(())
}

/// Validate a user-assigned compute name.
///
/// # Errors
///
/// Returns an error if the name is blank or too long.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::new("name", "name cannot be blank"));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::new(
            "name",
            format!("name exceeds {MAX_NAME_LENGTH} characters"),
        ));
    }

    Ok(())
}

/// Validate a credential user name.
///
/// # Errors
///
/// Returns an error if the user is empty or contains a colon, which basic
/// authentication cannot represent.
pub fn validate_user(user: &str) -> Result<(), ValidationError> {
    if user.is_empty() {
        return Err(ValidationError::new("user", "user cannot be empty"));
    }
    if user.contains(':') {
        return Err(ValidationError::new("user", "user cannot contain ':'"));
    }
    Ok(())
}
