//! Error kinds returned by the controller core.

use hive_persist::PersistError;
use hive_proto::{ComputeId, ProtoError, ValidationError};
use thiserror::Error;

/// Errors returned by registry, connection, forwarding and job operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    /// The compute spec or request is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No compute with this identifier is registered.
    #[error("compute {0} not found")]
    NotFound(ComputeId),

    /// The operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The compute rejected our credentials.
    #[error("authentication failed for compute {compute_id}: {message}")]
    Authentication {
        /// Compute involved.
        compute_id: ComputeId,
        /// Message returned by the compute.
        message: String,
    },

    /// The compute could not be reached or the session dropped.
    #[error("compute {compute_id} is unreachable: {reason}")]
    Unreachable {
        /// Compute involved.
        compute_id: ComputeId,
        /// Transport-level reason.
        reason: String,
    },

    /// The compute answered with an application-level failure.
    #[error("compute {compute_id} returned {status}: {message}")]
    Remote {
        /// Compute involved.
        compute_id: ComputeId,
        /// Status code reported by the compute.
        status: u16,
        /// The compute's own message.
        message: String,
    },

    /// Persistence failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Fieldless discriminant of [`ComputeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ComputeError::Validation`].
    Validation,
    /// See [`ComputeError::NotFound`].
    NotFound,
    /// See [`ComputeError::Conflict`].
    Conflict,
    /// See [`ComputeError::Authentication`].
    Authentication,
    /// See [`ComputeError::Unreachable`].
    Unreachable,
    /// See [`ComputeError::Remote`].
    Remote,
    /// See [`ComputeError::Storage`].
    Storage,
}

impl ComputeError {
    /// The kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Unreachable { .. } => ErrorKind::Unreachable,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Shorthand for an unreachable error.
    pub(crate) fn unreachable(compute_id: &ComputeId, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            compute_id: compute_id.clone(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a remote error.
    pub(crate) fn remote(compute_id: &ComputeId, status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            compute_id: compute_id.clone(),
            status,
            message: message.into(),
        }
    }
}

impl From<ValidationError> for ComputeError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<ProtoError> for ComputeError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Validation(msg) => Self::Validation(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<PersistError> for ComputeError {
    fn from(err: PersistError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ComputeError>;
