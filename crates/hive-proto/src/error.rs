//! Error types for the hive-proto crate.

use thiserror::Error;

/// Errors that can occur while parsing or validating protocol types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// Unknown transport scheme.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Unknown forwarding method.
    #[error("unsupported method: {0}")]
    UnknownMethod(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}
