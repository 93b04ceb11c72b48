//! # hive-proto
//!
//! Data model shared by the Hive controller core and its operator tooling.
//!
//! - [`ComputeRecord`] - identity, address, credentials and connection status of one node
//! - [`ComputeSpec`] / [`ComputeUpdate`] - caller input for creating and patching records
//! - [`ConnectionStatus`] - the per-node connection state machine
//! - [`validation`] - address and identifier checks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod types;
pub mod validation;

pub use error::ProtoError;
pub use types::{
    Capabilities, ComputeId, ComputeRecord, ComputeSpec, ComputeSummary, ComputeUpdate,
    ConnectionStatus, Credentials, Endpoint, ForwardMethod, IdlePcRequest, Password, Protocol,
    parse_major_minor,
};
pub use validation::ValidationError;
