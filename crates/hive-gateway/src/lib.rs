//! # hive-gateway
//!
//! Controller core for a fleet of compute nodes.
//!
//! - [`ComputeRegistry`] - the registered computes, written through to a [`ComputeRepository`]
//! - [`ConnectionManager`] - per-compute sessions and the connection state machine
//! - [`ForwardingGateway`] - relays emulator requests to a compute's API
//! - [`JobRunner`] - long-running searches delegated to one compute
//! - [`Controller`] - the explicitly constructed context owning all of the above

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod forward;
pub mod jobs;
pub mod registry;
pub mod repository;
pub mod supervisor;
pub mod transport;

pub use config::{ConfigError, ControllerConfig, SupervisorConfig};
pub use connection::{ConnectionManager, ConnectionSettings};
pub use controller::Controller;
pub use error::{ComputeError, ErrorKind, Result};
pub use forward::ForwardingGateway;
pub use jobs::{IdlePcJob, JobRunner};
pub use registry::ComputeRegistry;
pub use repository::{ComputeRepository, JsonRepository, MemoryRepository, StorageError};
pub use supervisor::{ReconnectConfig, SupervisorHandle, start_supervisor};
pub use transport::{
    COMPUTE_API_PREFIX, Connector, HttpConnector, NodeRequest, NodeResponse, NodeSession,
    TransportError,
};
