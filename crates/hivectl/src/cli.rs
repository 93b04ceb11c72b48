//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hive_proto::{ComputeId, ForwardMethod, Protocol};

/// Hive operator CLI.
#[derive(Parser, Debug, Clone)]
#[command(name = "hivectl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the controller config file (TOML).
    #[arg(short, long, env = "HIVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the compute records, overriding the config file.
    #[arg(long, env = "HIVE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List registered computes.
    List,

    /// Show one compute.
    Get {
        /// Compute ID.
        id: ComputeId,
    },

    /// Register a compute.
    Create(CreateArgs),

    /// Change the address, name or credentials of a compute.
    Update(UpdateArgs),

    /// Disconnect and remove a compute.
    Delete {
        /// Compute ID.
        id: ComputeId,
    },

    /// Connect to a compute and show its capabilities.
    Connect {
        /// Compute ID.
        id: ComputeId,
    },

    /// List the images an emulator has on a compute.
    Images {
        /// Compute ID.
        id: ComputeId,
        /// Emulator type, e.g. `qemu` or `dynamips`.
        emulator: String,
    },

    /// Relay a request to a compute's emulator API.
    Forward {
        /// Compute ID.
        id: ComputeId,
        /// HTTP method: GET, POST, PUT or DELETE.
        method: ForwardMethod,
        /// Emulator type.
        emulator: String,
        /// Path below the emulator.
        path: String,
        /// JSON body for POST and PUT.
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Find the idle-PC value of a Dynamips router image.
    ///
    /// Runs on the compute and may take a few minutes.
    Idlepc {
        /// Compute ID.
        id: ComputeId,
        /// Router platform, e.g. `c7200`.
        #[arg(long)]
        platform: String,
        /// Image file name on the compute.
        #[arg(long)]
        image: String,
        /// Router memory in MB.
        #[arg(long)]
        ram: u32,
    },
}

/// Arguments for `create`.
#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Host name or IP address.
    #[arg(long)]
    pub host: String,

    /// TCP port.
    #[arg(long)]
    pub port: u16,

    /// Transport scheme.
    #[arg(long, default_value = "http")]
    pub protocol: Protocol,

    /// User for basic authentication.
    #[arg(long)]
    pub user: Option<String>,

    /// Password for basic authentication.
    #[arg(long, env = "HIVE_COMPUTE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Display name (defaults to `host:port`).
    #[arg(long)]
    pub name: Option<String>,

    /// Compute ID (generated when omitted).
    #[arg(long)]
    pub id: Option<ComputeId>,

    /// Connect right away; the compute is not kept if that fails.
    #[arg(long)]
    pub connect: bool,
}

/// Arguments for `update`.
#[derive(Args, Debug, Clone)]
pub struct UpdateArgs {
    /// Compute ID.
    pub id: ComputeId,

    /// New host name or IP address.
    #[arg(long)]
    pub host: Option<String>,

    /// New TCP port.
    #[arg(long)]
    pub port: Option<u16>,

    /// New transport scheme.
    #[arg(long)]
    pub protocol: Option<Protocol>,

    /// New user.
    #[arg(long)]
    pub user: Option<String>,

    /// New password.
    #[arg(long, env = "HIVE_COMPUTE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// New display name.
    #[arg(long)]
    pub name: Option<String>,
}
