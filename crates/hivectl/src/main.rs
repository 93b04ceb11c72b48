//! hivectl - Hive operator CLI
//!
//! Builds a controller from the local configuration and runs one operation
//! against the registered compute nodes. Results go to stdout as JSON, logs
//! to stderr.

mod cli;
mod commands;

use std::io;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "hive=debug" } else { "hive=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let mut stdout = io::stdout().lock();
    commands::run(cli, &mut stdout).await
}
