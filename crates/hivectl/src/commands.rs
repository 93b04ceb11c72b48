//! Subcommand execution against a locally constructed controller.

use std::io::Write;

use anyhow::{Context, bail};
use hive_gateway::{Controller, ControllerConfig};
use hive_proto::{ComputeSpec, ComputeSummary, ComputeUpdate, IdlePcRequest, Password};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::cli::{Cli, Commands, CreateArgs, UpdateArgs};

/// Build the controller configuration from the config file and flags.
pub fn load_config(cli: &Cli) -> anyhow::Result<ControllerConfig> {
    let mut config = match &cli.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config = config.with_state_dir(dir);
    }
    if config.state_dir.is_none() {
        warn!("no state directory configured, changes will not be saved");
    }
    Ok(config)
}

/// Run one subcommand, writing its result to `out` as pretty JSON.
pub async fn run<W: Write>(cli: Cli, out: &mut W) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let controller = Controller::from_config(config)?;
    let loaded = controller.start()?;
    info!(computes = loaded, "controller ready");

    let result = execute(&controller, cli.command, out).await;
    controller.shutdown().await;
    result
}

async fn execute<W: Write>(
    controller: &Controller,
    command: Commands,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::List => {
            let computes: Vec<ComputeSummary> = controller
                .list_computes()
                .iter()
                .map(hive_proto::ComputeRecord::summary)
                .collect();
            write_json(out, &computes)
        }
        Commands::Get { id } => write_json(out, &controller.get_compute(&id)?.summary()),
        Commands::Create(args) => {
            let connect = args.connect;
            let record = controller.create_compute(create_spec(args), connect).await?;
            write_json(out, &record.summary())
        }
        Commands::Update(args) => {
            let id = args.id.clone();
            let update = compute_update(args);
            if update.is_empty() {
                bail!("nothing to update, pass at least one field");
            }
            write_json(out, &controller.update_compute(&id, update).await?.summary())
        }
        Commands::Delete { id } => write_json(out, &controller.delete_compute(&id).await?.summary()),
        Commands::Connect { id } => write_json(out, &controller.connect(&id).await?.summary()),
        Commands::Images { id, emulator } => {
            write_json(out, &controller.images(&id, &emulator).await?)
        }
        Commands::Forward {
            id,
            method,
            emulator,
            path,
            data,
        } => {
            let body = data
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--data is not valid JSON")?;
            let payload = controller.forward(&id, method, &emulator, &path, body).await?;
            write_json(out, &payload)
        }
        Commands::Idlepc {
            id,
            platform,
            image,
            ram,
        } => {
            let value = controller
                .auto_idlepc(&id, IdlePcRequest::new(platform, image, ram))
                .await?;
            write_json(out, &json!({ "idlepc": value }))
        }
    }
}

fn create_spec(args: CreateArgs) -> ComputeSpec {
    let mut spec = ComputeSpec::new(args.host, args.port).with_protocol(args.protocol);
    if let Some(id) = args.id {
        spec = spec.with_id(id);
    }
    if let Some(name) = args.name {
        spec = spec.with_name(name);
    }
    spec.user = args.user;
    spec.password = args.password.map(Password::new);
    spec
}

fn compute_update(args: UpdateArgs) -> ComputeUpdate {
    ComputeUpdate {
        protocol: args.protocol,
        host: args.host,
        port: args.port,
        name: args.name,
        user: args.user,
        password: args.password.map(Password::new),
    }
}

fn write_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value).context("serializing output")?;
    writeln!(out)?;
    Ok(())
}
