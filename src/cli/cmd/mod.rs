pub mod create;
pub mod delete;
pub mod reconcile;
pub mod status;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{Parser, Subcommand};
use provisioner::{config::Config, hypervisor::libvirt::LibvirtConnector, machine::VmManager};

#[derive(Parser)]
#[command(name = "provisioner")]
#[command(about = "Provision virtual machines on a libvirt host", long_about = None)]
pub struct Cli {
    /// Path to the config file (defaults to $PROVISIONER_CONFIG, ./provisioner.toml, ...)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a virtual machine from a manifest
    Create(create::CreateArgs),

    /// Destroy a virtual machine and its volumes
    Delete(delete::DeleteArgs),

    /// Show whether a virtual machine is running and its IP addresses
    Status(status::StatusArgs),

    /// Run reconcile passes for a manifest against an in-memory store
    Reconcile(reconcile::ReconcileArgs),
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config).await?;
    let machines = VmManager::new(Arc::new(LibvirtConnector));

    match cli.command {
        Command::Create(args) => create::run_create(&config, machines, args).await,
        Command::Delete(args) => delete::run_delete(&config, machines, args).await,
        Command::Status(args) => status::run_status(machines, args).await,
        Command::Reconcile(args) => reconcile::run_reconcile(&config, machines, args).await,
    }
}
