use anyhow::Result;
use clap::{Args, ValueEnum};
use provisioner::machine::VmManager;
use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::ui::message::{message_info, message_warn};

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Args)]
pub struct StatusArgs {
    /// Output format
    #[arg(long = "output", short = 'o', value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Name of the virtual machine
    name: String,
}

#[derive(Debug, Serialize)]
pub struct MachineReport {
    name: String,
    exists: bool,
    running: bool,
    addresses: Vec<String>,
}

pub async fn run_status(machines: VmManager, args: StatusArgs) -> Result<()> {
    let name = args.name.clone();
    let report = spawn_blocking(move || -> Result<MachineReport> {
        let exists = machines.exists(&name);
        let running = exists && machines.is_ready(&name);
        let addresses = if running {
            machines.ip_addresses(&name)?
        } else {
            Vec::new()
        };

        Ok(MachineReport {
            name,
            exists,
            running,
            addresses,
        })
    })
    .await??;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            if !report.exists {
                message_warn(format!("virtual machine '{}' does not exist", report.name));
                return Ok(());
            }

            message_info(format!(
                "virtual machine '{}' is {}",
                report.name,
                if report.running { "running" } else { "not running" }
            ));
            for address in &report.addresses {
                message_info(format!("address: {}", address));
            }
        }
    }

    Ok(())
}
