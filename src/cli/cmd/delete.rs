use anyhow::Result;
use clap::Args;
use provisioner::{config::Config, machine::VmManager};
use tokio::task::spawn_blocking;

use crate::ui::message::message_info;

#[derive(Clone, Debug, Args)]
pub struct DeleteArgs {
    /// Storage pool holding the machine's volumes [default: from config]
    #[arg(long = "storage-pool", short = 'p')]
    storage_pool: Option<String>,

    /// Name of the virtual machine
    name: String,
}

pub async fn run_delete(config: &Config, machines: VmManager, args: DeleteArgs) -> Result<()> {
    let pool = args
        .storage_pool
        .unwrap_or_else(|| config.defaults.storage_pool.clone());

    let name = args.name.clone();
    spawn_blocking(move || machines.destroy(&name, &pool)).await??;

    message_info(format!("virtual machine '{}' deleted", args.name));
    Ok(())
}
