use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use provisioner::{
    config::Config, machine::VmManager, resources::bootstrap::bootstrap_data,
    resources::manifest::MachineManifest,
};
use tokio::task::spawn_blocking;

use crate::ui::message::message_info;

#[derive(Clone, Debug, Args)]
pub struct CreateArgs {
    /// Path to the machine manifest (YAML)
    manifest: PathBuf,
}

pub async fn run_create(config: &Config, machines: VmManager, args: CreateArgs) -> Result<()> {
    let manifest = MachineManifest::load(&args.manifest).await?;
    let Some(bootstrap) = &manifest.bootstrap else {
        bail!(
            "manifest {} has no bootstrap data to boot the machine with",
            args.manifest.display()
        );
    };

    let user_data = bootstrap_data(&manifest.bootstrap_secret_name(), &bootstrap.secret_data())?;
    let spec = manifest.to_spec(&config.defaults).with_user_data(user_data);

    message_info(format!("creating virtual machine '{}'", spec.name));
    let name = spec.name.clone();
    spawn_blocking(move || machines.create(&spec)).await??;

    message_info(format!("virtual machine '{}' created and started", name));
    Ok(())
}
