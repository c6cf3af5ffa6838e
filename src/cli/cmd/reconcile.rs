use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Args;
use provisioner::{
    config::Config,
    controller::{
        ReconcileNext,
        context::{ControllerContext, ControllerKey},
        machine::MachineController,
        run_pass,
    },
    machine::VmManager,
    repository::{MachineRepository, MemoryRepository, MemorySecrets},
    resources::{
        machine::{MachineRecord, MachineStatus, Prerequisites},
        manifest::MachineManifest,
    },
};

use crate::ui::message::{message_info, message_warn};

#[derive(Clone, Debug, Args)]
pub struct ReconcileArgs {
    /// Keep reconciling, waiting out each requeue interval, until interrupted
    #[arg(long = "watch", short = 'w')]
    watch: bool,

    /// Reconcile the machine as if its deletion had been requested
    #[arg(long = "delete")]
    delete: bool,

    /// Path to the machine manifest (YAML)
    manifest: PathBuf,
}

fn report(name: &str, status: &MachineStatus) {
    let addresses: Vec<&str> = status.addresses.iter().map(|a| a.address.as_str()).collect();
    message_info(format!(
        "{}: phase={} ready={} provisioned={} addresses=[{}]",
        name,
        status.phase,
        status.ready,
        status.provisioned,
        addresses.join(", ")
    ));

    if let Some(message) = &status.failure_message {
        message_warn(message);
    }
}

pub async fn run_reconcile(
    config: &Config,
    machines: VmManager,
    args: ReconcileArgs,
) -> Result<()> {
    let manifest = MachineManifest::load(&args.manifest).await?;

    let repository = MemoryRepository::new();
    let secrets = MemorySecrets::new();

    let mut record = MachineRecord::new(manifest.to_spec(&config.defaults));
    record.prerequisites = Prerequisites::satisfied();
    record.deletion_requested = args.delete;
    if let Some(bootstrap) = &manifest.bootstrap {
        let secret_name = manifest.bootstrap_secret_name();
        secrets.insert(&secret_name, bootstrap.secret_data());
        record.bootstrap_secret = Some(secret_name);
    }
    repository.insert(record);

    let ctx = ControllerContext::new(
        Arc::new(repository.clone()),
        Arc::new(secrets),
        machines,
    );
    let controller = MachineController::new(config.requeue.clone());
    let key = ControllerKey::new(&manifest.name);

    loop {
        let next = run_pass(&controller, ctx.clone(), key.clone()).await;

        match repository.get(&key.name).await? {
            Some(record) => report(&key.name, &record.status),
            None => message_info(format!("{}: record released", key.name)),
        }

        let ReconcileNext::After(delay) = next else {
            return Ok(());
        };

        if !args.watch {
            message_info(format!(
                "next pass due in {}",
                humantime::format_duration(delay)
            ));
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                message_warn("interrupted");
                return Ok(());
            }
        }
    }
}
