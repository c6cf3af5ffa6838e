use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::task::spawn_blocking;
use tracing::{error, info};

use crate::{
    config::RequeueConfig,
    controller::{
        Controller, ReconcileNext,
        context::{ControllerContext, ControllerKey},
    },
    machine::VmManager,
    resources::{
        bootstrap::bootstrap_data,
        machine::{MachineAddress, MachinePhase, MachineRecord, MachineStatus, provider_id},
    },
};

/// Drives one machine record towards a running, addressed VM.
///
/// Each pass looks at the record and the hypervisor and takes at most one
/// mutating step. Drift is corrected over two passes: destroy now, recreate on
/// the next one. Passes for the same machine must not overlap.
pub struct MachineController {
    requeue: RequeueConfig,
}

impl MachineController {
    pub fn new(requeue: RequeueConfig) -> Self {
        Self { requeue }
    }

    pub fn new_boxed(requeue: RequeueConfig) -> Box<Self> {
        Box::new(Self::new(requeue))
    }
}

async fn blocking<T, F>(machines: &VmManager, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(VmManager) -> T + Send + 'static,
{
    let machines = machines.clone();
    Ok(spawn_blocking(move || f(machines)).await?)
}

/// Status patch for a pass that went through; drops any earlier failure.
async fn publish<F>(ctx: &ControllerContext, name: &str, f: F) -> Result<MachineStatus>
where
    F: FnOnce(&mut MachineStatus) + Send + 'static,
{
    ctx.patch_status(name, move |status| {
        f(status);
        status.failure_message = None;
    })
    .await
}

impl MachineController {
    async fn reconcile_delete(
        &self,
        ctx: &ControllerContext,
        record: &MachineRecord,
    ) -> Result<ReconcileNext> {
        let name = record.name().to_string();
        publish(ctx, &name, |status| status.phase = MachinePhase::Deleting).await?;

        let exists = {
            let name = name.clone();
            blocking(&ctx.machines, move |machines| machines.exists(&name)).await?
        };

        if exists {
            info!("deleting virtual machine '{}'", name);
            let (vm_name, pool) = (name.clone(), record.spec.storage_pool.clone());
            blocking(&ctx.machines, move |machines| machines.destroy(&vm_name, &pool))
                .await?
                .with_context(|| format!("failed to destroy virtual machine '{}'", name))?;
        }

        publish(ctx, &name, |status| {
            status.clear_observations();
            status.phase = MachinePhase::Deleted;
        })
        .await?;

        ctx.repository
            .remove_finalizer(&name)
            .await
            .with_context(|| format!("failed to remove finalizer from machine '{}'", name))?;

        info!("machine {} deleted", name);
        Ok(ReconcileNext::done())
    }

    /// `None` while the bootstrap provider has not produced the data yet.
    async fn bootstrap_data(
        &self,
        ctx: &ControllerContext,
        record: &MachineRecord,
    ) -> Result<Option<String>> {
        let Some(secret_name) = &record.bootstrap_secret else {
            return Ok(None);
        };

        let Some(secret) = ctx.secrets.secret(secret_name).await? else {
            bail!(
                "failed to retrieve bootstrap data secret '{}' for machine '{}'",
                secret_name,
                record.name()
            );
        };

        let data = bootstrap_data(secret_name, &secret)?;
        if data.is_empty() {
            return Ok(None);
        }

        Ok(Some(data))
    }

    async fn reconcile_create(
        &self,
        ctx: &ControllerContext,
        record: &MachineRecord,
    ) -> Result<ReconcileNext> {
        let name = record.name().to_string();

        let Some(user_data) = self.bootstrap_data(ctx, record).await? else {
            info!(
                "waiting for the bootstrap provider to set bootstrap data for machine {}",
                name
            );
            publish(ctx, &name, |status| {
                status.phase = MachinePhase::AwaitingBootstrap
            })
            .await?;
            return Ok(ReconcileNext::after(self.requeue.poll));
        };

        info!("creating virtual machine '{}'", name);
        let spec = record.spec.clone().with_user_data(user_data);
        blocking(&ctx.machines, move |machines| machines.create(&spec))
            .await?
            .with_context(|| format!("failed to create virtual machine '{}'", name))?;

        publish(ctx, &name, |status| status.phase = MachinePhase::Creating).await?;
        Ok(ReconcileNext::after(self.requeue.poll))
    }

    async fn reconcile_running(
        &self,
        ctx: &ControllerContext,
        record: &MachineRecord,
    ) -> Result<ReconcileNext> {
        let name = record.name().to_string();
        let provider_id = provider_id(&name);

        let ready = {
            let name = name.clone();
            blocking(&ctx.machines, move |machines| machines.is_ready(&name)).await?
        };

        if !ready {
            info!("waiting for virtual machine '{}' to become ready", name);
            publish(ctx, &name, move |status| {
                status.provider_id = Some(provider_id);
                status.ready = false;
                status.phase = MachinePhase::Verifying;
            })
            .await?;
            return Ok(ReconcileNext::after(self.requeue.poll));
        }

        let addresses = {
            let name = name.clone();
            blocking(&ctx.machines, move |machines| machines.ip_addresses(&name)).await?
        }
        .with_context(|| format!("failed to get IP addresses for virtual machine '{}'", name))?;

        if addresses.is_empty() {
            info!("waiting for virtual machine '{}' to get an IP address", name);
            publish(ctx, &name, move |status| {
                status.provider_id = Some(provider_id);
                status.phase = MachinePhase::Verifying;
            })
            .await?;
            return Ok(ReconcileNext::after(self.requeue.poll));
        }

        let addresses: Vec<MachineAddress> =
            addresses.iter().map(MachineAddress::external).collect();
        if record.status.addresses != addresses {
            info!(
                "got IP addresses for virtual machine '{}': {:?}",
                name,
                addresses.iter().map(|a| &a.address).collect::<Vec<_>>()
            );
        }
        if !record.status.ready {
            info!("virtual machine '{}' is ready", name);
        }

        publish(ctx, &name, move |status| {
            status.provider_id = Some(provider_id);
            status.addresses = addresses;
            status.ready = true;
            status.provisioned = true;
            status.phase = MachinePhase::Ready;
        })
        .await?;

        Ok(ReconcileNext::after(self.requeue.periodic))
    }
}

#[async_trait]
impl Controller for MachineController {
    async fn reconcile(&self, ctx: ControllerContext, key: ControllerKey) -> Result<ReconcileNext> {
        info!("reconciling machine controller for key: {}", key);

        let Some(record) = ctx.repository.get(&key.name).await? else {
            info!("machine {} no longer exists", key.name);
            return Ok(ReconcileNext::done());
        };

        if record.status.phase == MachinePhase::Deleted {
            return Ok(ReconcileNext::done());
        }

        let name = record.name().to_string();

        if record.paused {
            info!("machine {} is marked as paused, won't reconcile", name);
            publish(&ctx, &name, |status| status.phase = MachinePhase::Paused).await?;
            return Ok(ReconcileNext::after(self.requeue.paused));
        }

        if record.deletion_requested {
            return self.reconcile_delete(&ctx, &record).await;
        }

        if !record.prerequisites.is_satisfied() {
            info!(
                "machine {} is waiting for its owner and cluster to be linked",
                name
            );
            publish(&ctx, &name, |status| {
                status.phase = MachinePhase::AwaitingDependencies
            })
            .await?;
            return Ok(ReconcileNext::done());
        }

        let (exists, reconciled) = {
            let spec = record.spec.clone();
            blocking(&ctx.machines, move |machines| {
                let exists = machines.exists(&spec.name);
                (exists, exists && machines.is_reconciled(&spec))
            })
            .await?
        };

        if exists && !reconciled {
            info!("destroying out-of-sync virtual machine '{}'", name);
            let (vm_name, pool) = (name.clone(), record.spec.storage_pool.clone());
            blocking(&ctx.machines, move |machines| machines.destroy(&vm_name, &pool))
                .await?
                .with_context(|| {
                    format!("failed to destroy out-of-sync virtual machine '{}'", name)
                })?;

            publish(&ctx, &name, |status| {
                status.clear_observations();
                status.phase = MachinePhase::Drifted;
            })
            .await?;
            return Ok(ReconcileNext::after(self.requeue.drift));
        }

        if !exists {
            return self.reconcile_create(&ctx, &record).await;
        }

        self.reconcile_running(&ctx, &record).await
    }

    async fn handle_error(
        &self,
        ctx: ControllerContext,
        key: ControllerKey,
        err: anyhow::Error,
    ) -> ReconcileNext {
        error!(
            "handling error for machine controller for key: {} error: {:#}",
            key, err
        );

        let message = format!("{:#}", err);
        ctx.patch_status(&key.name, move |status| {
            status.failure_message = Some(message);
        })
        .await
        .ok();

        ReconcileNext::after(self.requeue.error)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc, time::Duration};

    use super::*;
    use crate::{
        hypervisor::{DomainInterface, DomainState, mock::MockHypervisor},
        repository::{MachineRepository, MemoryRepository, MemorySecrets},
        resources::machine::{MachineSpec, Prerequisites},
    };

    struct Fixture {
        controller: MachineController,
        ctx: ControllerContext,
        repository: MemoryRepository,
        secrets: MemorySecrets,
        hypervisor: MockHypervisor,
    }

    impl Fixture {
        fn new() -> Self {
            let repository = MemoryRepository::new();
            let secrets = MemorySecrets::new();
            let hypervisor = MockHypervisor::new();
            hypervisor.lease_on_boot(vec![DomainInterface {
                name: "vnet0".to_string(),
                hwaddr: None,
                addresses: vec!["192.168.122.10".to_string()],
            }]);

            let ctx = ControllerContext::new(
                Arc::new(repository.clone()),
                Arc::new(secrets.clone()),
                VmManager::new(Arc::new(hypervisor.clone())),
            );

            Self {
                controller: MachineController::new(RequeueConfig::default()),
                ctx,
                repository,
                secrets,
                hypervisor,
            }
        }

        fn machine(&self, name: &str) {
            let spec = MachineSpec::new(name).with_backing_image("/images/base.qcow2", "qcow2");
            let mut record = MachineRecord::new(spec);
            record.prerequisites = Prerequisites::satisfied();
            record.bootstrap_secret = Some(format!("{}-bootstrap", name));
            self.repository.insert(record);
        }

        fn bootstrap(&self, name: &str, entries: &[(&str, &str)]) {
            let data: BTreeMap<String, String> = entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.secrets.insert(format!("{}-bootstrap", name), data);
        }

        async fn reconcile(&self, name: &str) -> Result<ReconcileNext> {
            self.controller
                .reconcile(self.ctx.clone(), ControllerKey::new(name))
                .await
        }

        async fn status(&self, name: &str) -> MachineStatus {
            self.repository.get(name).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn test_missing_record_is_done() {
        let fixture = Fixture::new();
        let next = fixture.reconcile("ghost").await.unwrap();
        assert_eq!(next, ReconcileNext::Done);
        assert_eq!(fixture.hypervisor.connections(), 0);
    }

    #[tokio::test]
    async fn test_paused_machine_is_left_alone() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture.repository.update("test1", |record| record.paused = true);

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(30)));
        assert_eq!(fixture.status("test1").await.phase, MachinePhase::Paused);
        assert_eq!(fixture.hypervisor.connections(), 0);
    }

    #[tokio::test]
    async fn test_unlinked_machine_waits_for_dependencies() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture
            .repository
            .update("test1", |record| record.prerequisites.cluster_provisioned = false);

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::Done);
        assert_eq!(
            fixture.status("test1").await.phase,
            MachinePhase::AwaitingDependencies
        );
        assert_eq!(fixture.hypervisor.connections(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_bootstrap_data() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture.repository.update("test1", |record| record.bootstrap_secret = None);

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(10)));
        assert_eq!(
            fixture.status("test1").await.phase,
            MachinePhase::AwaitingBootstrap
        );
        assert!(fixture.hypervisor.domain("test1").is_none());
    }

    #[tokio::test]
    async fn test_unreadable_secret_is_an_error() {
        let fixture = Fixture::new();
        fixture.machine("test1");

        let err = fixture.reconcile("test1").await.unwrap_err();
        assert!(format!("{:#}", err).contains("test1-bootstrap"));
    }

    #[tokio::test]
    async fn test_unsupported_bootstrap_format() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture.bootstrap("test1", &[("value", "{}"), ("format", "ignition")]);

        let err = fixture.reconcile("test1").await.unwrap_err();
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<crate::error::Error>(),
            Some(crate::error::Error::UnsupportedFormat(_))
        )));
        assert!(fixture.hypervisor.domain("test1").is_none());
    }

    #[tokio::test]
    async fn test_create_then_verify() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture.bootstrap("test1", &[("value", "#cloud-config\n")]);
        fixture.hypervisor.boot_into(DomainState::Blocked);

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(10)));
        assert_eq!(fixture.status("test1").await.phase, MachinePhase::Creating);
        assert!(fixture.hypervisor.domain("test1").is_some());

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(10)));
        let status = fixture.status("test1").await;
        assert_eq!(status.phase, MachinePhase::Verifying);
        assert_eq!(status.provider_id.as_deref(), Some("libvirt:///test1"));
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_ready_publishes_addresses() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture.bootstrap("test1", &[("value", "#cloud-config\n")]);

        fixture.reconcile("test1").await.unwrap();
        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(300)));

        let status = fixture.status("test1").await;
        assert_eq!(status.phase, MachinePhase::Ready);
        assert!(status.ready);
        assert!(status.provisioned);
        assert_eq!(status.addresses, vec![MachineAddress::external("192.168.122.10")]);
    }

    #[tokio::test]
    async fn test_waits_for_lease() {
        let fixture = Fixture::new();
        fixture.hypervisor.lease_on_boot(Vec::new());
        fixture.machine("test1");
        fixture.bootstrap("test1", &[("value", "#cloud-config\n")]);

        fixture.reconcile("test1").await.unwrap();
        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(10)));

        let status = fixture.status("test1").await;
        assert_eq!(status.phase, MachinePhase::Verifying);
        assert!(status.addresses.is_empty());
    }

    #[tokio::test]
    async fn test_drift_is_corrected_over_two_passes() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture.bootstrap("test1", &[("value", "#cloud-config\n")]);

        fixture.reconcile("test1").await.unwrap();
        fixture.reconcile("test1").await.unwrap();
        assert_eq!(fixture.status("test1").await.phase, MachinePhase::Ready);

        fixture
            .repository
            .update("test1", |record| record.spec.cpu = 2);

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(30)));
        let status = fixture.status("test1").await;
        assert_eq!(status.phase, MachinePhase::Drifted);
        assert!(!status.ready);
        assert!(status.addresses.is_empty());
        assert!(status.provider_id.is_none());
        assert!(fixture.hypervisor.domain("test1").is_none());
        assert_eq!(fixture.hypervisor.call_count("define_domain"), 1);

        fixture.reconcile("test1").await.unwrap();
        assert_eq!(fixture.hypervisor.domain("test1").unwrap().vcpus, 2);
    }

    #[tokio::test]
    async fn test_deletion() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture.bootstrap("test1", &[("value", "#cloud-config\n")]);
        fixture.reconcile("test1").await.unwrap();

        fixture
            .repository
            .update("test1", |record| record.deletion_requested = true);

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::Done);
        assert!(fixture.hypervisor.domain("test1").is_none());
        assert!(fixture.hypervisor.volume_names("default").is_empty());
        assert!(fixture.repository.get("test1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletion_of_never_created_machine() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture
            .repository
            .update("test1", |record| record.deletion_requested = true);

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::Done);
        assert_eq!(fixture.hypervisor.call_count("destroy_domain"), 0);
        assert!(fixture.repository.get("test1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_phase_is_terminal() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture
            .repository
            .update("test1", |record| record.status.phase = MachinePhase::Deleted);

        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::Done);
        assert_eq!(fixture.hypervisor.connections(), 0);
    }

    #[tokio::test]
    async fn test_handle_error_records_failure() {
        let fixture = Fixture::new();
        fixture.machine("test1");
        fixture.bootstrap("test1", &[("value", "#cloud-config\n")]);
        fixture.hypervisor.fail_call("start_domain");

        let err = fixture.reconcile("test1").await.unwrap_err();
        let next = fixture
            .controller
            .handle_error(fixture.ctx.clone(), ControllerKey::new("test1"), err)
            .await;
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(30)));

        let message = fixture.status("test1").await.failure_message.unwrap();
        assert!(message.contains("failed to create virtual machine 'test1'"));

        // the domain stays defined but shut off; nothing starts it again
        let domain = fixture.hypervisor.domain("test1").unwrap();
        assert_eq!(domain.state, DomainState::Shutoff);
        let starts = fixture.hypervisor.call_count("start_domain");

        fixture.hypervisor.clear_failures();
        let next = fixture.reconcile("test1").await.unwrap();
        assert_eq!(next, ReconcileNext::After(Duration::from_secs(10)));
        let status = fixture.status("test1").await;
        assert!(status.failure_message.is_none());
        assert_eq!(status.phase, MachinePhase::Verifying);

        fixture.reconcile("test1").await.unwrap();
        assert_eq!(fixture.status("test1").await.phase, MachinePhase::Verifying);
        assert_eq!(fixture.hypervisor.call_count("start_domain"), starts);
        assert_eq!(fixture.hypervisor.call_count("define_domain"), 1);
    }
}
