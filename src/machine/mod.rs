pub mod descriptor;

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    cloudinit,
    constants::MAX_MACHINE_NAME_LEN,
    error::{Error, Result},
    hypervisor::{Connection, Connector, DomainState},
    machine::descriptor::{DomainDescriptor, VolumeDescriptor},
    resources::machine::{MachineNames, MachineSpec},
};

/// Creates, inspects and tears down single virtual machines.
///
/// Every operation opens its own hypervisor connection and closes it before
/// returning; nothing is held between calls. All calls block.
///
/// Nothing here serializes operations on the same machine name: callers must
/// not run two operations for one machine concurrently.
#[derive(Clone)]
pub struct VmManager {
    connector: Arc<dyn Connector>,
}

impl VmManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&dyn Connection) -> Result<T>) -> Result<T> {
        let conn = self.connector.connect()?;
        let result = f(conn.as_ref());

        if let Err(e) = conn.disconnect() {
            warn!("failed closing connection to libvirt: {}", e);
        }

        result
    }

    fn log_probe_failure(name: &str, probe: &str, err: &Error) {
        match err {
            Error::Hypervisor { .. } => debug!("{} probe for {} failed: {}", probe, name, err),
            _ => error!("{} probe for {} failed: {}", probe, name, err),
        }
    }

    /// Whether a domain with this name is defined. Lookup failures count as "no".
    pub fn exists(&self, name: &str) -> bool {
        let result = self.with_connection(|conn| {
            conn.domain_state(name)
                .map_err(|e| Error::hypervisor(format!("failed to look up domain '{}'", name), e))
        });

        match result {
            Ok(_) => true,
            Err(e) => {
                Self::log_probe_failure(name, "exists", &e);
                false
            }
        }
    }

    /// Whether the live domain still has the vCPU count and memory the spec asks for.
    pub fn is_reconciled(&self, spec: &MachineSpec) -> bool {
        let name = spec.name.as_str();
        let result = self.with_connection(|conn| {
            conn.domain_info(name)
                .map_err(|e| Error::hypervisor(format!("failed to get domain info for '{}'", name), e))
        });

        let info = match result {
            Ok(info) => info,
            Err(e) => {
                Self::log_probe_failure(name, "reconciled", &e);
                return false;
            }
        };

        if info.vcpus != spec.cpu {
            debug!(
                "VM {} is not reconciled; CPU mismatch (expected {}, actual {})",
                name, spec.cpu, info.vcpus
            );
            return false;
        }

        let memory_mib = info.max_memory_kib / 1024;
        if memory_mib != spec.memory {
            debug!(
                "VM {} is not reconciled; memory mismatch (expected {} MiB, actual {} MiB)",
                name, spec.memory, memory_mib
            );
            return false;
        }

        true
    }

    pub fn is_ready(&self, name: &str) -> bool {
        let result = self.with_connection(|conn| {
            conn.domain_state(name)
                .map_err(|e| Error::hypervisor(format!("failed to get domain state for '{}'", name), e))
        });

        match result {
            Ok(state) => {
                debug!("domain {} state: {}", name, state);
                state == DomainState::Running
            }
            Err(e) => {
                Self::log_probe_failure(name, "ready", &e);
                false
            }
        }
    }

    /// DHCP-leased addresses of a running domain, in the order libvirt reports them.
    ///
    /// Empty until the guest has obtained a lease.
    pub fn ip_addresses(&self, name: &str) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let state = conn
                .domain_state(name)
                .map_err(|e| Error::hypervisor(format!("failed to get domain state for '{}'", name), e))?;

            if state != DomainState::Running {
                return Err(Error::NotRunning(name.to_string()));
            }

            let interfaces = match conn.domain_lease_addresses(name) {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    debug!("no lease information for {}: {}", name, e);
                    return Ok(Vec::new());
                }
            };

            Ok(interfaces
                .into_iter()
                .filter(|iface| !iface.name.is_empty())
                .flat_map(|iface| iface.addresses)
                .collect())
        })
    }

    /// Provisions the cloud-init volume, the disk overlay and the domain, then boots it.
    ///
    /// Steps are not rolled back on failure. Leftover volumes from an earlier
    /// failed attempt are removed before they are recreated.
    pub fn create(&self, spec: &MachineSpec) -> Result<()> {
        let length = spec.name.chars().count();
        if length > MAX_MACHINE_NAME_LEN {
            return Err(Error::InvalidName {
                name: spec.name.clone(),
                length,
                max: MAX_MACHINE_NAME_LEN,
            });
        }

        debug!("creating VM {}", spec.name);

        let image = cloudinit::build_image(&spec.name, &spec.user_data)?;
        let names = spec.names();

        self.with_connection(|conn| {
            Self::provision(conn, spec, &names, &image).map_err(|e| Error::Create {
                name: spec.name.clone(),
                source: Box::new(e),
            })
        })?;

        info!("VM {} defined and started", spec.name);
        Ok(())
    }

    fn provision(
        conn: &dyn Connection,
        spec: &MachineSpec,
        names: &MachineNames,
        image: &[u8],
    ) -> Result<()> {
        let pool = spec.storage_pool.as_str();
        conn.lookup_pool(pool)
            .map_err(|e| Error::hypervisor(format!("failed to get storage pool '{}'", pool), e))?;

        let cloud_init_path = Self::create_cloud_init_volume(conn, pool, names, image)?;
        let disk_path = Self::create_disk_volume(conn, pool, names, spec)?;

        let domain = DomainDescriptor {
            name: names.domain.clone(),
            memory_mib: spec.memory,
            vcpus: spec.cpu,
            disk_path,
            cloud_init_path,
            network: spec.network.clone(),
        };

        conn.define_domain(&domain)
            .map_err(|e| Error::hypervisor(format!("failed to define domain '{}'", domain.name), e))?;

        conn.start_domain(&domain.name)
            .map_err(|e| Error::hypervisor(format!("failed to start domain '{}'", domain.name), e))?;

        Ok(())
    }

    fn create_cloud_init_volume(
        conn: &dyn Connection,
        pool: &str,
        names: &MachineNames,
        image: &[u8],
    ) -> Result<String> {
        let volume = names.cloud_init_volume.as_str();
        Self::remove_stale_volume(conn, pool, volume);

        let descriptor = VolumeDescriptor::raw(volume, image.len() as u64);
        let path = conn.create_volume(pool, &descriptor).map_err(|e| {
            Error::hypervisor(format!("failed to create cloud-init storage volume '{}'", volume), e)
        })?;

        conn.upload_volume(pool, volume, image).map_err(|e| {
            Error::hypervisor(format!("failed to upload cloud-init ISO to '{}'", volume), e)
        })?;

        let uploaded = conn.download_volume(pool, volume).map_err(|e| {
            Error::hypervisor(format!("failed to download cloud-init ISO from '{}'", volume), e)
        })?;

        if uploaded != image {
            return Err(Error::UploadVerification {
                volume: volume.to_string(),
                expected: image.len(),
                actual: uploaded.len(),
            });
        }

        debug!("cloud-init volume {} created in pool {}", volume, pool);
        Ok(path)
    }

    fn create_disk_volume(
        conn: &dyn Connection,
        pool: &str,
        names: &MachineNames,
        spec: &MachineSpec,
    ) -> Result<String> {
        let volume = names.disk_volume.as_str();
        Self::remove_stale_volume(conn, pool, volume);

        let descriptor = VolumeDescriptor::overlay(
            volume,
            spec.disk_size,
            &spec.backing_image_path,
            &spec.backing_image_format,
        );
        let path = conn
            .create_volume(pool, &descriptor)
            .map_err(|e| Error::hypervisor(format!("failed to create storage volume '{}'", volume), e))?;

        debug!("disk volume {} created in pool {}", volume, pool);
        Ok(path)
    }

    fn remove_stale_volume(conn: &dyn Connection, pool: &str, volume: &str) {
        match conn.volume_path(pool, volume) {
            Ok(_) => {
                warn!("removing stale volume {} from pool {}", volume, pool);
                if let Err(e) = conn.delete_volume(pool, volume) {
                    warn!("failed to delete stale volume {}: {}", volume, e);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!("failed to look up volume {}: {}", volume, e),
        }
    }

    /// Powers off and undefines the domain, then deletes its volumes.
    ///
    /// A missing domain is not an error. Volume cleanup is best-effort: once the
    /// domain is undefined the call succeeds.
    pub fn destroy(&self, name: &str, storage_pool: &str) -> Result<()> {
        debug!("destroying VM {}", name);

        self.with_connection(|conn| {
            let state = match conn.domain_state(name) {
                Ok(state) => state,
                Err(e) if e.is_not_found() => {
                    debug!("domain {} does not exist, nothing to destroy", name);
                    return Ok(());
                }
                Err(e) => {
                    return Err(Error::hypervisor(
                        format!("failed to look up domain '{}'", name),
                        e,
                    ));
                }
            };

            if state.is_active() {
                debug!("stopping VM {}", name);
                conn.destroy_domain(name)
                    .map_err(|e| Error::hypervisor(format!("failed to stop domain '{}'", name), e))?;
            }

            debug!("undefining VM {}", name);
            conn.undefine_domain(name)
                .map_err(|e| Error::hypervisor(format!("failed to undefine domain '{}'", name), e))?;

            Self::delete_volumes(conn, storage_pool, &MachineNames::new(name));

            debug!("VM {} destroyed and removed", name);
            Ok(())
        })
    }

    fn delete_volumes(conn: &dyn Connection, pool: &str, names: &MachineNames) {
        if let Err(e) = conn.lookup_pool(pool) {
            warn!("failed to get storage pool {}, leaving volumes behind: {}", pool, e);
            return;
        }

        if let Err(e) = conn.refresh_pool(pool) {
            warn!("failed to refresh pool {}: {}", pool, e);
        }

        for volume in [&names.disk_volume, &names.cloud_init_volume] {
            match conn.volume_path(pool, volume) {
                Ok(_) => {
                    debug!("deleting volume {} from pool {}", volume, pool);
                    if let Err(e) = conn.delete_volume(pool, volume) {
                        warn!("failed to delete volume {}: {}", volume, e);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("failed to look up volume {}: {}", volume, e),
            }
        }

        if let Err(e) = conn.refresh_pool(pool) {
            warn!("failed to refresh pool {}: {}", pool, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cloudinit::iso::tests::read_files,
        hypervisor::{DomainInterface, mock::MockHypervisor},
    };

    const USER_DATA: &str = "#cloud-config\nhostname: test1\n";

    fn manager() -> (VmManager, MockHypervisor) {
        let hypervisor = MockHypervisor::new();
        (VmManager::new(Arc::new(hypervisor.clone())), hypervisor)
    }

    fn spec(name: &str) -> MachineSpec {
        MachineSpec::new(name)
            .with_cpu(2)
            .with_memory(2048)
            .with_disk_size(10)
            .with_backing_image("/images/base.qcow2", "qcow2")
            .with_user_data(USER_DATA)
    }

    fn lease(addresses: &[&str]) -> Vec<DomainInterface> {
        vec![DomainInterface {
            name: "vnet0".to_string(),
            hwaddr: Some("52:54:00:00:00:01".to_string()),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }]
    }

    #[test]
    fn test_create_then_exists() {
        let (manager, hypervisor) = manager();
        manager.create(&spec("test1")).unwrap();

        assert!(manager.exists("test1"));
        assert_eq!(
            hypervisor.volume_names("default"),
            vec!["test1-cloudinit.iso".to_string(), "test1.qcow2".to_string()]
        );
        assert_eq!(hypervisor.open_connections(), 0);
    }

    #[test]
    fn test_create_wires_domain() {
        let (manager, hypervisor) = manager();
        manager.create(&spec("test1")).unwrap();

        let domain = hypervisor.domain("test1").unwrap();
        assert_eq!(domain.state, DomainState::Running);
        assert_eq!(domain.descriptor.vcpus, 2);
        assert_eq!(domain.descriptor.memory_mib, 2048);
        assert_eq!(domain.descriptor.network, "default");
        assert_eq!(
            domain.descriptor.disk_path,
            hypervisor.volume("default", "test1.qcow2").unwrap().path
        );
        assert_eq!(
            domain.descriptor.cloud_init_path,
            hypervisor.volume("default", "test1-cloudinit.iso").unwrap().path
        );

        let disk = hypervisor.volume("default", "test1.qcow2").unwrap();
        assert_eq!(disk.descriptor.format, "qcow2");
        let backing = disk.descriptor.backing_store.unwrap();
        assert_eq!(backing.path, "/images/base.qcow2");
        assert_eq!(backing.format, "qcow2");
    }

    #[test]
    fn test_cloud_init_volume_round_trip() {
        let (manager, hypervisor) = manager();
        let spec = spec("test1");
        manager.create(&spec).unwrap();

        let expected = cloudinit::build_image("test1", USER_DATA).unwrap();
        let volume = hypervisor.volume("default", "test1-cloudinit.iso").unwrap();
        assert_eq!(volume.descriptor.capacity_bytes(), expected.len() as u64);
        assert_eq!(volume.data, expected);
        assert_eq!(read_files(&volume.data)["user-data"], USER_DATA.as_bytes());
    }

    #[test]
    fn test_create_rejects_long_name_without_connecting() {
        let (manager, hypervisor) = manager();
        let name = "a".repeat(64);

        let err = manager.create(&spec(&name)).unwrap_err();
        assert!(matches!(err, Error::InvalidName { length: 64, .. }));
        assert_eq!(hypervisor.connections(), 0);

        manager.create(&spec(&"a".repeat(63))).unwrap();
        assert!(manager.exists(&"a".repeat(63)));
    }

    #[test]
    fn test_create_fails_on_corrupt_upload() {
        let (manager, hypervisor) = manager();
        hypervisor.corrupt_uploads(true);

        let err = manager.create(&spec("test1")).unwrap_err();
        assert!(matches!(err, Error::Create { .. }));
        assert!(matches!(err.root(), Error::UploadVerification { .. }));
        assert!(hypervisor.domain("test1").is_none());
        assert_eq!(hypervisor.call_count("define_domain"), 0);
    }

    #[test]
    fn test_create_recovers_from_leftover_volumes() {
        let (manager, hypervisor) = manager();
        hypervisor.fail_call("define_domain");

        let err = manager.create(&spec("test1")).unwrap_err();
        assert!(matches!(err.root(), Error::Hypervisor { .. }));
        assert!(!manager.exists("test1"));
        assert_eq!(hypervisor.volume_names("default").len(), 2);

        hypervisor.clear_failures();
        manager.create(&spec("test1")).unwrap();
        assert!(manager.exists("test1"));
        assert_eq!(hypervisor.volume_names("default").len(), 2);
    }

    #[test]
    fn test_create_in_missing_pool() {
        let (manager, _hypervisor) = manager();
        let err = manager
            .create(&spec("test1").with_storage_pool("missing"))
            .unwrap_err();
        assert!(matches!(err, Error::Create { .. }));
    }

    #[test]
    fn test_exists_on_unknown_name() {
        let (manager, _hypervisor) = manager();
        assert!(!manager.exists("never-created"));
    }

    #[test]
    fn test_probes_are_false_without_connection() {
        let (manager, hypervisor) = manager();
        manager.create(&spec("test1")).unwrap();
        hypervisor.refuse_connections(true);

        assert!(!manager.exists("test1"));
        assert!(!manager.is_ready("test1"));
        assert!(!manager.is_reconciled(&spec("test1")));
        assert!(matches!(
            manager.ip_addresses("test1"),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn test_is_reconciled_detects_drift() {
        let (manager, hypervisor) = manager();
        let spec = spec("test1");
        manager.create(&spec).unwrap();
        assert!(manager.is_reconciled(&spec));

        hypervisor.set_vcpus("test1", 4);
        assert!(!manager.is_reconciled(&spec));

        hypervisor.set_vcpus("test1", 2);
        hypervisor.set_max_memory_mib("test1", 4096);
        assert!(!manager.is_reconciled(&spec));

        assert!(!manager.is_reconciled(&MachineSpec::new("unknown")));
    }

    #[test]
    fn test_is_ready_follows_power_state() {
        let (manager, hypervisor) = manager();
        hypervisor.boot_into(DomainState::Blocked);
        manager.create(&spec("test1")).unwrap();
        assert!(!manager.is_ready("test1"));

        hypervisor.set_state("test1", DomainState::Running);
        assert!(manager.is_ready("test1"));
    }

    #[test]
    fn test_ip_addresses() {
        let (manager, hypervisor) = manager();
        hypervisor.boot_into(DomainState::Paused);
        manager.create(&spec("test1")).unwrap();

        assert!(matches!(
            manager.ip_addresses("test1"),
            Err(Error::NotRunning(_))
        ));

        hypervisor.set_state("test1", DomainState::Running);
        assert!(manager.ip_addresses("test1").unwrap().is_empty());

        let mut interfaces = lease(&["192.168.122.10", "fe80::1"]);
        interfaces.push(DomainInterface {
            name: String::new(),
            hwaddr: None,
            addresses: vec!["10.0.0.1".to_string()],
        });
        hypervisor.set_leases("test1", interfaces);

        assert_eq!(
            manager.ip_addresses("test1").unwrap(),
            vec!["192.168.122.10".to_string(), "fe80::1".to_string()]
        );
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (manager, hypervisor) = manager();
        manager.create(&spec("test1")).unwrap();

        manager.destroy("test1", "default").unwrap();
        assert!(!manager.exists("test1"));
        assert!(hypervisor.volume_names("default").is_empty());

        manager.destroy("test1", "default").unwrap();
        manager.destroy("never-created", "default").unwrap();
        assert_eq!(hypervisor.open_connections(), 0);
    }

    #[test]
    fn test_destroy_skips_power_off_for_stopped_domain() {
        let (manager, hypervisor) = manager();
        manager.create(&spec("test1")).unwrap();
        hypervisor.set_state("test1", DomainState::Shutoff);

        manager.destroy("test1", "default").unwrap();
        assert_eq!(hypervisor.call_count("destroy_domain"), 0);
        assert!(hypervisor.domain("test1").is_none());
    }

    #[test]
    fn test_destroy_tolerates_volume_failures() {
        let (manager, hypervisor) = manager();
        manager.create(&spec("test1")).unwrap();
        hypervisor.fail_call("delete_volume");
        hypervisor.fail_call("refresh_pool");

        manager.destroy("test1", "default").unwrap();
        assert!(hypervisor.domain("test1").is_none());
        assert_eq!(hypervisor.volume_names("default").len(), 2);
    }

    #[test]
    fn test_destroy_fails_when_undefine_fails() {
        let (manager, hypervisor) = manager();
        manager.create(&spec("test1")).unwrap();
        hypervisor.fail_call("undefine_domain");

        let err = manager.destroy("test1", "default").unwrap_err();
        assert!(matches!(err, Error::Hypervisor { .. }));
    }
}
