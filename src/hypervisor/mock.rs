//! In-memory hypervisor.
//!
//! Behaves like a libvirt host closely enough to drive the lifecycle manager
//! and the controller in tests: pools hold volumes with real byte contents,
//! domains have a power state and DHCP leases, and everything can be poked
//! out-of-band to simulate drift or faults.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    constants::DEFAULT_STORAGE_POOL,
    error::{Error, Result},
    hypervisor::{
        Connection, Connector, DomainInfo, DomainInterface, DomainState, HypervisorError,
        HypervisorResult, ObjectKind,
    },
    machine::descriptor::{DomainDescriptor, VolumeCapacity, VolumeDescriptor},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDomain {
    pub descriptor: DomainDescriptor,
    pub state: DomainState,
    pub vcpus: u32,
    pub max_memory_kib: u64,
    pub interfaces: Vec<DomainInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockVolume {
    pub descriptor: VolumeDescriptor,
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    domains: BTreeMap<String, MockDomain>,
    pools: BTreeMap<String, BTreeMap<String, MockVolume>>,
    connections: usize,
    open_connections: usize,
    calls: Vec<String>,
    refuse_connections: bool,
    corrupt_uploads: bool,
    failing_calls: Vec<String>,
    boot_state: Option<DomainState>,
    boot_leases: Vec<DomainInterface>,
}

impl MockState {
    fn record(&mut self, call: &str) -> HypervisorResult<()> {
        self.calls.push(call.to_string());
        if self.failing_calls.iter().any(|c| c == call) {
            return Err(HypervisorError::Call(format!("{} failed (injected)", call)));
        }
        Ok(())
    }

    fn domain_mut(&mut self, name: &str) -> HypervisorResult<&mut MockDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Domain, name))
    }

    fn pool_mut(&mut self, pool: &str) -> HypervisorResult<&mut BTreeMap<String, MockVolume>> {
        self.pools
            .get_mut(pool)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::StoragePool, pool))
    }

    fn volume_mut(&mut self, pool: &str, volume: &str) -> HypervisorResult<&mut MockVolume> {
        self.pool_mut(pool)?
            .get_mut(volume)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::StorageVolume, volume))
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn volume_path(pool: &str, volume: &str) -> String {
    format!("/var/lib/libvirt/{}/{}", pool, volume)
}

#[derive(Debug, Clone)]
pub struct MockHypervisor {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    /// A host with an empty `default` storage pool.
    pub fn new() -> Self {
        let hypervisor = Self {
            state: Arc::new(Mutex::new(MockState::default())),
        };
        hypervisor.add_pool(DEFAULT_STORAGE_POOL);
        hypervisor
    }

    pub fn add_pool(&self, pool: impl AsRef<str>) {
        lock(&self.state)
            .pools
            .entry(pool.as_ref().to_string())
            .or_default();
    }

    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    /// Every upload lands with its last byte flipped.
    pub fn corrupt_uploads(&self, corrupt: bool) {
        lock(&self.state).corrupt_uploads = corrupt;
    }

    /// Makes every subsequent call of this kind (e.g. `"define_domain"`) fail.
    pub fn fail_call(&self, call: impl AsRef<str>) {
        lock(&self.state)
            .failing_calls
            .push(call.as_ref().to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failing_calls.clear();
    }

    /// State a domain lands in when started; `Running` unless overridden.
    pub fn boot_into(&self, state: DomainState) {
        lock(&self.state).boot_state = Some(state);
    }

    /// Leases handed to every domain when it starts.
    pub fn lease_on_boot(&self, interfaces: Vec<DomainInterface>) {
        lock(&self.state).boot_leases = interfaces;
    }

    pub fn set_state(&self, name: &str, state: DomainState) {
        if let Some(domain) = lock(&self.state).domains.get_mut(name) {
            domain.state = state;
        }
    }

    pub fn set_vcpus(&self, name: &str, vcpus: u32) {
        if let Some(domain) = lock(&self.state).domains.get_mut(name) {
            domain.vcpus = vcpus;
        }
    }

    pub fn set_max_memory_mib(&self, name: &str, memory_mib: u64) {
        if let Some(domain) = lock(&self.state).domains.get_mut(name) {
            domain.max_memory_kib = memory_mib * 1024;
        }
    }

    pub fn set_leases(&self, name: &str, interfaces: Vec<DomainInterface>) {
        if let Some(domain) = lock(&self.state).domains.get_mut(name) {
            domain.interfaces = interfaces;
        }
    }

    pub fn insert_volume(&self, pool: &str, descriptor: VolumeDescriptor, data: Vec<u8>) {
        let mut state = lock(&self.state);
        let volumes = state.pools.entry(pool.to_string()).or_default();
        volumes.insert(
            descriptor.name.clone(),
            MockVolume {
                path: volume_path(pool, &descriptor.name),
                descriptor,
                data,
            },
        );
    }

    pub fn domain(&self, name: &str) -> Option<MockDomain> {
        lock(&self.state).domains.get(name).cloned()
    }

    pub fn volume(&self, pool: &str, volume: &str) -> Option<MockVolume> {
        lock(&self.state)
            .pools
            .get(pool)
            .and_then(|volumes| volumes.get(volume))
            .cloned()
    }

    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        lock(&self.state)
            .pools
            .get(pool)
            .map(|volumes| volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Total connections opened so far.
    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }

    /// Connections opened but not yet disconnected.
    pub fn open_connections(&self) -> usize {
        lock(&self.state).open_connections
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        lock(&self.state).calls.iter().filter(|c| *c == call).count()
    }
}

impl Connector for MockHypervisor {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut state = lock(&self.state);
        if state.refuse_connections {
            return Err(Error::Connection("connection refused".to_string()));
        }

        state.connections += 1;
        state.open_connections += 1;

        Ok(Box::new(MockConnection {
            state: self.state.clone(),
        }))
    }
}

pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl Connection for MockConnection {
    fn domain_info(&self, name: &str) -> HypervisorResult<DomainInfo> {
        let mut state = lock(&self.state);
        state.record("domain_info")?;
        let domain = state.domain_mut(name)?;

        Ok(DomainInfo {
            state: domain.state,
            max_memory_kib: domain.max_memory_kib,
            memory_kib: domain.max_memory_kib,
            vcpus: domain.vcpus,
        })
    }

    fn domain_state(&self, name: &str) -> HypervisorResult<DomainState> {
        let mut state = lock(&self.state);
        state.record("domain_state")?;
        Ok(state.domain_mut(name)?.state)
    }

    fn define_domain(&self, descriptor: &DomainDescriptor) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.record("define_domain")?;

        let vcpus = descriptor.vcpus;
        let max_memory_kib = descriptor.memory_mib * 1024;
        match state.domains.get_mut(&descriptor.name) {
            Some(domain) => {
                domain.descriptor = descriptor.clone();
                domain.vcpus = vcpus;
                domain.max_memory_kib = max_memory_kib;
            }
            None => {
                state.domains.insert(
                    descriptor.name.clone(),
                    MockDomain {
                        descriptor: descriptor.clone(),
                        state: DomainState::Shutoff,
                        vcpus,
                        max_memory_kib,
                        interfaces: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn start_domain(&self, name: &str) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.record("start_domain")?;

        let boot_state = state.boot_state.unwrap_or(DomainState::Running);
        let boot_leases = state.boot_leases.clone();
        let domain = state.domain_mut(name)?;
        if domain.state == DomainState::Running {
            return Err(HypervisorError::Call(format!(
                "domain '{}' is already running",
                name
            )));
        }

        domain.state = boot_state;
        domain.interfaces = boot_leases;
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.record("destroy_domain")?;

        let domain = state.domain_mut(name)?;
        if domain.state == DomainState::Shutoff {
            return Err(HypervisorError::Call(format!(
                "domain '{}' is not running",
                name
            )));
        }

        domain.state = DomainState::Shutoff;
        domain.interfaces.clear();
        Ok(())
    }

    fn undefine_domain(&self, name: &str) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.record("undefine_domain")?;

        state
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Domain, name))
    }

    fn domain_lease_addresses(&self, name: &str) -> HypervisorResult<Vec<DomainInterface>> {
        let mut state = lock(&self.state);
        state.record("domain_lease_addresses")?;

        let domain = state.domain_mut(name)?;
        if domain.state != DomainState::Running {
            return Err(HypervisorError::Call(format!(
                "domain '{}' is not running",
                name
            )));
        }
        Ok(domain.interfaces.clone())
    }

    fn lookup_pool(&self, pool: &str) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.record("lookup_pool")?;
        state.pool_mut(pool).map(|_| ())
    }

    fn refresh_pool(&self, pool: &str) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.record("refresh_pool")?;
        state.pool_mut(pool).map(|_| ())
    }

    fn create_volume(&self, pool: &str, descriptor: &VolumeDescriptor) -> HypervisorResult<String> {
        let mut state = lock(&self.state);
        state.record("create_volume")?;

        let volumes = state.pool_mut(pool)?;
        if volumes.contains_key(&descriptor.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: ObjectKind::StorageVolume,
                name: descriptor.name.clone(),
            });
        }

        // raw volumes read back as zeros until written, overlays start out empty
        let data = match descriptor.capacity {
            VolumeCapacity::Bytes(bytes) if descriptor.backing_store.is_none() => {
                vec![0u8; bytes as usize]
            }
            _ => Vec::new(),
        };

        let path = volume_path(pool, &descriptor.name);
        volumes.insert(
            descriptor.name.clone(),
            MockVolume {
                descriptor: descriptor.clone(),
                path: path.clone(),
                data,
            },
        );
        Ok(path)
    }

    fn volume_path(&self, pool: &str, volume: &str) -> HypervisorResult<String> {
        let mut state = lock(&self.state);
        state.record("volume_path")?;
        Ok(state.volume_mut(pool, volume)?.path.clone())
    }

    fn upload_volume(&self, pool: &str, volume: &str, data: &[u8]) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.record("upload_volume")?;

        let corrupt = state.corrupt_uploads;
        let target = state.volume_mut(pool, volume)?;
        if data.len() as u64 > target.descriptor.capacity_bytes() {
            return Err(HypervisorError::Call(format!(
                "upload of {} bytes exceeds capacity of volume '{}'",
                data.len(),
                volume
            )));
        }

        target.data = data.to_vec();
        if corrupt {
            if let Some(last) = target.data.last_mut() {
                *last ^= 0xff;
            }
        }
        Ok(())
    }

    fn download_volume(&self, pool: &str, volume: &str) -> HypervisorResult<Vec<u8>> {
        let mut state = lock(&self.state);
        state.record("download_volume")?;
        Ok(state.volume_mut(pool, volume)?.data.clone())
    }

    fn delete_volume(&self, pool: &str, volume: &str) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.record("delete_volume")?;

        state
            .pool_mut(pool)?
            .remove(volume)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::StorageVolume, volume))
    }

    fn disconnect(self: Box<Self>) -> HypervisorResult<()> {
        let mut state = lock(&self.state);
        state.open_connections = state.open_connections.saturating_sub(1);
        Ok(())
    }
}
