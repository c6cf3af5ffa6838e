use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKING_IMAGE_FORMAT, DEFAULT_NETWORK, DEFAULT_STORAGE_POOL, PROVIDER_ID_PREFIX,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub name: String,
    pub network: String,
    pub storage_pool: String,
    pub cpu: u32,
    /// MiB
    pub memory: u64,
    /// GiB
    pub disk_size: u64,
    pub backing_image_path: String,
    pub backing_image_format: String,
    /// cloud-config text, empty until the bootstrap data has been resolved
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data: String,
}

impl MachineSpec {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            network: DEFAULT_NETWORK.to_string(),
            storage_pool: DEFAULT_STORAGE_POOL.to_string(),
            cpu: 1,
            memory: 1024,
            disk_size: 10,
            backing_image_path: String::new(),
            backing_image_format: DEFAULT_BACKING_IMAGE_FORMAT.to_string(),
            user_data: String::new(),
        }
    }

    pub fn with_network(mut self, network: impl AsRef<str>) -> Self {
        self.network = network.as_ref().to_string();
        self
    }

    pub fn with_storage_pool(mut self, pool: impl AsRef<str>) -> Self {
        self.storage_pool = pool.as_ref().to_string();
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory = memory_mib;
        self
    }

    pub fn with_disk_size(mut self, disk_size_gib: u64) -> Self {
        self.disk_size = disk_size_gib;
        self
    }

    pub fn with_backing_image(mut self, path: impl AsRef<str>, format: impl AsRef<str>) -> Self {
        self.backing_image_path = path.as_ref().to_string();
        self.backing_image_format = format.as_ref().to_string();
        self
    }

    pub fn with_user_data(mut self, user_data: impl AsRef<str>) -> Self {
        self.user_data = user_data.as_ref().to_string();
        self
    }

    pub fn names(&self) -> MachineNames {
        MachineNames::new(&self.name)
    }
}

/// Hypervisor object names for a machine.
///
/// Everything a machine owns on the host is named after the machine itself, so
/// create and destroy agree on what to touch without any stored mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineNames {
    pub domain: String,
    pub disk_volume: String,
    pub cloud_init_volume: String,
}

impl MachineNames {
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        Self {
            domain: name.to_string(),
            disk_volume: format!("{}.qcow2", name),
            cloud_init_volume: format!("{}-cloudinit.iso", name),
        }
    }
}

pub fn provider_id(name: impl AsRef<str>) -> String {
    format!("{}{}", PROVIDER_ID_PREFIX, name.as_ref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachinePhase {
    #[default]
    #[serde(rename = "awaiting-dependencies")]
    AwaitingDependencies,
    #[serde(rename = "awaiting-bootstrap")]
    AwaitingBootstrap,
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "verifying")]
    Verifying,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "drifted")]
    Drifted,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "deleted")]
    Deleted,
    #[serde(rename = "paused")]
    Paused,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            MachinePhase::AwaitingDependencies => "awaiting-dependencies",
            MachinePhase::AwaitingBootstrap => "awaiting-bootstrap",
            MachinePhase::Creating => "creating",
            MachinePhase::Verifying => "verifying",
            MachinePhase::Ready => "ready",
            MachinePhase::Drifted => "drifted",
            MachinePhase::Deleting => "deleting",
            MachinePhase::Deleted => "deleted",
            MachinePhase::Paused => "paused",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineAddressType {
    #[serde(rename = "ExternalIP")]
    ExternalIp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub kind: MachineAddressType,
    pub address: String,
}

impl MachineAddress {
    /// The host is bridged onto the libvirt network, so every lease is reachable from outside.
    pub fn external(address: impl AsRef<str>) -> Self {
        Self {
            kind: MachineAddressType::ExternalIp,
            address: address.as_ref().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineStatus {
    pub phase: MachinePhase,
    pub ready: bool,
    pub provisioned: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl MachineStatus {
    /// Drops everything that was read off a live domain.
    pub fn clear_observations(&mut self) {
        self.ready = false;
        self.provisioned = false;
        self.addresses.clear();
        self.provider_id = None;
    }
}

/// Links to the objects a machine hangs off of; a machine is only acted on once all are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Prerequisites {
    pub owner_linked: bool,
    pub cluster_linked: bool,
    pub cluster_provisioned: bool,
}

impl Prerequisites {
    pub fn satisfied() -> Self {
        Self {
            owner_linked: true,
            cluster_linked: true,
            cluster_provisioned: true,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.owner_linked && self.cluster_linked && self.cluster_provisioned
    }
}

/// Desired-state snapshot of one machine, as held by the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub finalizer: bool,
    #[serde(default)]
    pub prerequisites: Prerequisites,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_secret: Option<String>,
}

impl MachineRecord {
    pub fn new(spec: MachineSpec) -> Self {
        Self {
            spec,
            status: MachineStatus::default(),
            resource_version: 0,
            deletion_requested: false,
            paused: false,
            finalizer: true,
            prerequisites: Prerequisites::default(),
            bootstrap_secret: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}
