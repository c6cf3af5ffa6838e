#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod mock;
pub mod uri;

use thiserror::Error;

use crate::{
    error::Result,
    machine::descriptor::{DomainDescriptor, VolumeDescriptor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Domain,
    StoragePool,
    StorageVolume,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Domain => f.write_str("domain"),
            ObjectKind::StoragePool => f.write_str("storage pool"),
            ObjectKind::StorageVolume => f.write_str("storage volume"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HypervisorError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("{0}")]
    Call(String),
}

impl HypervisorError {
    pub fn not_found(kind: ObjectKind, name: impl AsRef<str>) -> Self {
        Self::NotFound {
            kind,
            name: name.as_ref().to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound { .. })
    }
}

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            DomainState::NoState => "no-state",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pm-suspended",
        };
        f.write_str(state)
    }
}

impl DomainState {
    /// Anything but a powered-off domain still holds hypervisor resources.
    pub fn is_active(&self) -> bool {
        !matches!(self, DomainState::Shutoff | DomainState::NoState)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: DomainState,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInterface {
    pub name: String,
    pub hwaddr: Option<String>,
    pub addresses: Vec<String>,
}

/// An open session with the hypervisor.
///
/// All objects are addressed by name. A connection is opened for a single
/// lifecycle operation and closed with [`Connection::disconnect`] when it is done.
pub trait Connection {
    fn domain_info(&self, name: &str) -> HypervisorResult<DomainInfo>;

    fn domain_state(&self, name: &str) -> HypervisorResult<DomainState>;

    fn define_domain(&self, descriptor: &DomainDescriptor) -> HypervisorResult<()>;

    fn start_domain(&self, name: &str) -> HypervisorResult<()>;

    /// Hard power-off.
    fn destroy_domain(&self, name: &str) -> HypervisorResult<()>;

    fn undefine_domain(&self, name: &str) -> HypervisorResult<()>;

    /// Addresses handed out by the network's DHCP server.
    fn domain_lease_addresses(&self, name: &str) -> HypervisorResult<Vec<DomainInterface>>;

    fn lookup_pool(&self, pool: &str) -> HypervisorResult<()>;

    fn refresh_pool(&self, pool: &str) -> HypervisorResult<()>;

    /// Returns the path of the new volume on the host.
    fn create_volume(&self, pool: &str, descriptor: &VolumeDescriptor) -> HypervisorResult<String>;

    fn volume_path(&self, pool: &str, volume: &str) -> HypervisorResult<String>;

    fn upload_volume(&self, pool: &str, volume: &str, data: &[u8]) -> HypervisorResult<()>;

    fn download_volume(&self, pool: &str, volume: &str) -> HypervisorResult<Vec<u8>>;

    fn delete_volume(&self, pool: &str, volume: &str) -> HypervisorResult<()>;

    fn disconnect(self: Box<Self>) -> HypervisorResult<()>;
}

pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>>;
}
