use tracing::debug;
use virt::{
    connect::Connect,
    domain::Domain,
    error::{Error as VirtError, ErrorNumber},
    storage_pool::StoragePool,
    storage_vol::StorageVol,
    stream::Stream,
    sys,
};

use crate::{
    error::{Error, Result},
    hypervisor::{
        Connection, Connector, DomainInfo, DomainInterface, DomainState, HypervisorError,
        HypervisorResult, ObjectKind, uri::resolve_uri,
    },
    machine::descriptor::{DomainDescriptor, VolumeDescriptor},
};

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Connects to the libvirt endpoint named by `LIBVIRT_URI` / `LIBVIRT_DEFAULT_URI`.
///
/// The URI is read again on every connect, nothing is cached between operations.
#[derive(Debug, Default, Clone)]
pub struct LibvirtConnector;

impl Connector for LibvirtConnector {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let uri = resolve_uri()?;
        debug!("connecting to libvirt at {}", uri);

        let conn = Connect::open(Some(uri.as_str())).map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Box::new(LibvirtConnection { conn }))
    }
}

pub struct LibvirtConnection {
    conn: Connect,
}

fn map_err(kind: ObjectKind, name: &str) -> impl FnOnce(VirtError) -> HypervisorError + '_ {
    move |e| classify(e.code(), kind, name, || e.to_string())
}

fn classify(
    code: ErrorNumber,
    kind: ObjectKind,
    name: &str,
    message: impl FnOnce() -> String,
) -> HypervisorError {
    match code {
        ErrorNumber::NoDomain | ErrorNumber::NoStoragePool | ErrorNumber::NoStorageVolume => {
            HypervisorError::not_found(kind, name)
        }
        ErrorNumber::StorageVolExist => HypervisorError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        _ => HypervisorError::Call(message()),
    }
}

fn call_err(e: VirtError) -> HypervisorError {
    HypervisorError::Call(e.to_string())
}

fn domain_state(state: sys::virDomainState) -> DomainState {
    match state {
        sys::VIR_DOMAIN_RUNNING => DomainState::Running,
        sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
        sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
        sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => DomainState::PmSuspended,
        _ => DomainState::NoState,
    }
}

impl LibvirtConnection {
    fn domain(&self, name: &str) -> HypervisorResult<Domain> {
        Domain::lookup_by_name(&self.conn, name).map_err(map_err(ObjectKind::Domain, name))
    }

    fn pool(&self, pool: &str) -> HypervisorResult<StoragePool> {
        StoragePool::lookup_by_name(&self.conn, pool).map_err(map_err(ObjectKind::StoragePool, pool))
    }

    fn volume(&self, pool: &str, volume: &str) -> HypervisorResult<StorageVol> {
        let pool = self.pool(pool)?;
        StorageVol::lookup_by_name(&pool, volume).map_err(map_err(ObjectKind::StorageVolume, volume))
    }
}

impl Connection for LibvirtConnection {
    fn domain_info(&self, name: &str) -> HypervisorResult<DomainInfo> {
        let info = self.domain(name)?.get_info().map_err(call_err)?;

        Ok(DomainInfo {
            state: domain_state(info.state),
            max_memory_kib: info.max_mem,
            memory_kib: info.memory,
            vcpus: info.nr_virt_cpu,
        })
    }

    fn domain_state(&self, name: &str) -> HypervisorResult<DomainState> {
        let (state, _reason) = self.domain(name)?.get_state().map_err(call_err)?;
        Ok(domain_state(state))
    }

    fn define_domain(&self, descriptor: &DomainDescriptor) -> HypervisorResult<()> {
        Domain::define_xml(&self.conn, &descriptor.to_xml()).map_err(call_err)?;
        Ok(())
    }

    fn start_domain(&self, name: &str) -> HypervisorResult<()> {
        self.domain(name)?.create().map_err(call_err)?;
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> HypervisorResult<()> {
        self.domain(name)?.destroy().map_err(call_err)
    }

    fn undefine_domain(&self, name: &str) -> HypervisorResult<()> {
        self.domain(name)?.undefine().map_err(call_err)
    }

    fn domain_lease_addresses(&self, name: &str) -> HypervisorResult<Vec<DomainInterface>> {
        let interfaces = self
            .domain(name)?
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
            .map_err(call_err)?;

        Ok(interfaces
            .into_iter()
            .map(|iface| DomainInterface {
                name: iface.name,
                hwaddr: Some(iface.hwaddr).filter(|hwaddr| !hwaddr.is_empty()),
                addresses: iface.addrs.into_iter().map(|addr| addr.addr).collect(),
            })
            .collect())
    }

    fn lookup_pool(&self, pool: &str) -> HypervisorResult<()> {
        self.pool(pool).map(|_| ())
    }

    fn refresh_pool(&self, pool: &str) -> HypervisorResult<()> {
        self.pool(pool)?.refresh(0).map_err(call_err)?;
        Ok(())
    }

    fn create_volume(&self, pool: &str, descriptor: &VolumeDescriptor) -> HypervisorResult<String> {
        let pool = self.pool(pool)?;
        let volume = StorageVol::create_xml(&pool, &descriptor.to_xml(), 0)
            .map_err(map_err(ObjectKind::StorageVolume, &descriptor.name))?;

        volume.get_path().map_err(call_err)
    }

    fn volume_path(&self, pool: &str, volume: &str) -> HypervisorResult<String> {
        self.volume(pool, volume)?.get_path().map_err(call_err)
    }

    fn upload_volume(&self, pool: &str, volume: &str, data: &[u8]) -> HypervisorResult<()> {
        let volume = self.volume(pool, volume)?;
        let stream = Stream::new(&self.conn, 0).map_err(call_err)?;
        volume
            .upload(&stream, 0, data.len() as u64, 0)
            .map_err(call_err)?;

        let mut sent = 0;
        while sent < data.len() {
            let end = (sent + STREAM_CHUNK_SIZE).min(data.len());
            let written = stream.send(&data[sent..end]).map_err(call_err)?;
            if written == 0 {
                return Err(HypervisorError::Call(format!(
                    "upload stream closed after {} of {} bytes",
                    sent,
                    data.len()
                )));
            }
            sent += written;
        }

        stream.finish().map_err(call_err)
    }

    fn download_volume(&self, pool: &str, volume: &str) -> HypervisorResult<Vec<u8>> {
        let volume = self.volume(pool, volume)?;
        let stream = Stream::new(&self.conn, 0).map_err(call_err)?;
        volume.download(&stream, 0, 0, 0).map_err(call_err)?;

        let mut data = Vec::new();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let read = stream.recv(&mut buf).map_err(call_err)?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&buf[..read]);
        }

        stream.finish().map_err(call_err)?;
        Ok(data)
    }

    fn delete_volume(&self, pool: &str, volume: &str) -> HypervisorResult<()> {
        self.volume(pool, volume)?.delete(0).map_err(call_err)
    }

    fn disconnect(self: Box<Self>) -> HypervisorResult<()> {
        let mut this = *self;
        this.conn.close().map_err(call_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> String {
        "libvirt said no".to_string()
    }

    #[test]
    fn test_missing_objects_are_not_found() {
        let cases = [
            (ErrorNumber::NoDomain, ObjectKind::Domain, "test1"),
            (ErrorNumber::NoStoragePool, ObjectKind::StoragePool, "default"),
            (ErrorNumber::NoStorageVolume, ObjectKind::StorageVolume, "test1.qcow2"),
        ];

        for (code, kind, name) in cases {
            let err = classify(code, kind, name, message);
            assert_eq!(err, HypervisorError::not_found(kind, name));
            assert!(err.is_not_found());
        }
    }

    #[test]
    fn test_existing_volume() {
        let err = classify(
            ErrorNumber::StorageVolExist,
            ObjectKind::StorageVolume,
            "test1.qcow2",
            message,
        );
        assert_eq!(
            err,
            HypervisorError::AlreadyExists {
                kind: ObjectKind::StorageVolume,
                name: "test1.qcow2".to_string(),
            }
        );
    }

    #[test]
    fn test_other_failures_keep_the_message() {
        let err = classify(ErrorNumber::OperationInvalid, ObjectKind::Domain, "test1", message);
        assert_eq!(err, HypervisorError::Call("libvirt said no".to_string()));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_domain_state() {
        assert_eq!(domain_state(sys::VIR_DOMAIN_RUNNING), DomainState::Running);
        assert_eq!(domain_state(sys::VIR_DOMAIN_SHUTOFF), DomainState::Shutoff);
        assert_eq!(domain_state(sys::VIR_DOMAIN_NOSTATE), DomainState::NoState);
    }
}
