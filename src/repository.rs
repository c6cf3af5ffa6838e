//! Store seams the controller reads desired state from and writes status to.
//!
//! In a cluster these are backed by the API server; the in-memory versions
//! here back the CLI and the test-suite.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use papaya::HashMap;
use tracing::debug;

use crate::resources::machine::{MachineRecord, MachineStatus};

pub type StatusPatch = Box<dyn FnOnce(&mut MachineStatus) + Send>;

#[async_trait]
pub trait MachineRepository: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<MachineRecord>>;

    /// Applies `patch` to the stored status and returns the result.
    async fn patch_status(&self, name: &str, patch: StatusPatch) -> Result<MachineStatus>;

    /// Releases the deletion hold; a record with a pending deletion is dropped.
    async fn remove_finalizer(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait BootstrapSource: Send + Sync {
    /// Data of the named secret, `None` while it cannot be read.
    async fn secret(&self, name: &str) -> Result<Option<BTreeMap<String, String>>>;
}

#[derive(Clone)]
pub struct MemoryRepository {
    machines: Arc<HashMap<String, MachineRecord>>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            machines: Arc::new(HashMap::new()),
        }
    }

    pub fn insert(&self, record: MachineRecord) {
        let machines = self.machines.pin();
        machines.insert(record.name().to_string(), record);
    }

    /// Out-of-band edit of desired state (pause, deletion request, spec change).
    pub fn update<F>(&self, name: &str, f: F) -> Option<MachineRecord>
    where
        F: FnOnce(&mut MachineRecord),
    {
        let machines = self.machines.pin();
        let mut record = machines.get(name).cloned()?;
        f(&mut record);
        record.resource_version += 1;
        machines.insert(name.to_string(), record.clone());
        Some(record)
    }

    pub fn list(&self) -> Vec<MachineRecord> {
        let machines = self.machines.pin();
        machines.values().cloned().collect()
    }
}

#[async_trait]
impl MachineRepository for MemoryRepository {
    async fn get(&self, name: &str) -> Result<Option<MachineRecord>> {
        let machines = self.machines.pin();
        Ok(machines.get(name).cloned())
    }

    async fn patch_status(&self, name: &str, patch: StatusPatch) -> Result<MachineStatus> {
        let machines = self.machines.pin();
        let Some(mut record) = machines.get(name).cloned() else {
            return Err(anyhow!("machine {} not found", name));
        };

        patch(&mut record.status);
        record.resource_version += 1;

        let status = record.status.clone();
        machines.insert(name.to_string(), record);
        Ok(status)
    }

    async fn remove_finalizer(&self, name: &str) -> Result<()> {
        let machines = self.machines.pin();
        let Some(mut record) = machines.get(name).cloned() else {
            return Ok(());
        };

        if record.deletion_requested {
            debug!("machine {} released, dropping record", name);
            machines.remove(name);
            return Ok(());
        }

        record.finalizer = false;
        record.resource_version += 1;
        machines.insert(name.to_string(), record);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemorySecrets {
    secrets: Arc<HashMap<String, BTreeMap<String, String>>>,
}

impl Default for MemorySecrets {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self {
            secrets: Arc::new(HashMap::new()),
        }
    }

    pub fn insert(&self, name: impl AsRef<str>, data: BTreeMap<String, String>) {
        let secrets = self.secrets.pin();
        secrets.insert(name.as_ref().to_string(), data);
    }
}

#[async_trait]
impl BootstrapSource for MemorySecrets {
    async fn secret(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let secrets = self.secrets.pin();
        Ok(secrets.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::machine::{MachinePhase, MachineSpec};

    #[tokio::test]
    async fn test_patch_status_bumps_version() {
        let repository = MemoryRepository::new();
        repository.insert(MachineRecord::new(MachineSpec::new("test1")));

        let status = repository
            .patch_status(
                "test1",
                Box::new(|status: &mut MachineStatus| {
                    status.phase = MachinePhase::Creating
                }),
            )
            .await
            .unwrap();
        assert_eq!(status.phase, MachinePhase::Creating);

        let record = repository.get("test1").await.unwrap().unwrap();
        assert_eq!(record.resource_version, 1);
        assert_eq!(record.status.phase, MachinePhase::Creating);
    }

    #[tokio::test]
    async fn test_patch_status_unknown_machine() {
        let repository = MemoryRepository::new();
        let result = repository.patch_status("missing", Box::new(|_: &mut MachineStatus| {})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_remove_finalizer() {
        let repository = MemoryRepository::new();
        repository.insert(MachineRecord::new(MachineSpec::new("kept")));
        repository.insert(MachineRecord::new(MachineSpec::new("deleted")));
        repository.update("deleted", |record| record.deletion_requested = true);

        repository.remove_finalizer("kept").await.unwrap();
        repository.remove_finalizer("deleted").await.unwrap();

        let kept = repository.get("kept").await.unwrap().unwrap();
        assert!(!kept.finalizer);
        assert!(repository.get("deleted").await.unwrap().is_none());
        assert_eq!(repository.list().len(), 1);
    }

    #[tokio::test]
    async fn test_secrets() {
        let secrets = MemorySecrets::new();
        assert!(secrets.secret("s").await.unwrap().is_none());

        let mut data = BTreeMap::new();
        data.insert("value".to_string(), "#cloud-config\n".to_string());
        secrets.insert("s", data.clone());
        assert_eq!(secrets.secret("s").await.unwrap(), Some(data));
    }
}
