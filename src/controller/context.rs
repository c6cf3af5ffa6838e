use std::{fmt, sync::Arc};

use anyhow::Result;

use crate::{
    machine::VmManager,
    repository::{BootstrapSource, MachineRepository},
    resources::machine::MachineStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerKey {
    pub name: String,
}

impl ControllerKey {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_string(),
        }
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "machine.{}", self.name)
    }
}

#[derive(Clone)]
pub struct ControllerContext {
    pub repository: Arc<dyn MachineRepository>,
    pub secrets: Arc<dyn BootstrapSource>,
    pub machines: VmManager,
}

impl ControllerContext {
    pub fn new(
        repository: Arc<dyn MachineRepository>,
        secrets: Arc<dyn BootstrapSource>,
        machines: VmManager,
    ) -> Self {
        Self {
            repository,
            secrets,
            machines,
        }
    }

    pub async fn patch_status<F>(&self, name: &str, f: F) -> Result<MachineStatus>
    where
        F: FnOnce(&mut MachineStatus) + Send + 'static,
    {
        self.repository.patch_status(name, Box::new(f)).await
    }
}
