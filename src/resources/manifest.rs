use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    config::DefaultsConfig,
    constants::{BOOTSTRAP_FORMAT_KEY, BOOTSTRAP_VALUE_KEY},
    resources::machine::MachineSpec,
};

/// A machine as written by an operator in YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineManifest {
    pub name: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub storage_pool: Option<String>,
    pub cpu: u32,
    pub memory: u64,
    pub disk_size: u64,
    pub backing_image_path: String,
    #[serde(default)]
    pub backing_image_format: Option<String>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapManifest>,
}

/// Same shape as the bootstrap secret: a `value` and an optional `format`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapManifest {
    pub value: String,
    #[serde(default)]
    pub format: Option<String>,
}

impl BootstrapManifest {
    pub fn secret_data(&self) -> BTreeMap<String, String> {
        let mut data = BTreeMap::new();
        data.insert(BOOTSTRAP_VALUE_KEY.to_string(), self.value.clone());
        if let Some(format) = &self.format {
            data.insert(BOOTSTRAP_FORMAT_KEY.to_string(), format.clone());
        }
        data
    }
}

impl MachineManifest {
    pub fn parse(manifest: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(manifest)?;
        Ok(manifest)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let manifest = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read manifest {}", path.display()))?;

        Self::parse(&manifest).with_context(|| format!("invalid manifest {}", path.display()))
    }

    /// Builds the spec without user-data; bootstrap data is resolved separately.
    pub fn to_spec(&self, defaults: &DefaultsConfig) -> MachineSpec {
        MachineSpec::new(&self.name)
            .with_network(self.network.as_deref().unwrap_or(&defaults.network))
            .with_storage_pool(
                self.storage_pool
                    .as_deref()
                    .unwrap_or(&defaults.storage_pool),
            )
            .with_cpu(self.cpu)
            .with_memory(self.memory)
            .with_disk_size(self.disk_size)
            .with_backing_image(
                &self.backing_image_path,
                self.backing_image_format
                    .as_deref()
                    .unwrap_or(&defaults.backing_image_format),
            )
    }

    pub fn bootstrap_secret_name(&self) -> String {
        format!("{}-bootstrap", self.name)
    }
}
