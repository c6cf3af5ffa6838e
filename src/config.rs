use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;
use tracing::warn;

use crate::constants::{
    DEFAULT_BACKING_IMAGE_FORMAT, DEFAULT_DRIFT_REQUEUE, DEFAULT_ERROR_REQUEUE, DEFAULT_NETWORK,
    DEFAULT_PAUSED_REQUEUE, DEFAULT_PERIODIC_REQUEUE, DEFAULT_POLL_REQUEUE, DEFAULT_STORAGE_POOL,
};

pub const CONFIG_PATH_ENV: &str = "PROVISIONER_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(skip_serializing, skip_deserializing)]
    pub config_path: Option<PathBuf>,

    #[serde(rename = "requeue", default)]
    pub requeue: RequeueConfig,

    #[serde(rename = "defaults", default)]
    pub defaults: DefaultsConfig,
}

/// How long the scheduler should wait before the next pass, per outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequeueConfig {
    #[serde(rename = "paused", with = "humantime_duration")]
    pub paused: Duration,
    #[serde(rename = "drift", with = "humantime_duration")]
    pub drift: Duration,
    #[serde(rename = "poll", with = "humantime_duration")]
    pub poll: Duration,
    #[serde(rename = "periodic", with = "humantime_duration")]
    pub periodic: Duration,
    #[serde(rename = "error", with = "humantime_duration")]
    pub error: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            paused: DEFAULT_PAUSED_REQUEUE,
            drift: DEFAULT_DRIFT_REQUEUE,
            poll: DEFAULT_POLL_REQUEUE,
            periodic: DEFAULT_PERIODIC_REQUEUE,
            error: DEFAULT_ERROR_REQUEUE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefaultsConfig {
    #[serde(rename = "network")]
    pub network: String,
    #[serde(rename = "storage-pool")]
    pub storage_pool: String,
    #[serde(rename = "backing-image-format")]
    pub backing_image_format: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            storage_pool: DEFAULT_STORAGE_POOL.to_string(),
            backing_image_format: DEFAULT_BACKING_IMAGE_FORMAT.to_string(),
        }
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(D::Error::custom)
    }
}

fn resolve_config_path(path_override: Option<PathBuf>) -> Result<Option<PathBuf>> {
    let config_path =
        path_override.or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

    if let Some(path) = config_path {
        if !path.exists() {
            bail!("config file {} does not exist", path.display());
        }
        return Ok(Some(path));
    }

    let cwd = std::env::current_dir()?;

    let path = cwd.join("provisioner.toml");
    if path.exists() {
        return Ok(Some(path));
    }

    if let Some(project_dirs) = directories::ProjectDirs::from("io", "libvirt", "provisioner") {
        let path = project_dirs.config_dir().join("config.toml");
        if path.exists() {
            return Ok(Some(path));
        }
    }

    let path = PathBuf::from("/etc/provisioner/config.toml");
    if path.exists() {
        return Ok(Some(path));
    }

    Ok(None)
}

impl Config {
    pub async fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = resolve_config_path(path_override)? else {
            warn!("No config file found, using built-in defaults");
            return Ok(Self::default());
        };

        let config_str = read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file {}", config_path.display()))?;

        let mut config = Self::parse(&config_str)
            .with_context(|| format!("failed to parse config file {}", config_path.display()))?;
        config.config_path = Some(config_path);

        Ok(config)
    }

    pub fn parse(config_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(config_str)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.requeue.periodic, Duration::from_secs(300));
        assert_eq!(config.requeue.poll, Duration::from_secs(10));
        assert_eq!(config.defaults.storage_pool, "default");
    }

    #[test]
    fn test_partial_config() {
        let config = Config::parse(
            r#"
            [requeue]
            periodic = "10m"
            poll = "2s"

            [defaults]
            storage-pool = "k8s"
            "#,
        )
        .unwrap();

        assert_eq!(config.requeue.periodic, Duration::from_secs(600));
        assert_eq!(config.requeue.poll, Duration::from_secs(2));
        assert_eq!(config.requeue.drift, DEFAULT_DRIFT_REQUEUE);
        assert_eq!(config.defaults.storage_pool, "k8s");
        assert_eq!(config.defaults.network, "default");
    }

    #[test]
    fn test_invalid_duration() {
        assert!(Config::parse("[requeue]\npoll = \"soon\"\n").is_err());
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[defaults]\nnetwork = \"k8s\"\n").unwrap();

        let config = Config::load(Some(path.clone())).await.unwrap();
        assert_eq!(config.defaults.network, "k8s");
        assert_eq!(config.config_path, Some(path));
    }

    #[tokio::test]
    async fn test_load_missing_override() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let result = Config::load(Some(dir.path().join("nope.toml"))).await;
        assert!(result.is_err());
    }
}
