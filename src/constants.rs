use std::time::Duration;

/// libvirt uses the domain name as the guest hostname, so it has to fit in a DNS label.
pub const MAX_MACHINE_NAME_LEN: usize = 63;

pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_STORAGE_POOL: &str = "default";
pub const DEFAULT_BACKING_IMAGE_FORMAT: &str = "qcow2";

pub const LIBVIRT_URI_ENV: &str = "LIBVIRT_URI";
pub const LIBVIRT_DEFAULT_URI_ENV: &str = "LIBVIRT_DEFAULT_URI";

pub const PROVIDER_ID_PREFIX: &str = "libvirt:///";

pub const CLOUD_INIT_VOLUME_LABEL: &str = "cidata";
pub const CLOUD_INIT_USER_DATA_FILE: &str = "user-data";
pub const CLOUD_INIT_META_DATA_FILE: &str = "meta-data";

pub const BOOTSTRAP_VALUE_KEY: &str = "value";
pub const BOOTSTRAP_FORMAT_KEY: &str = "format";
pub const BOOTSTRAP_FORMAT_CLOUD_CONFIG: &str = "cloud-config";

pub const DEFAULT_PAUSED_REQUEUE: Duration = Duration::from_secs(30);
pub const DEFAULT_DRIFT_REQUEUE: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_REQUEUE: Duration = Duration::from_secs(10);
pub const DEFAULT_PERIODIC_REQUEUE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(30);
