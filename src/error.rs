use thiserror::Error;

use crate::hypervisor::HypervisorError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The hypervisor endpoint could not be resolved from the environment.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("VM name '{name}' is too long ({length} characters); must be {max} characters or less")]
    InvalidName {
        name: String,
        length: usize,
        max: usize,
    },

    #[error("failed to connect to libvirt: {0}")]
    Connection(String),

    #[error("{context}: {source}")]
    Hypervisor {
        context: String,
        #[source]
        source: HypervisorError,
    },

    #[error("failed to create virtual machine '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("storage volume '{volume}' content does not match uploaded data ({expected} bytes uploaded, {actual} bytes read back)")]
    UploadVerification {
        volume: String,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported bootstrap data format: {0}")]
    UnsupportedFormat(String),

    #[error("bootstrap data secret '{0}' is missing the 'value' key")]
    MissingBootstrapValue(String),

    #[error("VM '{0}' is not running")]
    NotRunning(String),

    #[error("failed to build cloud-init image: {0}")]
    CloudInit(String),
}

impl Error {
    pub(crate) fn hypervisor(context: impl Into<String>, source: HypervisorError) -> Self {
        Self::Hypervisor {
            context: context.into(),
            source,
        }
    }

    /// Unwraps `Create` so callers can match on the step that actually failed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Create { source, .. } => source.root(),
            other => other,
        }
    }
}
