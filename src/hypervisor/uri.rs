use url::Url;

use crate::{
    constants::{LIBVIRT_DEFAULT_URI_ENV, LIBVIRT_URI_ENV},
    error::{Error, Result},
};

/// Reads the hypervisor endpoint from `LIBVIRT_URI`, then `LIBVIRT_DEFAULT_URI`.
pub fn resolve_uri() -> Result<Url> {
    resolve_uri_with(|key| std::env::var(key).ok())
}

pub fn resolve_uri_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Url> {
    let uri = [LIBVIRT_URI_ENV, LIBVIRT_DEFAULT_URI_ENV]
        .into_iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            Error::Configuration(format!(
                "{} or {} environment variable must be set in order to connect to libvirt",
                LIBVIRT_URI_ENV, LIBVIRT_DEFAULT_URI_ENV
            ))
        })?;

    Url::parse(uri.trim())
        .map_err(|e| Error::Configuration(format!("failed to parse libvirt URI '{}': {}", uri, e)))
}
