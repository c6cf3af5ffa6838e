use std::collections::BTreeMap;

use crate::{
    constants::{BOOTSTRAP_FORMAT_CLOUD_CONFIG, BOOTSTRAP_FORMAT_KEY, BOOTSTRAP_VALUE_KEY},
    error::{Error, Result},
};

/// Extracts the cloud-config text from a bootstrap secret's data.
///
/// `format`, when present, has to be `cloud-config`; an empty `value` is
/// returned as-is so the caller can treat it as "not there yet".
pub fn bootstrap_data(secret_name: &str, data: &BTreeMap<String, String>) -> Result<String> {
    if let Some(format) = data.get(BOOTSTRAP_FORMAT_KEY) {
        if format != BOOTSTRAP_FORMAT_CLOUD_CONFIG {
            return Err(Error::UnsupportedFormat(format.clone()));
        }
    }

    data.get(BOOTSTRAP_VALUE_KEY)
        .cloned()
        .ok_or_else(|| Error::MissingBootstrapValue(secret_name.to_string()))
}
