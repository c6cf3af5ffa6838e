pub mod iso;

use tracing::debug;

use crate::{
    cloudinit::iso::IsoImage,
    constants::{CLOUD_INIT_META_DATA_FILE, CLOUD_INIT_USER_DATA_FILE, CLOUD_INIT_VOLUME_LABEL},
    error::{Error, Result},
};

pub fn meta_data(name: &str) -> String {
    format!("instance-id: {}\nlocal-hostname: {}\n", name, name)
}

/// Builds the NoCloud seed image for a machine.
///
/// `user_data` is written as-is and must already be cloud-config. The same
/// name and user-data always produce the same bytes.
pub fn build_image(name: &str, user_data: &str) -> Result<Vec<u8>> {
    debug!("building cloud-init image for {}", name);

    let image = IsoImage::new(CLOUD_INIT_VOLUME_LABEL)
        .add_file(CLOUD_INIT_USER_DATA_FILE, user_data)
        .add_file(CLOUD_INIT_META_DATA_FILE, meta_data(name))
        .build()
        .map_err(|e| Error::CloudInit(e.to_string()))?;

    Ok(image)
}
