use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::StoreError;

pub const APP_QUALIFIER: &str = "net";
pub const APP_ORG: &str = "sprintmate";
pub const APP_NAME: &str = "sprintmate";

pub const PIN_FILE_NAME: &str = "relay-pins.json";

pub fn data_dir() -> Result<PathBuf, StoreError> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or(StoreError::NoDataDir)?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn default_pin_file() -> Result<PathBuf, StoreError> {
    Ok(data_dir()?.join(PIN_FILE_NAME))
}
