use std::path::{Path, PathBuf};

use crate::app_dirs;
use crate::fs_ops::write_atomic;

use super::{CONFIG_FILE_NAME, ConfigError, RefeedConfig};

/// Resolve the configuration file path inside the app root.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let dir = app_dirs::app_root_dir().map_err(map_app_dir_error)?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Load configuration from the app root, returning defaults if missing.
pub fn load_or_default() -> Result<RefeedConfig, ConfigError> {
    let path = config_path()?;
    let mut config = load_from(&path)?;
    if config.data_dir.is_none() {
        let root = path.parent().map(Path::to_path_buf).ok_or(ConfigError::NoConfigDir)?;
        config.data_dir = Some(root);
    }
    Ok(config)
}

/// Load configuration from an explicit path; a missing file yields defaults.
pub fn load_from(path: &Path) -> Result<RefeedConfig, ConfigError> {
    if !path.exists() {
        return Ok(RefeedConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: RefeedConfig = toml::from_str(&text).map_err(|source| ConfigError::ParseToml {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(config.normalized())
}

/// Persist configuration to the app root, overwriting previous contents.
pub fn save(config: &RefeedConfig) -> Result<(), ConfigError> {
    save_to_path(config, &config_path()?)
}

/// Write the TOML config atomically to prevent partial writes on crash.
pub fn save_to_path(config: &RefeedConfig, path: &Path) -> Result<(), ConfigError> {
    let data = toml::to_string_pretty(config).map_err(|source| ConfigError::SerializeToml {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, data.as_bytes()).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn map_app_dir_error(error: app_dirs::AppDirError) -> ConfigError {
    match error {
        app_dirs::AppDirError::NoBaseDir => ConfigError::NoConfigDir,
        app_dirs::AppDirError::CreateDir { path, source } => {
            ConfigError::CreateDir { path, source }
        }
    }
}
