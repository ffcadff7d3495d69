//! YAML configuration loading and saving
//!
//! Works with any serializable configuration type.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load configuration from a YAML file
///
/// A missing file yields the defaults. An unreadable or invalid file logs a
/// warning and also yields the defaults, so a broken config never keeps the
/// backup daemon from starting.
///
/// ```ignore
/// let config: AppConfig = load_config(&default_config_path());
/// ```
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No config at {:?}, using defaults", path);
            return T::default();
        }
        Err(e) => {
            log::warn!("Cannot read config {:?}: {}, using defaults", path, e);
            return T::default();
        }
    };

    serde_yaml::from_str(&contents).unwrap_or_else(|e| {
        log::warn!("Invalid config {:?}: {}, using defaults", path, e);
        T::default()
    })
}

/// Load the config at `path`, writing the defaults there if it does not exist
///
/// Gives users a complete file to edit after the first run. Failing to write
/// it is logged and the defaults are still returned.
pub fn load_or_init_config<T>(path: &Path) -> T
where
    T: Serialize + DeserializeOwned + Default,
{
    if path.exists() {
        return load_config(path);
    }

    let config = T::default();
    match save_config(&config, path) {
        Ok(()) => log::info!("Wrote default config to {:?}", path),
        Err(e) => log::warn!("Could not write default config: {:#}", e),
    }
    config
}

/// Save configuration to a YAML file, creating parent directories
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    std::fs::write(path, yaml).with_context(|| format!("Failed to write config file: {:?}", path))?;

    Ok(())
}
