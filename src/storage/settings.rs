//! Configuration storage
//!
//! Loads and saves `GenerationConfig` as pretty-printed JSON.

use crate::storage::{get_data_dir, StorageError};
use crate::types::GenerationConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config file location inside the data directory
pub fn default_config_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("config.json"))
}

/// Load a config file, falling back to defaults when it is missing or corrupted
pub fn load_config_or_default(path: &Path) -> GenerationConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config from {}, using defaults: {}", path.display(), e);
            GenerationConfig::default()
        }
    }
}

/// Load and validate a config file
///
/// A missing file yields the default configuration.
pub fn load_config(path: &Path) -> Result<GenerationConfig, StorageError> {
    if !path.exists() {
        tracing::info!("Config file not found at {}, using defaults", path.display());
        return Ok(GenerationConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let mut config: GenerationConfig = serde_json::from_str(&json)?;
    config.validate()?;

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save a config file, creating parent directories as needed
pub fn save_config(path: &Path, config: &GenerationConfig) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to {}", path.display());
    Ok(())
}
