//! Persistent storage
//!
//! Configuration persistence. Generation itself keeps no on-disk state.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

pub use settings::{default_config_path, load_config, load_config_or_default, save_config};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] crate::types::ConfigError),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\llamadrive\llamadrive`
/// - macOS: `/Users/{user}/Library/Application Support/dev.llamadrive.llamadrive`
/// - Linux: `/home/{user}/.local/share/llamadrive`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("dev", "llamadrive", "llamadrive")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}
