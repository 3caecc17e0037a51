//! Configuration module
//!
//! Handles application settings and named port presets

mod settings;

pub use settings::{AppConfig, ConfigError, DispatchSettings, LoggingConfig, PortPreset};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "comframe", "Comframe").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "comframe", "Comframe").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Default location of the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Initialize application directories
pub fn init_directories() -> std::io::Result<()> {
    if let Some(dir) = config_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    if let Some(dir) = log_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
