//! Application settings and port presets

use crate::core::dispatch::LineEnding;
use crate::core::driver::{PortConfig, DEFAULT_CHUNK_CAPACITY};
use crate::core::registry::DEFAULT_EVENT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Line settings used when a port is given without a preset
    pub serial: PortConfig,
    /// Dispatch settings
    pub dispatch: DispatchSettings,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Named port presets
    pub presets: Vec<PortPreset>,
}

impl AppConfig {
    /// Load config from the default location, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        self.save_to(&path)
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Find a preset by name (case-insensitive)
    pub fn preset(&self, name: &str) -> Option<&PortPreset> {
        self.presets.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Resolve a port argument: a preset name, or a raw port name using the
    /// default line settings
    pub fn port_config(&self, port_or_preset: &str) -> PortConfig {
        match self.preset(port_or_preset) {
            Some(preset) => preset.config.clone(),
            None => self.serial.for_port(port_or_preset),
        }
    }
}

/// Dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Capacity of the driver's raw chunk channel
    pub chunk_capacity: usize,
    /// Capacity of the registry event channel
    pub event_capacity: usize,
    /// Line ending appended to sent text
    pub line_ending: LineEnding,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            line_ending: LineEnding::None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Also write daily-rotated log files here
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

/// Named port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPreset {
    /// Preset name
    pub name: String,
    /// Port settings
    #[serde(flatten)]
    pub config: PortConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::SerialParity;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.dispatch.line_ending, LineEnding::None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.dispatch.line_ending = LineEnding::CrLf;
        config.presets.push(PortPreset {
            name: "gps".into(),
            config: PortConfig::new("COM7", 4800).parity(SerialParity::Even),
        });
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[serial]
baud_rate = 115200

[[presets]]
name = "modem"
port_name = "COM2"
baud_rate = 57600
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.serial.data_bits, 8);
        assert_eq!(config.dispatch, DispatchSettings::default());

        let modem = config.port_config("MODEM");
        assert_eq!(modem.port_name, "COM2");
        assert_eq!(modem.baud_rate, 57600);

        let raw = config.port_config("COM9");
        assert_eq!(raw.port_name, "COM9");
        assert_eq!(raw.baud_rate, 115200);
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "serial = 3").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
