//! Upsert Bridge Configuration
//!
//! Handles parsing and management of upsert-bridge.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::ffi::UpsertOptions;
use crate::upsert::SlotKeys;

/// File name searched for by [`BridgeConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "upsert-bridge.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching upsert-bridge.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    /// Configuration key naming
    #[serde(default)]
    pub slots: SlotsConfig,

    /// Argument boxing policy
    #[serde(default)]
    pub arguments: ArgumentsConfig,

    /// Size array layouts for registered callbacks
    #[serde(default)]
    pub layout: UpsertOptions,
}

impl BridgeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.display().to_string()),
            _ => ConfigError::Io(e),
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        Self::find_and_load(&std::env::current_dir()?)
    }

    /// Use the nearest `upsert-bridge.toml` at or above `start_dir`.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let nearest = start_dir
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|path| path.is_file());

        match nearest {
            Some(path) => Self::load(&path),
            // Nothing up to the filesystem root: built-in defaults
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Layouts new registrations are created with.
    pub fn upsert_options(&self) -> UpsertOptions {
        self.layout
    }

    /// Configuration keys for the store `name` under the configured scope.
    pub fn slot_keys(&self, name: &str) -> SlotKeys {
        SlotKeys::new(&self.slots.scope, name)
    }
}

/// Configuration key naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotsConfig {
    /// Leading component of `<scope>.<name>.upsert`
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "db".to_string()
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
        }
    }
}

/// Argument boxing policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentsConfig {
    /// Reject unsupported argument kinds instead of skipping them
    #[serde(default)]
    pub strict: bool,
}
