//! Global Configuration (~/.capsule/config.toml)
//!
//! Handles user-level defaults stored in `~/.capsule/config.toml`.

use crate::task::{LimitsConfig, TerminationConfig};
use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global user configuration from ~/.capsule/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Default execution limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<LimitsConfig>,

    /// Default termination protocol
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationConfig>,
}

impl GlobalConfig {
    /// Load global configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the global configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(defaults) = &self.defaults {
            defaults.validate("defaults")?;
        }
        if let Some(termination) = &self.termination {
            if termination.retries == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "termination.retries".to_string(),
                    reason: "at least one escalation round is required".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Get the global config file path (~/.capsule/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".capsule").join("config.toml"))
    }

    /// Merge another global config into this one
    /// Other config takes precedence for non-None values
    pub fn merge(&mut self, other: &GlobalConfig) {
        match (&mut self.defaults, &other.defaults) {
            (Some(mine), Some(theirs)) => mine.merge(theirs),
            (None, Some(theirs)) => self.defaults = Some(theirs.clone()),
            _ => {}
        }
        if other.termination.is_some() {
            self.termination = other.termination.clone();
        }
    }
}
