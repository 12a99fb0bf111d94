//! Capsule Configuration System
//!
//! Provides configuration management for confined task execution:
//! - Task configuration (capsule.toml): limits, permission policy, termination, plugins
//! - Global user configuration (~/.capsule/config.toml): default limits
//! - Configuration precedence and merging
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.capsule/config.toml)
//! 2. Task config (./capsule.toml)
//! 3. Environment variables (CAPSULE_*)
//! 4. Explicit parameters set by the embedding application
//!
//! # Example
//!
//! ```no_run
//! use capsule_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! let limits = config.effective_limits();
//! ```

pub mod global;
pub mod loader;
pub mod task;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Duplicate plugin id '{0}'")]
    DuplicatePlugin(String),

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Name of the per-task configuration file
pub const TASK_CONFIG_FILE: &str = "capsule.toml";

// Re-export main types
pub use global::GlobalConfig;
pub use loader::{Config, ConfigLoader};
pub use task::{
    LimitsConfig, PermissionRule, PluginConfig, PolicyConfig, TaskConfig, TerminationConfig,
};
