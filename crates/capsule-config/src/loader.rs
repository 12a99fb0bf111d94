//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::global::GlobalConfig;
use crate::task::{LimitsConfig, TaskConfig, TerminationConfig};
use crate::{ConfigError, ConfigResult, TASK_CONFIG_FILE};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.capsule/config.toml) - lowest priority
/// 2. Task config (./capsule.toml) - overrides global
/// 3. Environment variables (CAPSULE_*) - overrides task config
/// 4. Explicit parameters - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone)]
pub struct Config {
    /// Task configuration
    pub task: TaskConfig,

    /// Global configuration
    pub global: GlobalConfig,

    /// Directory where capsule.toml was found
    pub config_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader reading global defaults from an explicit path
    pub fn with_global_path(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find capsule.toml, then loads and merges
    /// global config if it exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (config_root, task_config) = self.find_task_config(start_dir)?;

        // Global config is optional and never fatal when the home directory is unknown
        let global_config = match self.load_global_config() {
            Ok(config) => config,
            Err(ConfigError::HomeNotFound) => GlobalConfig::default(),
            Err(e) => return Err(e),
        };

        let task_config = self.apply_env_overrides(task_config)?;
        task_config.validate()?;

        Ok(Config {
            task: task_config,
            global: global_config,
            config_root,
        })
    }

    /// Load configuration from a specific task config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let task_config = TaskConfig::load_from_file(config_path)?;
        let global_config = match self.load_global_config() {
            Ok(config) => config,
            Err(ConfigError::HomeNotFound) => GlobalConfig::default(),
            Err(e) => return Err(e),
        };

        let task_config = self.apply_env_overrides(task_config)?;
        task_config.validate()?;

        Ok(Config {
            task: task_config,
            global: global_config,
            config_root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    /// Find task configuration by walking up directory tree
    fn find_task_config(&self, start_dir: &Path) -> ConfigResult<(Option<PathBuf>, TaskConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(TASK_CONFIG_FILE);

            if config_path.exists() {
                let task_config = TaskConfig::load_from_file(&config_path)?;
                return Ok((Some(current), task_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, TaskConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.capsule/config.toml
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => {
                let path = GlobalConfig::global_config_path()?;
                self.global_config_path = Some(path.clone());
                path
            }
        };

        if !path.exists() {
            return Ok(GlobalConfig::default());
        }

        GlobalConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides to task config
    ///
    /// Environment variables follow the pattern: CAPSULE_<KEY>
    /// Example: CAPSULE_WALL_TIMEOUT_MS=250
    fn apply_env_overrides(&self, mut config: TaskConfig) -> ConfigResult<TaskConfig> {
        let limits = config.limits.get_or_insert_with(LimitsConfig::default);

        if let Some(value) = env_number("CAPSULE_WALL_TIMEOUT_MS")? {
            limits.wall_timeout_ms = Some(value);
        }
        if let Some(value) = env_number("CAPSULE_CPU_TIMEOUT_NS")? {
            limits.cpu_timeout_ns = Some(value);
        }
        if let Some(value) = env_number("CAPSULE_POLL_INTERVAL_MS")? {
            limits.poll_interval_ms = Some(value);
        }
        if let Some(value) = env_number("CAPSULE_MAX_OUTPUT_LINES")? {
            limits.max_output_lines = Some(value as usize);
        }
        if let Some(value) = env_number("CAPSULE_MAX_EXTRA_THREADS")? {
            limits.max_extra_threads = Some(value as usize);
        }
        if let Ok(wait) = env::var("CAPSULE_WAIT_FOR_SHUTDOWN") {
            limits.wait_for_shutdown =
                Some(matches!(wait.to_lowercase().as_str(), "true" | "1" | "yes"));
        }

        if *limits == LimitsConfig::default() {
            config.limits = None;
        }

        Ok(config)
    }

    /// Get the global configuration directory (~/.capsule)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".capsule"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_number(key: &str) -> ConfigResult<Option<u64>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                reason: format!("expected an unsigned integer, got '{}'", raw),
            }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Effective limits (task > global defaults)
    pub fn effective_limits(&self) -> LimitsConfig {
        let mut limits = self.global.defaults.clone().unwrap_or_default();
        if let Some(task) = &self.task.limits {
            limits.merge(task);
        }
        limits
    }

    /// Effective termination protocol (task > global)
    pub fn effective_termination(&self) -> TerminationConfig {
        let global = self.global.termination.clone().unwrap_or_default();
        match &self.task.termination {
            Some(task) => TerminationConfig {
                retries: task.retries.or(global.retries),
                retry_delay_ms: task.retry_delay_ms.or(global.retry_delay_ms),
            },
            None => global,
        }
    }

    /// Get the directory holding capsule.toml
    pub fn config_root(&self) -> Option<&Path> {
        self.config_root.as_deref()
    }

    /// Check if a capsule.toml was found
    pub fn has_task_file(&self) -> bool {
        self.config_root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(TASK_CONFIG_FILE);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    fn isolated_loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::with_global_path(dir.join("no-global.toml"))
    }

    #[test]
    #[serial]
    fn test_load_task_config() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[limits]
wall_timeout_ms = 750
"#,
        );

        let mut loader = isolated_loader(temp_dir.path());
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(config.effective_limits().wall_timeout_ms, Some(750));
        assert!(config.has_task_file());
    }

    #[test]
    #[serial]
    fn test_find_config_in_parent() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[limits]
max_output_lines = 3
"#,
        );

        let sub_dir = temp_dir.path().join("subdir");
        fs::create_dir(&sub_dir).unwrap();

        let mut loader = isolated_loader(temp_dir.path());
        let config = loader.load_from_directory(&sub_dir).unwrap();

        assert_eq!(config.effective_limits().max_output_lines, Some(3));
        assert_eq!(config.config_root(), Some(temp_dir.path()));
    }

    #[test]
    #[serial]
    fn test_no_task_config() {
        let temp_dir = TempDir::new().unwrap();

        let mut loader = isolated_loader(temp_dir.path());
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        assert!(config.task.limits.is_none());
        assert!(!config.has_task_file());
    }

    #[test]
    #[serial]
    fn test_env_override_wall_timeout() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[limits]
wall_timeout_ms = 1000
"#,
        );

        env::set_var("CAPSULE_WALL_TIMEOUT_MS", "125");

        let mut loader = isolated_loader(temp_dir.path());
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        env::remove_var("CAPSULE_WALL_TIMEOUT_MS");

        assert_eq!(config.effective_limits().wall_timeout_ms, Some(125));
    }

    #[test]
    #[serial]
    fn test_env_override_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();

        env::set_var("CAPSULE_POLL_INTERVAL_MS", "soon");

        let mut loader = isolated_loader(temp_dir.path());
        let result = loader.load_from_directory(temp_dir.path());

        env::remove_var("CAPSULE_POLL_INTERVAL_MS");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    #[serial]
    fn test_global_defaults_under_task_limits() {
        let temp_dir = TempDir::new().unwrap();
        let global_path = temp_dir.path().join("global.toml");
        fs::write(
            &global_path,
            r#"
[defaults]
wall_timeout_ms = 5000
max_output_lines = 40

[termination]
retries = 7
"#,
        )
        .unwrap();
        let config_path = create_config_file(
            temp_dir.path(),
            r#"
[limits]
wall_timeout_ms = 200

[termination]
retry_delay_ms = 5
"#,
        );

        let mut loader = ConfigLoader::with_global_path(global_path);
        let config = loader.load_from_file(&config_path).unwrap();

        let limits = config.effective_limits();
        assert_eq!(limits.wall_timeout_ms, Some(200));
        assert_eq!(limits.max_output_lines, Some(40));

        let termination = config.effective_termination();
        assert_eq!(termination.retries, Some(7));
        assert_eq!(termination.retry_delay_ms, Some(5));
    }
}
