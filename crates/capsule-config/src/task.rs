//! Task Configuration (capsule.toml)
//!
//! Handles the per-task configuration file describing execution limits,
//! the permission policy, the termination protocol and the plugin list.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Task configuration from capsule.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Execution limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsConfig>,

    /// Permission policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyConfig>,

    /// Forced termination protocol
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationConfig>,

    /// Ordered plugin list
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,
}

/// Execution limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Wall-clock budget in milliseconds (must be > 0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_timeout_ms: Option<u64>,

    /// CPU budget in nanoseconds (0 disables the CPU budget)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_timeout_ns: Option<u64>,

    /// Supervisor poll interval in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    /// Maximum threads the task may create besides its worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_extra_threads: Option<usize>,

    /// Maximum captured output lines across stdout and stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_lines: Option<usize>,

    /// Maximum captured I/O bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_io_bytes: Option<usize>,

    /// Wait for background threads to finish before forced termination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_shutdown: Option<bool>,

    /// Grace period for a late return value after a timeout, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_grace_ms: Option<u64>,
}

/// Permission policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// "allow-list" or "deny-list" (default: deny-list)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Unit-name prefixes allowed (allow-list) or denied (deny-list)
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<String>,

    /// Operations allowed (allow-list) or denied (deny-list)
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<PermissionRule>,

    /// Call-target prefixes trapped before they execute (replaces the defaults)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forbidden_calls: Option<Vec<String>>,

    /// Fault kinds treated as fatal when caught (replaces the defaults)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_faults: Option<Vec<String>>,

    /// Fault kinds that may be caught even though they are fatal
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub safe_faults: Vec<String>,

    /// Unit-name prefixes reloaded per task instead of shared
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub isolated_units: Vec<String>,
}

/// A single operation rule inside a policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PermissionRule {
    /// Operation kind (file-read, file-write, network, process, env,
    /// property-read, property-write, exit)
    pub kind: String,

    /// Target pattern (path, host, command, variable or property key)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Path rules also cover everything below the path
    #[serde(default)]
    pub recursive: bool,
}

/// Forced termination protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TerminationConfig {
    /// Number of escalation rounds before containment is declared failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Join delay per round in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

/// A configured plugin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    /// Plugin id (unique among active plugins)
    pub id: String,

    /// Free-form plugin arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<toml::Value>,
}

/// Operation kinds accepted in `[[policy.permissions]]`
pub const PERMISSION_KINDS: &[&str] = &[
    "file-read",
    "file-write",
    "network",
    "process",
    "env",
    "property-read",
    "property-write",
    "exit",
];

impl TaskConfig {
    /// Load task configuration from a file
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

    /// Validate the task configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(limits) = &self.limits {
            limits.validate("limits")?;
        }

        if let Some(policy) = &self.policy {
            policy.validate()?;
        }

        if let Some(termination) = &self.termination {
            if termination.retries == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "termination.retries".to_string(),
                    reason: "at least one escalation round is required".to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "plugins.id".to_string(),
                    reason: "id cannot be empty".to_string(),
                });
            }
            if !seen.insert(plugin.id.as_str()) {
                return Err(ConfigError::DuplicatePlugin(plugin.id.clone()));
            }
        }

        Ok(())
    }
}

impl LimitsConfig {
    /// Validate limit values; `section` prefixes field names in errors
    pub fn validate(&self, section: &str) -> ConfigResult<()> {
        if self.wall_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.wall_timeout_ms", section),
                reason: "wall timeout must be greater than zero".to_string(),
            });
        }

        if let Some(cpu) = self.cpu_timeout_ns.filter(|ns| *ns > 0) {
            if self.poll_interval_ms == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.poll_interval_ms", section),
                    reason: "a CPU budget requires a non-zero poll interval".to_string(),
                });
            }
            if let Some(wall) = self.wall_timeout_ms {
                if u128::from(cpu) >= u128::from(wall) * 1_000_000 {
                    return Err(ConfigError::InvalidValue {
                        field: format!("{}.cpu_timeout_ns", section),
                        reason: "CPU budget must be less than the wall budget".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Overlay `other` on top of `self`: values set in `other` win
    pub fn merge(&mut self, other: &LimitsConfig) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            wall_timeout_ms,
            cpu_timeout_ns,
            poll_interval_ms,
            max_extra_threads,
            max_output_lines,
            max_io_bytes,
            wait_for_shutdown,
            return_grace_ms
        );
    }
}

impl PolicyConfig {
    /// Validate the policy section
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(mode) = &self.mode {
            if !matches!(mode.as_str(), "allow-list" | "deny-list") {
                return Err(ConfigError::InvalidValue {
                    field: "policy.mode".to_string(),
                    reason: format!("must be 'allow-list' or 'deny-list', got '{}'", mode),
                });
            }
        }

        for rule in &self.permissions {
            if !PERMISSION_KINDS.contains(&rule.kind.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "policy.permissions.kind".to_string(),
                    reason: format!("unknown permission kind '{}'", rule.kind),
                });
            }
            if rule.kind != "exit" && rule.pattern.is_none() {
                return Err(ConfigError::InvalidValue {
                    field: "policy.permissions.pattern".to_string(),
                    reason: format!("'{}' rules need a pattern", rule.kind),
                });
            }
        }

        let kinds = self
            .safe_faults
            .iter()
            .chain(self.fatal_faults.iter().flatten());
        for kind in kinds {
            if !is_valid_fault_kind(kind) {
                return Err(ConfigError::InvalidValue {
                    field: "policy.faults".to_string(),
                    reason: format!("'{}' is not a dotted fault kind", kind),
                });
            }
        }

        Ok(())
    }

    /// Whether the policy runs in allow-list mode
    pub fn is_allow_list(&self) -> bool {
        self.mode.as_deref() == Some("allow-list")
    }
}

impl PluginConfig {
    /// Plugin arguments as JSON (null when absent)
    pub fn args_json(&self) -> serde_json::Value {
        self.args
            .as_ref()
            .and_then(|args| serde_json::to_value(args).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// A fault kind is a non-empty dotted path of non-empty segments
fn is_valid_fault_kind(kind: &str) -> bool {
    !kind.is_empty() && kind.split('.').all(|segment| !segment.is_empty())
}
