//! Execution parameters
//!
//! Everything that shapes one execution besides the code itself. Built in
//! code or from a `capsule.toml` via [`ExecutionParams::from_config`], and
//! validated before any confinement starts.

use crate::plugin::{PluginRegistry, PluginSpec};
use crate::security::policy::{PermissionPolicy, PolicyError};
use crate::value::Value;
use capsule_config::Config;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_WALL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 10_000;
pub const DEFAULT_TERMINATION_RETRIES: u32 = 10;
pub const DEFAULT_TERMINATION_DELAY: Duration = Duration::from_millis(20);

/// Invalid execution parameters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamsError {
    #[error("wall timeout must be greater than zero")]
    ZeroWallTimeout,

    #[error("cpu timeout {cpu:?} must be less than the wall timeout {wall:?}")]
    CpuNotBelowWall { cpu: Duration, wall: Duration },

    #[error("a cpu timeout requires a non-zero poll interval")]
    CpuWithoutPoll,

    #[error("plugin '{0}' listed more than once")]
    DuplicatePlugin(String),

    #[error("plugin '{0}' is not registered")]
    UnknownPlugin(String),

    #[error("termination retries must be greater than zero")]
    ZeroRetries,

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Bounded escalation used to stop a task's threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for Termination {
    fn default() -> Self {
        Self {
            retries: DEFAULT_TERMINATION_RETRIES,
            retry_delay: DEFAULT_TERMINATION_DELAY,
        }
    }
}

#[derive(Clone)]
pub struct ExecutionParams {
    pub wall_timeout: Duration,
    /// CPU budget across all of the task's threads; `None` for unbounded
    pub cpu_timeout: Option<Duration>,
    /// Longest the supervisor blocks between deadline checks; zero waits
    /// for the wall deadline directly
    pub poll_interval: Duration,
    pub max_extra_threads: usize,
    pub max_output_lines: usize,
    pub max_io_bytes: Option<usize>,
    pub policy: Arc<PermissionPolicy>,
    /// Let the task's remaining threads finish (within the wall time)
    /// before forcing termination
    pub wait_for_shutdown: bool,
    /// How long to wait for a late result after a timeout
    pub return_grace: Duration,
    pub input: Option<String>,
    pub plugins: Vec<PluginSpec>,
    pub termination: Termination,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            wall_timeout: DEFAULT_WALL_TIMEOUT,
            cpu_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_extra_threads: 0,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            max_io_bytes: None,
            policy: Arc::new(PermissionPolicy::default()),
            wait_for_shutdown: false,
            return_grace: Duration::ZERO,
            input: None,
            plugins: Vec::new(),
            termination: Termination::default(),
        }
    }
}

impl fmt::Debug for ExecutionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionParams")
            .field("wall_timeout", &self.wall_timeout)
            .field("cpu_timeout", &self.cpu_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_extra_threads", &self.max_extra_threads)
            .field("max_output_lines", &self.max_output_lines)
            .field("max_io_bytes", &self.max_io_bytes)
            .field("policy", &self.policy.mode())
            .field("wait_for_shutdown", &self.wait_for_shutdown)
            .field("return_grace", &self.return_grace)
            .field("plugins", &self.plugins)
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}

impl ExecutionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wall_timeout(mut self, timeout: Duration) -> Self {
        self.wall_timeout = timeout;
        self
    }

    pub fn with_cpu_timeout(mut self, timeout: Duration) -> Self {
        self.cpu_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_extra_threads(mut self, max: usize) -> Self {
        self.max_extra_threads = max;
        self
    }

    pub fn with_max_output_lines(mut self, max: usize) -> Self {
        self.max_output_lines = max;
        self
    }

    pub fn with_max_io_bytes(mut self, max: usize) -> Self {
        self.max_io_bytes = Some(max);
        self
    }

    pub fn with_policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_wait_for_shutdown(mut self, wait: bool) -> Self {
        self.wait_for_shutdown = wait;
        self
    }

    pub fn with_return_grace(mut self, grace: Duration) -> Self {
        self.return_grace = grace;
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_plugin(mut self, plugin: PluginSpec) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_termination(mut self, retries: u32, retry_delay: Duration) -> Self {
        self.termination = Termination {
            retries,
            retry_delay,
        };
        self
    }

    /// Effective CPU budget; zero means none
    pub fn cpu_budget(&self) -> Option<Duration> {
        self.cpu_timeout.filter(|cpu| !cpu.is_zero())
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.wall_timeout.is_zero() {
            return Err(ParamsError::ZeroWallTimeout);
        }
        if let Some(cpu) = self.cpu_budget() {
            if cpu >= self.wall_timeout {
                return Err(ParamsError::CpuNotBelowWall {
                    cpu,
                    wall: self.wall_timeout,
                });
            }
            if self.poll_interval.is_zero() {
                return Err(ParamsError::CpuWithoutPoll);
            }
        }
        if self.termination.retries == 0 {
            return Err(ParamsError::ZeroRetries);
        }

        let mut seen = HashSet::new();
        for spec in &self.plugins {
            if !seen.insert(spec.id()) {
                return Err(ParamsError::DuplicatePlugin(spec.id().to_string()));
            }
        }
        Ok(())
    }

    /// Build parameters from a loaded configuration
    ///
    /// Plugins named in the configuration are looked up in `registry`.
    /// Unset values keep their defaults.
    pub fn from_config(config: &Config, registry: &PluginRegistry) -> Result<Self, ParamsError> {
        let limits = config.effective_limits();
        let termination = config.effective_termination();
        let defaults = Self::default();

        let policy = match &config.task.policy {
            Some(policy) => PermissionPolicy::from_config(policy)?,
            None => PermissionPolicy::default(),
        };

        let plugins = config
            .task
            .plugins
            .iter()
            .map(|plugin| {
                registry
                    .get(&plugin.id)
                    .map(|p| PluginSpec::new(p).with_args(plugin.args_json()))
                    .ok_or_else(|| ParamsError::UnknownPlugin(plugin.id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let params = Self {
            wall_timeout: limits
                .wall_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.wall_timeout),
            cpu_timeout: limits.cpu_timeout_ns.map(Duration::from_nanos),
            poll_interval: limits
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            max_extra_threads: limits.max_extra_threads.unwrap_or(defaults.max_extra_threads),
            max_output_lines: limits.max_output_lines.unwrap_or(defaults.max_output_lines),
            max_io_bytes: limits.max_io_bytes,
            policy: Arc::new(policy),
            wait_for_shutdown: limits.wait_for_shutdown.unwrap_or(false),
            return_grace: limits
                .return_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.return_grace),
            input: None,
            plugins,
            termination: Termination {
                retries: termination.retries.unwrap_or(DEFAULT_TERMINATION_RETRIES),
                retry_delay: termination
                    .retry_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_TERMINATION_DELAY),
            },
        };
        params.validate()?;
        Ok(params)
    }
}

/// The method a task starts in
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub unit: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl Entry {
    pub fn new(unit: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            method: method.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.unit, self.method)
    }
}
