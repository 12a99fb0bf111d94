//! Plugin extension points
//!
//! A plugin takes part in rewriting, may expose a native unit under the
//! `plugin.` namespace, and keeps per-task working data that the engine
//! hands back at finish time. Plugins run in the order they are listed in
//! [`ExecutionParams`](crate::params::ExecutionParams).

use crate::bytecode::Unit;
use crate::natives::NativeUnit;
use crate::rewrite::RewriteContext;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Namespace every plugin native unit must live under
pub const PLUGIN_NATIVE_PREFIX: &str = "plugin.";

/// Plugin errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("plugin '{0}' is already registered")]
    Duplicate(String),

    #[error("plugin '{plugin}' native unit '{unit}' must be named under 'plugin.'")]
    NativeNamespace { plugin: String, unit: String },

    #[error("plugin '{plugin}' rejected unit '{unit}': {reason}")]
    Rewrite {
        plugin: String,
        unit: String,
        reason: String,
    },

    #[error("plugin '{plugin}' rejected its arguments: {reason}")]
    InvalidArgs { plugin: String, reason: String },
}

/// Summary handed to [`Plugin::on_finish`]
#[derive(Debug, Clone, PartialEq)]
pub struct FinishInfo {
    pub task: u64,
    pub timed_out: bool,
    pub killed: bool,
    /// Kind of the fault the entry point threw, if any
    pub threw: Option<String>,
    pub execution: Duration,
    pub cpu_time: Duration,
}

/// Working data of one plugin for one task
pub type PluginData = Box<dyn Any + Send>;

/// Finalized plugin output attached to a [`TaskResult`](crate::result::TaskResult)
pub type PluginOutput = Box<dyn Any + Send + Sync>;

pub trait Plugin: Send + Sync {
    /// Unique identifier
    fn id(&self) -> &str;

    /// Runs on every unit before the engine instruments it
    fn pre_rewrite(&self, _unit: &mut Unit, _context: RewriteContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Runs on every unit after the engine instruments it
    fn post_rewrite(&self, _unit: &mut Unit, _context: RewriteContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Isolated units must be rewritten afresh for every task
    fn requires_uncached_reload(&self) -> bool {
        false
    }

    /// Native unit this plugin exposes to task code
    fn natives(&self) -> Option<NativeUnit> {
        None
    }

    /// Create the per-task working data from the plugin's arguments
    fn create_data(&self, args: &serde_json::Value) -> Result<PluginData, PluginError>;

    /// Observe the finished task; called before [`Plugin::finalize`]
    fn on_finish(&self, _data: &mut (dyn Any + Send), _info: &FinishInfo) {}

    /// Turn working data into the value exposed on the result
    fn finalize(&self, data: PluginData) -> PluginOutput;
}

/// A plugin together with the arguments for one execution
#[derive(Clone)]
pub struct PluginSpec {
    pub plugin: Arc<dyn Plugin>,
    pub args: serde_json::Value,
}

impl PluginSpec {
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            plugin,
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn id(&self) -> &str {
        self.plugin.id()
    }
}

impl fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSpec")
            .field("id", &self.plugin.id())
            .field("args", &self.args)
            .finish()
    }
}

/// Plugins available by id, for config-driven parameters
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let id = plugin.id().to_string();
        if let Some(natives) = plugin.natives() {
            check_native_namespace(&id, natives.name())?;
        }
        if self.plugins.contains_key(&id) {
            return Err(PluginError::Duplicate(id));
        }
        self.plugins.insert(id, plugin);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

pub(crate) fn check_native_namespace(plugin: &str, unit: &str) -> Result<(), PluginError> {
    match unit.strip_prefix(PLUGIN_NATIVE_PREFIX) {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => Err(PluginError::NativeNamespace {
            plugin: plugin.to_string(),
            unit: unit.to_string(),
        }),
    }
}
