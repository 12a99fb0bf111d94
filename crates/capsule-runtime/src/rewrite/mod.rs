//! Instruction-level rewriter
//!
//! Every unit a task can execute passes through here exactly once per
//! policy and plugin set. The pipeline is:
//! 1. **Decode + validate**: submitted code may not contain instrumentation
//! 2. **Plugin pre-rewrite** hooks, in order
//! 3. **Finalizer removal**
//! 4. **Instrumentation**: see [`instrument`]
//! 5. **Plugin post-rewrite** hooks, in order
//! 6. **Validate + encode**
//!
//! The output depends only on the input bytes, the policy, the plugin ids
//! and the [`RewriteContext`], so it can be cached by
//! `(name, fingerprint, context)`.

pub mod instrument;

use crate::bytecode::disasm::disassemble;
use crate::bytecode::validator::{self, ValidationError};
use crate::bytecode::{Constant, DecodeError, Unit, UnitFormatError};
use crate::plugin::{Plugin, PluginError};
use crate::security::policy::{hex_digest, PermissionPolicy};
use std::sync::Arc;
use thiserror::Error;

/// Where the rewritten unit will run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewriteContext {
    /// Code submitted by the caller
    Untrusted,
    /// Host code duplicated into a task
    Reloaded,
}

/// Rewriting failure
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error(transparent)]
    Format(#[from] UnitFormatError),

    #[error("unit '{unit}' is invalid: {}", .errors.first().map(|e| e.to_string()).unwrap_or_default())]
    Invalid {
        unit: String,
        errors: Vec<ValidationError>,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("unit '{unit}': {source}")]
    Decode { unit: String, source: DecodeError },

    #[error("unit '{unit}': constant pool is full")]
    ConstantPoolFull { unit: String },
}

/// What instrumentation did to one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub finalizers_removed: usize,
    pub handlers_validated: usize,
    pub handlers_dropped: usize,
    pub handlers_narrowed: usize,
    pub traps_inserted: usize,
    pub monitors_redirected: usize,
    pub synchronized_methods: usize,
}

impl RewriteStats {
    pub fn merge(&mut self, other: &RewriteStats) {
        self.finalizers_removed += other.finalizers_removed;
        self.handlers_validated += other.handlers_validated;
        self.handlers_dropped += other.handlers_dropped;
        self.handlers_narrowed += other.handlers_narrowed;
        self.traps_inserted += other.traps_inserted;
        self.monitors_redirected += other.monitors_redirected;
        self.synchronized_methods += other.synchronized_methods;
    }
}

/// Rewriter bound to one policy and one ordered plugin list
pub struct Rewriter {
    policy: Arc<PermissionPolicy>,
    plugins: Vec<Arc<dyn Plugin>>,
    fingerprint: String,
}

impl Rewriter {
    pub fn new(policy: Arc<PermissionPolicy>, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let mut material = policy.fingerprint().into_bytes();
        for plugin in &plugins {
            material.push(0);
            material.extend_from_slice(plugin.id().as_bytes());
        }
        let fingerprint = hex_digest(&material);
        Self {
            policy,
            plugins,
            fingerprint,
        }
    }

    /// Identity of the policy and plugin ids, for cache keys
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn policy(&self) -> &Arc<PermissionPolicy> {
        &self.policy
    }

    /// Some plugin needs reloaded units rewritten for every task
    pub fn requires_uncached_reload(&self) -> bool {
        self.plugins.iter().any(|p| p.requires_uncached_reload())
    }

    /// Rewrite encoded unit bytes
    pub fn rewrite(&self, bytes: &[u8], context: RewriteContext) -> Result<Vec<u8>, RewriteError> {
        let unit = Unit::from_bytes(bytes)?;
        Ok(self.rewrite_unit(unit, context)?.0.to_bytes()?)
    }

    /// Rewrite a decoded unit
    pub fn rewrite_unit(
        &self,
        mut unit: Unit,
        context: RewriteContext,
    ) -> Result<(Unit, RewriteStats), RewriteError> {
        check(&unit, false)?;

        for plugin in &self.plugins {
            plugin.pre_rewrite(&mut unit, context)?;
        }

        let mut stats = RewriteStats::default();
        let before = unit.methods.len();
        unit.methods.retain(|m| !m.is_finalizer());
        stats.finalizers_removed = before - unit.methods.len();

        let self_ref = if unit.methods.iter().any(|m| m.is_synchronized()) {
            let index = unit
                .add_constant(Constant::Str(unit.name.clone()))
                .ok_or_else(|| RewriteError::ConstantPoolFull {
                    unit: unit.name.clone(),
                })?;
            Some(index)
        } else {
            None
        };

        let name = unit.name.clone();
        let mut methods = std::mem::take(&mut unit.methods);
        for method in &mut methods {
            let method_stats =
                instrument::instrument_method(&unit, method, &self.policy, context, self_ref)
                    .map_err(|source| RewriteError::Decode {
                        unit: name.clone(),
                        source,
                    })?;
            stats.merge(&method_stats);
        }
        unit.methods = methods;

        for plugin in &self.plugins {
            plugin.post_rewrite(&mut unit, context)?;
        }

        check(&unit, true)?;
        tracing::debug!(
            unit = %unit.name,
            ?context,
            handlers_validated = stats.handlers_validated,
            traps = stats.traps_inserted,
            "unit rewritten"
        );
        tracing::trace!(unit = %unit.name, listing = %disassemble(&unit), "rewritten listing");
        Ok((unit, stats))
    }
}

fn check(unit: &Unit, allow_instrumentation: bool) -> Result<(), RewriteError> {
    validator::validate(unit, allow_instrumentation).map_err(|errors| RewriteError::Invalid {
        unit: unit.name.clone(),
        errors,
    })
}
