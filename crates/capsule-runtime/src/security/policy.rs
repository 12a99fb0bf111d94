//! Permission policy definition
//!
//! A [`PermissionPolicy`] is immutable once built. It answers three kinds of
//! questions: may a unit be delegated to the host, may an operation run,
//! and how must a caught fault be treated.

use crate::security::permissions::{name_has_prefix, Permission, PermissionSet};
use crate::value::{is_a, kinds, related};
use capsule_config::{PermissionRule, PolicyConfig};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;

/// Fault kinds that no policy can make catchable
pub const ALWAYS_FATAL: &[&str] = &[kinds::TERMINATED];

/// Call targets trapped unless the policy overrides the list
pub const DEFAULT_FORBIDDEN_CALLS: &[&str] = &["host.system::exit"];

/// Fault kinds treated as fatal unless the policy overrides the list
pub const DEFAULT_FATAL_FAULTS: &[&str] = &[kinds::ERROR];

/// Policy errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("allow-list and deny-list rules cannot be combined")]
    ConflictingModes,

    #[error("safe fault kind '{kind}' overlaps always-fatal kind '{fatal}'")]
    SafeOverlapsFatal { kind: String, fatal: String },

    #[error("'{0}' is not a dotted fault kind")]
    InvalidFaultKind(String),

    #[error("Invalid policy field: {field} - {reason}")]
    InvalidField { field: String, reason: String },
}

/// Whether rules enumerate what is allowed or what is denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    AllowList,
    DenyList,
}

/// How a caught fault must be treated at a handler entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchVerdict {
    /// Handler may run
    Catch,
    /// Fault must keep propagating
    Rethrow,
}

/// Immutable permission policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionPolicy {
    mode: PolicyMode,
    units: Vec<String>,
    permissions: PermissionSet,
    forbidden_calls: Vec<String>,
    fatal_faults: Vec<String>,
    safe_faults: Vec<String>,
    isolated_units: Vec<String>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::permissive()
    }
}

impl PermissionPolicy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::new()
    }

    /// Deny-list policy with no rules: everything except the default
    /// forbidden calls is permitted
    pub fn permissive() -> Self {
        Self {
            mode: PolicyMode::DenyList,
            units: Vec::new(),
            permissions: PermissionSet::new(),
            forbidden_calls: DEFAULT_FORBIDDEN_CALLS.iter().map(|s| s.to_string()).collect(),
            fatal_faults: DEFAULT_FATAL_FAULTS.iter().map(|s| s.to_string()).collect(),
            safe_faults: Vec::new(),
            isolated_units: Vec::new(),
        }
    }

    /// Allow-list policy with no rules: nothing is delegated or permitted
    pub fn restrictive() -> Self {
        Self {
            mode: PolicyMode::AllowList,
            ..Self::permissive()
        }
    }

    /// Build a policy from the `[policy]` section of a task config
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        let mut builder = if config.is_allow_list() {
            PolicyBuilder::allow_list()
        } else {
            PolicyBuilder::deny_list()
        };

        for unit in &config.units {
            builder = if config.is_allow_list() {
                builder.allow_unit(unit)
            } else {
                builder.deny_unit(unit)
            };
        }
        for rule in &config.permissions {
            let permission = permission_from_rule(rule)?;
            builder = if config.is_allow_list() {
                builder.allow(permission)
            } else {
                builder.deny(permission)
            };
        }
        if let Some(calls) = &config.forbidden_calls {
            builder = builder.forbidden_calls(calls.iter().cloned());
        }
        if let Some(fatal) = &config.fatal_faults {
            builder = builder.fatal_faults(fatal.iter().cloned());
        }
        for kind in &config.safe_faults {
            builder = builder.safe_fault(kind);
        }
        for prefix in &config.isolated_units {
            builder = builder.isolate_unit(prefix);
        }

        builder.build()
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    /// May a reference to `name` be delegated to the host?
    pub fn permits_unit(&self, name: &str) -> bool {
        let listed = self.units.iter().any(|prefix| name_has_prefix(name, prefix));
        match self.mode {
            PolicyMode::AllowList => listed,
            PolicyMode::DenyList => !listed,
        }
    }

    /// May the requested operation run?
    pub fn permits(&self, requested: &Permission) -> bool {
        match requested {
            Permission::LoadUnit { name } => self.permits_unit(name),
            Permission::ForbiddenCall { .. } => false,
            _ => match self.mode {
                PolicyMode::AllowList => self.permissions.is_granted(requested),
                PolicyMode::DenyList => !self.permissions.is_granted(requested),
            },
        }
    }

    /// Does `target` (`unit::method`) match a forbidden-call prefix?
    pub fn is_forbidden_call(&self, target: &str) -> bool {
        self.forbidden_calls.iter().any(|prefix| {
            match target.strip_prefix(prefix.as_str()) {
                Some("") => true,
                Some(rest) => {
                    prefix.ends_with(['.', ':']) || rest.starts_with('.') || rest.starts_with("::")
                }
                None => false,
            }
        })
    }

    /// Is `name` reloaded per task instead of shared with the host?
    pub fn is_isolated(&self, name: &str) -> bool {
        self.isolated_units
            .iter()
            .any(|prefix| name_has_prefix(name, prefix))
    }

    /// Must a handler catching `catch` re-examine what it caught?
    ///
    /// True when the catch kind is related to an always-fatal kind, or is
    /// related to a normally-fatal kind without descending from a safe one.
    pub fn needs_validation(&self, catch: &str) -> bool {
        if ALWAYS_FATAL.iter().any(|fatal| related(catch, fatal)) {
            return true;
        }
        if self.safe_faults.iter().any(|safe| is_a(catch, safe)) {
            return false;
        }
        self.fatal_faults.iter().any(|fatal| related(catch, fatal))
    }

    /// Decide whether a fault of `kind` may be handled
    pub fn verdict(&self, kind: &str) -> CatchVerdict {
        if ALWAYS_FATAL.iter().any(|fatal| is_a(kind, fatal)) {
            return CatchVerdict::Rethrow;
        }
        if self.safe_faults.iter().any(|safe| is_a(kind, safe)) {
            return CatchVerdict::Catch;
        }
        if self.fatal_faults.iter().any(|fatal| is_a(kind, fatal)) {
            return CatchVerdict::Rethrow;
        }
        CatchVerdict::Catch
    }

    /// Deterministic SHA-256 over the canonical JSON form
    pub fn fingerprint(&self) -> String {
        // Every field serializes from ordered collections, so the JSON is canonical
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex_digest(&canonical)
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn permission_from_rule(rule: &PermissionRule) -> Result<Permission, PolicyError> {
    let pattern = || {
        rule.pattern.clone().ok_or_else(|| PolicyError::InvalidField {
            field: "pattern".to_string(),
            reason: format!("'{}' rules need a pattern", rule.kind),
        })
    };
    Ok(match rule.kind.as_str() {
        "file-read" => Permission::FileRead {
            path: PathBuf::from(pattern()?),
            recursive: rule.recursive,
        },
        "file-write" => Permission::FileWrite {
            path: PathBuf::from(pattern()?),
            recursive: rule.recursive,
        },
        "network" => Permission::Network { host: pattern()? },
        "process" => Permission::Process { command: pattern()? },
        "env" => Permission::Environment { var: pattern()? },
        "property-read" => Permission::PropertyRead { key: pattern()? },
        "property-write" => Permission::PropertyWrite { key: pattern()? },
        "exit" => Permission::Exit,
        other => {
            return Err(PolicyError::InvalidField {
                field: "kind".to_string(),
                reason: format!("unknown permission kind '{}'", other),
            })
        }
    })
}

/// Builder for [`PermissionPolicy`]
///
/// The mode follows from the rules added unless fixed up front with
/// [`PolicyBuilder::allow_list`] or [`PolicyBuilder::deny_list`]; adding
/// rules of both kinds is a [`PolicyError::ConflictingModes`].
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    mode: Option<PolicyMode>,
    allow_units: Vec<String>,
    deny_units: Vec<String>,
    allow: PermissionSet,
    deny: PermissionSet,
    forbidden_calls: Option<Vec<String>>,
    fatal_faults: Option<Vec<String>>,
    safe_faults: Vec<String>,
    isolated_units: Vec<String>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_list() -> Self {
        Self {
            mode: Some(PolicyMode::AllowList),
            ..Self::default()
        }
    }

    pub fn deny_list() -> Self {
        Self {
            mode: Some(PolicyMode::DenyList),
            ..Self::default()
        }
    }

    pub fn allow_unit(mut self, prefix: impl Into<String>) -> Self {
        self.allow_units.push(prefix.into());
        self
    }

    pub fn deny_unit(mut self, prefix: impl Into<String>) -> Self {
        self.deny_units.push(prefix.into());
        self
    }

    pub fn allow(mut self, permission: Permission) -> Self {
        self.allow.grant(permission);
        self
    }

    pub fn deny(mut self, permission: Permission) -> Self {
        self.deny.grant(permission);
        self
    }

    /// Add a forbidden-call prefix to the current list (defaults included)
    pub fn forbid_call(mut self, prefix: impl Into<String>) -> Self {
        self.forbidden_calls
            .get_or_insert_with(|| DEFAULT_FORBIDDEN_CALLS.iter().map(|s| s.to_string()).collect())
            .push(prefix.into());
        self
    }

    /// Replace the forbidden-call list
    pub fn forbidden_calls(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.forbidden_calls = Some(prefixes.into_iter().collect());
        self
    }

    /// Add a normally-fatal fault kind (defaults included)
    pub fn fatal_fault(mut self, kind: impl Into<String>) -> Self {
        self.fatal_faults
            .get_or_insert_with(|| DEFAULT_FATAL_FAULTS.iter().map(|s| s.to_string()).collect())
            .push(kind.into());
        self
    }

    /// Replace the normally-fatal fault list
    pub fn fatal_faults(mut self, kinds: impl IntoIterator<Item = String>) -> Self {
        self.fatal_faults = Some(kinds.into_iter().collect());
        self
    }

    pub fn safe_fault(mut self, kind: impl Into<String>) -> Self {
        self.safe_faults.push(kind.into());
        self
    }

    pub fn isolate_unit(mut self, prefix: impl Into<String>) -> Self {
        self.isolated_units.push(prefix.into());
        self
    }

    pub fn build(self) -> Result<PermissionPolicy, PolicyError> {
        let has_allow = !self.allow_units.is_empty() || !self.allow.is_empty();
        let has_deny = !self.deny_units.is_empty() || !self.deny.is_empty();

        let mode = match (self.mode, has_allow, has_deny) {
            (_, true, true) => return Err(PolicyError::ConflictingModes),
            (Some(PolicyMode::AllowList), _, true) | (Some(PolicyMode::DenyList), true, _) => {
                return Err(PolicyError::ConflictingModes)
            }
            (Some(mode), _, _) => mode,
            (None, true, false) => PolicyMode::AllowList,
            (None, _, _) => PolicyMode::DenyList,
        };

        let forbidden_calls = self
            .forbidden_calls
            .unwrap_or_else(|| DEFAULT_FORBIDDEN_CALLS.iter().map(|s| s.to_string()).collect());
        let fatal_faults = self
            .fatal_faults
            .unwrap_or_else(|| DEFAULT_FATAL_FAULTS.iter().map(|s| s.to_string()).collect());

        for kind in fatal_faults.iter().chain(&self.safe_faults) {
            if kind.is_empty() || kind.split('.').any(str::is_empty) {
                return Err(PolicyError::InvalidFaultKind(kind.clone()));
            }
        }
        for kind in &self.safe_faults {
            if let Some(fatal) = ALWAYS_FATAL.iter().find(|fatal| related(kind, fatal)) {
                return Err(PolicyError::SafeOverlapsFatal {
                    kind: kind.clone(),
                    fatal: fatal.to_string(),
                });
            }
        }

        let (units, permissions) = match mode {
            PolicyMode::AllowList => (self.allow_units, self.allow),
            PolicyMode::DenyList => (self.deny_units, self.deny),
        };

        let mut units = units;
        units.sort();
        units.dedup();
        let mut safe_faults = self.safe_faults;
        safe_faults.sort();
        safe_faults.dedup();
        let mut isolated_units = self.isolated_units;
        isolated_units.sort();
        isolated_units.dedup();

        Ok(PermissionPolicy {
            mode,
            units,
            permissions,
            forbidden_calls,
            fatal_faults,
            safe_faults,
            isolated_units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_conflicting_modes() {
        let result = PolicyBuilder::new()
            .allow_unit("host.io")
            .deny_unit("host.fs")
            .build();
        assert_eq!(result, Err(PolicyError::ConflictingModes));

        let result = PolicyBuilder::allow_list()
            .deny(Permission::Exit)
            .build();
        assert_eq!(result, Err(PolicyError::ConflictingModes));
    }

    #[test]
    fn test_mode_inferred_from_rules() {
        let policy = PolicyBuilder::new().allow_unit("host.io").build().unwrap();
        assert_eq!(policy.mode(), PolicyMode::AllowList);
        assert!(policy.permits_unit("host.io"));
        assert!(!policy.permits_unit("host.fs"));

        let policy = PolicyBuilder::new().deny_unit("host.fs").build().unwrap();
        assert_eq!(policy.mode(), PolicyMode::DenyList);
        assert!(!policy.permits_unit("host.fs"));
        assert!(policy.permits_unit("host.io"));
    }

    #[test]
    fn test_safe_fault_overlapping_terminated_rejected() {
        for kind in ["fault", "fault.error", "fault.error.terminated", "fault.error.terminated.x"] {
            let result = PolicyBuilder::new().safe_fault(kind).build();
            assert!(
                matches!(result, Err(PolicyError::SafeOverlapsFatal { .. })),
                "{} should be rejected",
                kind
            );
        }
        assert!(PolicyBuilder::new()
            .safe_fault("fault.error.stack_overflow")
            .build()
            .is_ok());
    }

    #[test]
    fn test_needs_validation() {
        let policy = PolicyBuilder::new()
            .safe_fault("fault.error.stack_overflow")
            .build()
            .unwrap();

        assert!(policy.needs_validation("fault"));
        assert!(policy.needs_validation("fault.error"));
        assert!(policy.needs_validation("fault.error.output_limit"));
        assert!(!policy.needs_validation("fault.error.stack_overflow"));
        assert!(!policy.needs_validation("fault.exception.io"));
        assert!(!policy.needs_validation("app.custom"));
    }

    #[test]
    fn test_verdict() {
        let policy = PolicyBuilder::new()
            .safe_fault("fault.error.stack_overflow")
            .fatal_fault("app.fatal")
            .build()
            .unwrap();

        assert_eq!(policy.verdict(kinds::TERMINATED), CatchVerdict::Rethrow);
        assert_eq!(policy.verdict(kinds::OUTPUT_LIMIT), CatchVerdict::Rethrow);
        assert_eq!(policy.verdict(kinds::STACK_OVERFLOW), CatchVerdict::Catch);
        assert_eq!(policy.verdict("app.fatal.sub"), CatchVerdict::Rethrow);
        assert_eq!(policy.verdict(kinds::IO), CatchVerdict::Catch);
    }

    #[test]
    fn test_forbidden_calls() {
        let policy = PolicyBuilder::new().forbid_call("host.fs").build().unwrap();
        assert!(policy.is_forbidden_call("host.system::exit"));
        assert!(policy.is_forbidden_call("host.fs::read"));
        assert!(!policy.is_forbidden_call("host.fsx::read"));
        assert!(!policy.is_forbidden_call("host.system::env"));
    }

    #[test]
    fn test_permits_operations() {
        let deny = PolicyBuilder::new()
            .deny(Permission::Environment {
                var: "SECRET".into(),
            })
            .build()
            .unwrap();
        assert!(!deny.permits(&Permission::Environment {
            var: "SECRET".into()
        }));
        assert!(deny.permits(&Permission::Environment { var: "PATH".into() }));

        let allow = PermissionPolicy::restrictive();
        assert!(!allow.permits(&Permission::Exit));
        assert!(!allow.permits(&Permission::ForbiddenCall {
            target: "x::y".into()
        }));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = PolicyBuilder::new()
            .deny_unit("b")
            .deny_unit("a")
            .build()
            .unwrap();
        let b = PolicyBuilder::new()
            .deny_unit("a")
            .deny_unit("b")
            .build()
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        assert_ne!(a.fingerprint(), PermissionPolicy::permissive().fingerprint());
    }

    #[test]
    fn test_from_config() {
        let config = PolicyConfig {
            mode: Some("allow-list".into()),
            units: vec!["host.io".into()],
            permissions: vec![PermissionRule {
                kind: "file-read".into(),
                pattern: Some("/data".into()),
                recursive: true,
            }],
            safe_faults: vec!["fault.error.stack_overflow".into()],
            ..Default::default()
        };

        let policy = PermissionPolicy::from_config(&config).unwrap();
        assert_eq!(policy.mode(), PolicyMode::AllowList);
        assert!(policy.permits(&Permission::FileRead {
            path: PathBuf::from("/data/x"),
            recursive: false,
        }));
        assert!(!policy.permits_unit("host.fs"));
    }
}
