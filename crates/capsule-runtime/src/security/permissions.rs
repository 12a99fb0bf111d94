//! Permission descriptors
//!
//! A [`Permission`] names one privileged operation together with its
//! target. Policy rules are permissions too; [`Permission::allows`] decides
//! whether a rule covers a requested operation.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Security errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecurityError {
    #[error("Permission denied: {permission}")]
    Denied { permission: Permission },

    #[error("Permission denied: extra thread limit of {limit} reached")]
    ThreadLimit { limit: usize },

    #[error("Invalid permission pattern: {0}")]
    InvalidPattern(String),
}

/// Permission types
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Permission {
    /// Filesystem read access
    FileRead { path: PathBuf, recursive: bool },

    /// Filesystem write access
    FileWrite { path: PathBuf, recursive: bool },

    /// Network access
    Network { host: String },

    /// Process execution
    Process { command: String },

    /// Environment variable access
    Environment { var: String },

    /// Reading a host property
    PropertyRead { key: String },

    /// Writing a host property
    PropertyWrite { key: String },

    /// Terminating the host process
    Exit,

    /// Creating a thread in the task's group
    ThreadCreate,

    /// Mutating the task's thread group
    ThreadGroupModify,

    /// Loading a unit by name
    LoadUnit { name: String },

    /// Invoking a call target the policy forbids
    ForbiddenCall { target: String },
}

impl Permission {
    /// Check if this permission (as a rule) allows the requested operation
    pub fn allows(&self, requested: &Permission) -> bool {
        match (self, requested) {
            (
                Permission::FileRead {
                    path: allowed,
                    recursive,
                },
                Permission::FileRead {
                    path: requested, ..
                },
            )
            | (
                Permission::FileWrite {
                    path: allowed,
                    recursive,
                },
                Permission::FileWrite {
                    path: requested, ..
                },
            ) => allowed == requested || (*recursive && requested.starts_with(allowed)),

            // Network: exact host, `*.domain` subdomain wildcard, or `*`
            (Permission::Network { host: allowed }, Permission::Network { host: requested }) => {
                if allowed == requested || allowed == "*" {
                    return true;
                }
                if let Some(domain) = allowed.strip_prefix("*.") {
                    if requested == domain {
                        return true;
                    }
                    if let Some(prefix) = requested.strip_suffix(domain) {
                        return prefix.ends_with('.');
                    }
                }
                false
            }

            (
                Permission::Process { command: allowed },
                Permission::Process { command: requested },
            ) => allowed == requested || allowed == "*",

            (
                Permission::Environment { var: allowed },
                Permission::Environment { var: requested },
            ) => allowed == requested || allowed == "*",

            (
                Permission::PropertyRead { key: allowed },
                Permission::PropertyRead { key: requested },
            )
            | (
                Permission::PropertyWrite { key: allowed },
                Permission::PropertyWrite { key: requested },
            ) => key_matches(allowed, requested),

            (Permission::LoadUnit { name: allowed }, Permission::LoadUnit { name: requested }) => {
                name_has_prefix(requested, allowed)
            }

            (Permission::Exit, Permission::Exit)
            | (Permission::ThreadCreate, Permission::ThreadCreate)
            | (Permission::ThreadGroupModify, Permission::ThreadGroupModify) => true,

            // Forbidden calls are never granted by a rule
            _ => false,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::FileRead { path, .. } => write!(f, "file read {}", path.display()),
            Permission::FileWrite { path, .. } => write!(f, "file write {}", path.display()),
            Permission::Network { host } => write!(f, "network {}", host),
            Permission::Process { command } => write!(f, "process {}", command),
            Permission::Environment { var } => write!(f, "environment {}", var),
            Permission::PropertyRead { key } => write!(f, "property read {}", key),
            Permission::PropertyWrite { key } => write!(f, "property write {}", key),
            Permission::Exit => write!(f, "exit"),
            Permission::ThreadCreate => write!(f, "thread create"),
            Permission::ThreadGroupModify => write!(f, "thread group modify"),
            Permission::LoadUnit { name } => write!(f, "load unit {}", name),
            Permission::ForbiddenCall { target } => write!(f, "forbidden call {}", target),
        }
    }
}

/// Property keys: exact, `*`, or `prefix.*`
fn key_matches(pattern: &str, key: &str) -> bool {
    if pattern == "*" || pattern == key {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('.') => key.starts_with(prefix),
        _ => false,
    }
}

/// Dotted-name prefix match: `host.io` covers `host.io` and `host.io.x`
/// but not `host.iox`; a prefix ending in `.` covers anything below it.
pub fn name_has_prefix(name: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    match name.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => prefix.ends_with('.') || rest.starts_with('.'),
        None => false,
    }
}

/// Set of permission rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSet {
    permissions: BTreeSet<Permission>,
}

impl PermissionSet {
    /// Create a new empty permission set
    pub fn new() -> Self {
        Self {
            permissions: BTreeSet::new(),
        }
    }

    /// Add a rule
    pub fn grant(&mut self, permission: Permission) {
        self.permissions.insert(permission);
    }

    /// Check if any rule covers the request
    pub fn is_granted(&self, requested: &Permission) -> bool {
        self.permissions.iter().any(|p| p.allows(requested))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

/// Canonicalize a path for permission checks, falling back to an absolute
/// path when the target does not exist yet
pub fn canonicalize_path_safe(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    }
}
