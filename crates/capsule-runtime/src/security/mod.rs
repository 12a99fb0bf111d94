//! Security model
//!
//! Permissions, the immutable policy that decides them, and the audit
//! trail of every decision made for a confined task.

pub mod audit;
pub mod permissions;
pub mod policy;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, MemoryAuditLogger, NullAuditLogger};
pub use permissions::{canonicalize_path_safe, name_has_prefix, Permission, PermissionSet, SecurityError};
pub use policy::{
    CatchVerdict, PermissionPolicy, PolicyBuilder, PolicyError, PolicyMode, ALWAYS_FATAL,
};
