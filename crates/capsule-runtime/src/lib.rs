//! Capsule Runtime - Confinement engine for untrusted bytecode
//!
//! This library runs submitted code units inside a confined task:
//! - Units are rewritten before loading so task code cannot swallow engine
//!   faults, lock shared monitors or reach forbidden calls
//! - Each task owns a thread group, captured consoles and a permission
//!   record
//! - A supervisor enforces wall and CPU deadlines and stops every thread
//!   of a task before releasing it

/// Capsule runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod bytecode;
pub mod hooks;
pub mod loader;
pub mod natives;
pub mod params;
pub mod plugin;
pub mod result;
pub mod rewrite;
pub mod security;
pub mod supervisor;
pub mod task;
pub mod value;
pub mod vm;

// Re-export commonly used types
pub use bytecode::{CodeUnit, Insn, Method, Unit};
pub use loader::{CodeBundle, HostClasspath};
pub use natives::{NativeCall, NativeUnit, Natives};
pub use params::{Entry, ExecutionParams, ParamsError, Termination};
pub use plugin::{FinishInfo, Plugin, PluginError, PluginRegistry, PluginSpec};
pub use result::{PermissionRecord, TaskResult};
pub use rewrite::{RewriteContext, RewriteError, Rewriter};
pub use security::{
    AuditEvent, AuditLogger, MemoryAuditLogger, NullAuditLogger, Permission, PermissionPolicy,
    PolicyBuilder, PolicyError,
};
pub use supervisor::{EngineError, Executor, RunningTask, Supervisor, TaskControl};
pub use task::console::{OutputLine, Stream};
pub use value::{kinds, Fault, Value};
pub use vm::VmError;
