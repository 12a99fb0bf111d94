//! Process-wide hooks
//!
//! The hooks are the single place where host-visible behaviour depends on
//! which task (if any) owns the calling thread. Ownership is looked up in
//! the task registry by the calling thread's group; threads outside every
//! group see unmodified host behaviour.

use crate::security::audit::AuditEvent;
use crate::security::permissions::{Permission, SecurityError};
use crate::task::console::{ConsoleError, Stream};
use crate::task::group::{current_group, GroupId};
use crate::task::ConfinedTask;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Once, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Registry = HashMap<GroupId, Arc<ConfinedTask>>;

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn read_registry() -> RwLockReadGuard<'static, Registry> {
    registry().read().unwrap_or_else(|e| e.into_inner())
}

fn write_registry() -> RwLockWriteGuard<'static, Registry> {
    registry().write().unwrap_or_else(|e| e.into_inner())
}

fn host_properties() -> &'static RwLock<BTreeMap<String, String>> {
    static PROPERTIES: OnceLock<RwLock<BTreeMap<String, String>>> = OnceLock::new();
    PROPERTIES.get_or_init(|| {
        let line_separator = if cfg!(windows) { "\r\n" } else { "\n" };
        let entries = [
            ("os.name", std::env::consts::OS),
            ("os.arch", std::env::consts::ARCH),
            ("line.separator", line_separator),
            ("file.separator", std::path::MAIN_SEPARATOR_STR),
            ("capsule.version", crate::VERSION),
        ];
        RwLock::new(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    })
}

/// Install the hooks; idempotent
pub fn install() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        registry();
        host_properties();
        tracing::debug!("capsule hooks installed");
    });
}

// ============================================================================
// Registry
// ============================================================================

pub fn register(task: Arc<ConfinedTask>) {
    write_registry().insert(task.id(), task);
}

pub fn unregister(id: GroupId) -> Option<Arc<ConfinedTask>> {
    write_registry().remove(&id)
}

pub fn is_registered(id: GroupId) -> bool {
    read_registry().contains_key(&id)
}

/// Task owning the calling thread
pub fn current_task() -> Option<Arc<ConfinedTask>> {
    let group = current_group()?;
    read_registry().get(&group).cloned()
}

// ============================================================================
// Console streams
// ============================================================================

/// Write to the current task's console, or to the real stream outside tasks
pub fn write_output(stream: Stream, bytes: &[u8]) -> Result<(), ConsoleError> {
    match current_task() {
        Some(task) => task.console().write(stream, bytes),
        None => {
            // Host stream errors are not the caller's concern
            let _ = match stream {
                Stream::Stdout => io::stdout().write_all(bytes),
                Stream::Stderr => io::stderr().write_all(bytes),
            };
            Ok(())
        }
    }
}

/// Next input line for the current task, or from the real stdin
pub fn read_line() -> Option<String> {
    match current_task() {
        Some(task) => task.console().read_line(),
        None => {
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => {
                    let trimmed = line.strip_suffix('\n').unwrap_or(&line);
                    Some(trimmed.strip_suffix('\r').unwrap_or(trimmed).to_string())
                }
            }
        }
    }
}

/// `io::Write` adapter routed through [`write_output`]
#[derive(Debug, Clone, Copy)]
pub struct HookedWriter {
    stream: Stream,
}

pub fn stdout() -> HookedWriter {
    HookedWriter {
        stream: Stream::Stdout,
    }
}

pub fn stderr() -> HookedWriter {
    HookedWriter {
        stream: Stream::Stderr,
    }
}

impl Write for HookedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_output(self.stream, buf)
            .map(|()| buf.len())
            .map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Properties
// ============================================================================

/// Snapshot of the host properties, copied into each new task
pub fn property_snapshot() -> BTreeMap<String, String> {
    host_properties()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

pub fn property(key: &str) -> Option<String> {
    match current_task() {
        Some(task) => task.property(key),
        None => host_properties()
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned(),
    }
}

/// Set a property; inside a task only its private copy changes
pub fn set_property(key: &str, value: &str) -> Option<String> {
    match current_task() {
        Some(task) => task.set_property(key, value),
        None => host_properties()
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string()),
    }
}

// ============================================================================
// Permission checks
// ============================================================================

/// Outcome of a denied permission check
#[derive(Debug, Clone, PartialEq)]
pub enum Denial {
    /// Raise a security fault in the caller
    Raise(SecurityError),
    /// Deny quietly; the caller carries on without the resource
    Silent,
}

/// Check `permission` for the calling thread
pub fn check_permission(permission: Permission) -> Result<(), Denial> {
    let Some(task) = current_task() else {
        return Ok(());
    };

    let outcome = match permission {
        Permission::ThreadCreate if task.is_shutting_down() => Err(Denial::Silent),
        Permission::ThreadCreate => task
            .reserve_extra()
            .map_err(|limit| Denial::Raise(SecurityError::ThreadLimit { limit })),
        _ if task.policy().permits(&permission) => Ok(()),
        _ => Err(Denial::Raise(SecurityError::Denied {
            permission: permission.clone(),
        })),
    };

    let granted = outcome.is_ok();
    task.audit().log(AuditEvent::PermissionCheck {
        task: task.id().as_u64(),
        permission: permission.clone(),
        granted,
    });
    if granted {
        tracing::trace!(task = %task.id(), %permission, "permission granted");
    } else {
        tracing::debug!(task = %task.id(), %permission, "permission denied");
    }
    task.record_permission(permission, granted);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_task_everything_is_permitted() {
        install();
        assert_eq!(check_permission(Permission::Exit), Ok(()));
        assert_eq!(
            check_permission(Permission::Network {
                host: "example.com".into()
            }),
            Ok(())
        );
    }

    #[test]
    fn test_host_properties_present() {
        install();
        assert_eq!(property("os.name").as_deref(), Some(std::env::consts::OS));
        assert_eq!(property("capsule.version").as_deref(), Some(crate::VERSION));
        assert!(property_snapshot().contains_key("file.separator"));
    }

    #[test]
    fn test_no_current_task_outside_groups() {
        assert!(current_task().is_none());
        let group = crate::task::group::ThreadGroup::new("unregistered");
        assert!(!is_registered(group.id()));
    }
}
