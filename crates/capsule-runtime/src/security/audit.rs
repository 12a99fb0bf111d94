//! Security audit logging
//!
//! Structured record of permission decisions and task lifecycle events,
//! kept apart from the diagnostic `tracing` output so hosts can retain it.

use crate::security::permissions::Permission;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Security audit event types
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    /// Task registered and about to start
    TaskCreated { task: u64, entry: String },
    /// Permission decision made for a confined thread
    PermissionCheck {
        task: u64,
        permission: Permission,
        granted: bool,
    },
    /// Unit reference refused by the policy
    UnitDenied { task: u64, name: String },
    /// Forbidden call reached at run time
    ForbiddenCall { task: u64, target: String },
    /// Wall-clock or CPU deadline passed
    TaskTimedOut { task: u64, cpu: bool },
    /// Explicit kill request
    TaskKilled { task: u64, reason: String },
    /// All threads gone and state released
    TaskReleased { task: u64 },
    /// Termination escalation exhausted with threads still alive
    ContainmentFailure { task: u64, remaining: usize },
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::TaskCreated { task, entry } => {
                write!(f, "Task {} created (entry: {})", task, entry)
            }
            AuditEvent::PermissionCheck {
                task,
                permission,
                granted,
            } => {
                let status = if *granted { "GRANTED" } else { "DENIED" };
                write!(f, "Task {} permission {}: {}", task, status, permission)
            }
            AuditEvent::UnitDenied { task, name } => {
                write!(f, "Task {} denied unit {}", task, name)
            }
            AuditEvent::ForbiddenCall { task, target } => {
                write!(f, "Task {} reached forbidden call {}", task, target)
            }
            AuditEvent::TaskTimedOut { task, cpu } => {
                let clock = if *cpu { "cpu" } else { "wall" };
                write!(f, "Task {} exceeded its {} deadline", task, clock)
            }
            AuditEvent::TaskKilled { task, reason } => {
                write!(f, "Task {} killed: {}", task, reason)
            }
            AuditEvent::TaskReleased { task } => write!(f, "Task {} released", task),
            AuditEvent::ContainmentFailure { task, remaining } => write!(
                f,
                "Containment failure: task {} still has {} live thread(s)",
                task, remaining
            ),
        }
    }
}

/// Audit log entry with timestamp
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

impl AuditEntry {
    /// Create a new audit entry stamped now
    pub fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }

    /// Format as log line
    pub fn to_log_line(&self) -> String {
        format!(
            "[{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.event
        )
    }
}

/// Audit logger trait for customizable logging backends
pub trait AuditLogger: Send + Sync {
    fn log(&self, event: AuditEvent);

    /// Get all logged entries (for testing)
    fn entries(&self) -> Vec<AuditEntry>;

    /// Clear all logged entries (for testing)
    fn clear(&self);
}

/// In-memory audit logger
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLogger {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries logged at most `window` ago
    pub fn recent(&self, window: Duration) -> Vec<AuditEntry> {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w));
        self.entries()
            .into_iter()
            .filter(|e| cutoff.map_or(true, |c| e.timestamp >= c))
            .collect()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: AuditEvent) {
        let entry = AuditEntry::new(event);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// No-op audit logger
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditLogger;

impl NullAuditLogger {
    pub fn new() -> Self {
        Self
    }
}

impl AuditLogger for NullAuditLogger {
    fn log(&self, _event: AuditEvent) {}

    fn entries(&self) -> Vec<AuditEntry> {
        Vec::new()
    }

    fn clear(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_logger_records_in_order() {
        let logger = MemoryAuditLogger::new();
        logger.log(AuditEvent::TaskCreated {
            task: 1,
            entry: "app::main".into(),
        });
        logger.log(AuditEvent::TaskReleased { task: 1 });

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].event, AuditEvent::TaskReleased { task: 1 });
        assert_eq!(logger.recent(Duration::from_secs(60)).len(), 2);

        logger.clear();
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn test_log_line_format() {
        let entry = AuditEntry::new(AuditEvent::PermissionCheck {
            task: 7,
            permission: Permission::Exit,
            granted: false,
        });
        let line = entry.to_log_line();
        assert!(line.starts_with('['));
        assert!(line.ends_with("Task 7 permission DENIED: exit"));
    }

    #[test]
    fn test_null_logger() {
        let logger = NullAuditLogger::new();
        logger.log(AuditEvent::TaskReleased { task: 1 });
        assert!(logger.entries().is_empty());
    }
}
