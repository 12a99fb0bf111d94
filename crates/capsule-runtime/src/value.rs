//! Runtime values and faults
//!
//! Values are cheap to clone: strings and unit references are `Arc<str>`,
//! lists are shared mutable cells compared by identity.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Built-in fault kinds.
///
/// Kinds form a hierarchy by dotted prefix: `fault.exception.io` *is a*
/// `fault.exception` and a `fault`.
pub mod kinds {
    pub const FAULT: &str = "fault";

    pub const ERROR: &str = "fault.error";
    /// Engine kill signal; always fatal, never swallowed by task code.
    pub const TERMINATED: &str = "fault.error.terminated";
    pub const STACK_OVERFLOW: &str = "fault.error.stack_overflow";
    pub const OUTPUT_LIMIT: &str = "fault.error.output_limit";
    pub const LINKAGE: &str = "fault.error.linkage";

    pub const EXCEPTION: &str = "fault.exception";
    pub const SECURITY: &str = "fault.exception.security";
    pub const UNIT_NOT_FOUND: &str = "fault.exception.unit_not_found";
    pub const NO_SUCH_METHOD: &str = "fault.exception.no_such_method";
    pub const ARITHMETIC: &str = "fault.exception.arithmetic";
    pub const TYPE: &str = "fault.exception.type";
    pub const INDEX: &str = "fault.exception.index";
    pub const NULL: &str = "fault.exception.null";
    pub const INTERRUPTED: &str = "fault.exception.interrupted";
    pub const ILLEGAL_STATE: &str = "fault.exception.illegal_state";
    pub const ILLEGAL_MONITOR_STATE: &str = "fault.exception.illegal_monitor_state";
    pub const IO: &str = "fault.exception.io";
}

/// `kind` is `ancestor` or one of its descendants.
pub fn is_a(kind: &str, ancestor: &str) -> bool {
    match kind.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// Either kind is, or descends from, the other.
pub fn related(a: &str, b: &str) -> bool {
    is_a(a, b) || is_a(b, a)
}

/// A thrown value: a dotted kind plus a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub kind: String,
    pub message: String,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn terminated() -> Self {
        Self::new(kinds::TERMINATED, "task is shutting down")
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(kinds::SECURITY, message)
    }

    pub fn type_error(expected: &str, found: &Value) -> Self {
        Self::new(
            kinds::TYPE,
            format!("expected {}, found {}", expected, found.type_name()),
        )
    }

    pub fn is_a(&self, ancestor: &str) -> bool {
        is_a(&self.kind, ancestor)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for Fault {}

/// Runtime value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    List(Arc<Mutex<Vec<Value>>>),
    /// Reference to a loaded unit by name
    Unit(Arc<str>),
    Fault(Arc<Fault>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn fault(fault: Fault) -> Self {
        Value::Fault(Arc::new(fault))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Unit(_) => "unit",
            Value::Fault(_) => "fault",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Unit(a), Value::Unit(b)) => a == b,
            (Value::Fault(a), Value::Fault(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                let items = items.lock().unwrap_or_else(|e| e.into_inner());
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Unit(name) => write!(f, "<unit {}>", name),
            Value::Fault(fault) => write!(f, "{}", fault),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}
