//! Host native units
//!
//! Natives are the only way confined code reaches the host. Each one that
//! touches a sensitive resource asks [`hooks::check_permission`] first.
//!
//! Built-in units:
//! - `host.io`: console output, input, capture and output limits
//! - `host.system`: properties, environment, exit
//! - `host.fs`: file reads and writes
//! - `host.thread`: extra threads, sleeping
//! - `host.task`: self-kill and elapsed time (always reachable)
//! - `host.lang`: value helpers (always reachable)
//! - `host.reflect`: unit presence and data resources

mod io;
mod lang;
mod system;
mod thread;

use crate::hooks::{self, Denial};
use crate::security::permissions::Permission;
use crate::task::console::ConsoleError;
use crate::task::group::ThreadControl;
use crate::task::ConfinedTask;
use crate::value::{kinds, Fault, Value};
use crate::vm::VmError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Arguments and context of one native call
pub struct NativeCall<'a> {
    pub task: &'a Arc<ConfinedTask>,
    pub control: &'a Arc<ThreadControl>,
    pub args: Vec<Value>,
}

impl<'a> NativeCall<'a> {
    pub fn new(task: &'a Arc<ConfinedTask>, control: &'a Arc<ThreadControl>, args: Vec<Value>) -> Self {
        Self {
            task,
            control,
            args,
        }
    }

    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&Value::Null)
    }

    pub fn int(&self, index: usize) -> Result<i64, VmError> {
        let value = self.arg(index);
        value
            .as_int()
            .ok_or_else(|| Fault::type_error("int", value).into())
    }

    pub fn str(&self, index: usize) -> Result<&str, VmError> {
        let value = self.arg(index);
        value
            .as_str()
            .ok_or_else(|| Fault::type_error("string", value).into())
    }

    /// Ask the permission hook; `Ok(false)` is a silent denial
    pub fn check(&self, permission: Permission) -> Result<bool, VmError> {
        match hooks::check_permission(permission) {
            Ok(()) => Ok(true),
            Err(Denial::Silent) => Ok(false),
            Err(Denial::Raise(error)) => Err(Fault::security(error.to_string()).into()),
        }
    }
}

pub type NativeFn = Arc<dyn Fn(&mut NativeCall<'_>) -> Result<Value, VmError> + Send + Sync>;

#[derive(Clone)]
pub struct NativeMethod {
    arity: u8,
    func: NativeFn,
}

impl NativeMethod {
    pub fn arity(&self) -> u8 {
        self.arity
    }

    pub fn call(&self, call: &mut NativeCall<'_>) -> Result<Value, VmError> {
        (self.func)(call)
    }
}

/// A named set of native methods
#[derive(Clone)]
pub struct NativeUnit {
    name: String,
    methods: HashMap<String, NativeMethod>,
}

impl fmt::Debug for NativeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("NativeUnit")
            .field("name", &self.name)
            .field("methods", &names)
            .finish()
    }
}

impl NativeUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a method taking exactly `arity` arguments
    pub fn method<F>(mut self, name: &str, arity: u8, func: F) -> Self
    where
        F: Fn(&mut NativeCall<'_>) -> Result<Value, VmError> + Send + Sync + 'static,
    {
        self.methods.insert(
            name.to_string(),
            NativeMethod {
                arity,
                func: Arc::new(func),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&NativeMethod> {
        self.methods.get(name)
    }
}

/// Native units by name
#[derive(Debug, Clone, Default)]
pub struct Natives {
    units: HashMap<String, Arc<NativeUnit>>,
}

impl Natives {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in host units
    pub fn host() -> Self {
        let mut natives = Self::empty();
        for unit in [
            io::unit(),
            system::system_unit(),
            system::fs_unit(),
            thread::thread_unit(),
            thread::task_unit(),
            lang::lang_unit(),
            lang::reflect_unit(),
        ] {
            natives.register(unit);
        }
        natives
    }

    /// Add or replace a unit
    pub fn register(&mut self, unit: NativeUnit) {
        self.units.insert(unit.name.clone(), Arc::new(unit));
    }

    pub fn get(&self, name: &str) -> Option<Arc<NativeUnit>> {
        self.units.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }
}

pub(crate) fn console_fault(error: ConsoleError) -> VmError {
    let kind = match error {
        ConsoleError::ByteLimitExceeded { .. } => kinds::OUTPUT_LIMIT,
        _ => kinds::ILLEGAL_STATE,
    };
    Fault::new(kind, error.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_units_registered() {
        let natives = Natives::host();
        for name in [
            "host.io",
            "host.system",
            "host.fs",
            "host.thread",
            "host.task",
            "host.lang",
            "host.reflect",
        ] {
            assert!(natives.contains(name), "{} missing", name);
        }
        let io = natives.get("host.io").unwrap();
        assert_eq!(io.get("println").map(|m| m.arity()), Some(1));
    }

    #[test]
    fn test_register_replaces() {
        let mut natives = Natives::empty();
        natives.register(NativeUnit::new("app.x").method("a", 0, |_| Ok(Value::Null)));
        natives.register(NativeUnit::new("app.x").method("b", 0, |_| Ok(Value::Null)));
        let unit = natives.get("app.x").unwrap();
        assert!(unit.get("a").is_none());
        assert!(unit.get("b").is_some());
    }
}
