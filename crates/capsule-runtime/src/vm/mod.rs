//! Bytecode interpreter
//!
//! Stack-based interpreter for rewritten units. Each thread of a task runs
//! its own [`Interpreter`]; frames are kept on an explicit stack so deep
//! call chains never grow the native stack.
//!
//! The thread's stop flag is checked before every instruction. A stop is
//! not a fault: no handler sees it, and the interpreter unwinds to the
//! caller with [`VmError::Stopped`].

mod frame;
pub mod monitor;

use crate::bytecode::{decode_at, Constant, Handler, Insn};
use crate::hooks;
use crate::loader::{LoadedUnit, Resolved};
use crate::natives::NativeCall;
use crate::security::policy::CatchVerdict;
use crate::task::group::{ThreadControl, Wake};
use crate::task::ConfinedTask;
use crate::value::{kinds, Fault, Value};
use frame::CallFrame;
use monitor::{MonitorKey, MonitorTable};
use std::cmp::Ordering;
use std::sync::{Arc, MutexGuard};
use thiserror::Error;

/// Deepest call chain before `fault.error.stack_overflow`
pub const MAX_FRAMES: usize = 256;

/// Why execution left the interpreter abnormally
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmError {
    /// A fault no handler caught
    #[error("{0}")]
    Thrown(#[from] Fault),

    /// The thread was told to stop
    #[error("thread stopped")]
    Stopped,
}

/// Map an early wake-up to the error the waiting code sees
pub(crate) fn wake_error(wake: Wake) -> VmError {
    match wake {
        Wake::Interrupted => Fault::new(kinds::INTERRUPTED, "interrupted while waiting").into(),
        Wake::Stopped => VmError::Stopped,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Task,
}

fn lock_list(items: &std::sync::Mutex<Vec<Value>>) -> MutexGuard<'_, Vec<Value>> {
    items.lock().unwrap_or_else(|e| e.into_inner())
}

fn split_target(target: &str) -> Result<(&str, &str), Fault> {
    target
        .rsplit_once("::")
        .ok_or_else(|| Fault::new(kinds::NO_SUCH_METHOD, format!("malformed call target '{}'", target)))
}

fn illegal(message: impl Into<String>) -> VmError {
    Fault::new(kinds::ILLEGAL_STATE, message).into()
}

pub struct Interpreter {
    task: Arc<ConfinedTask>,
    control: Arc<ThreadControl>,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    held: Vec<(Scope, MonitorKey)>,
}

impl Interpreter {
    pub fn new(task: Arc<ConfinedTask>, control: Arc<ThreadControl>) -> Self {
        Self {
            task,
            control,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            held: Vec::new(),
        }
    }

    /// Call `unit::method` with `args` and run it to completion
    ///
    /// Monitors still held when the call ends, normally or not, are
    /// released.
    pub fn invoke(&mut self, unit: &str, method: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let result = match self.task.resolve_unit(unit)? {
            Resolved::Code(loaded) => {
                self.push_frame(loaded, method, args)?;
                self.run()
            }
            Resolved::Native(native) => {
                let func = native.get(method).cloned().ok_or_else(|| no_such_method(unit, method))?;
                if func.arity() as usize != args.len() {
                    return Err(no_such_method(unit, method).into());
                }
                let mut call = NativeCall::new(&self.task, &self.control, args);
                func.call(&mut call)
            }
            Resolved::Data(_) => Err(Fault::new(
                kinds::LINKAGE,
                format!("'{}' is a data unit", unit),
            )
            .into()),
        };
        self.release_all();
        result
    }

    /// Call a `unit::method` target string
    ///
    /// Targets named at run time never passed the rewriter, so forbidden
    /// prefixes are checked here.
    pub fn invoke_target(&mut self, target: &str, args: Vec<Value>) -> Result<Value, VmError> {
        if self.task.policy().is_forbidden_call(target) {
            return Err(self.task.deny_forbidden_call(target).into());
        }
        let (unit, method) = split_target(target)?;
        self.invoke(unit, method, args)
    }

    fn run(&mut self) -> Result<Value, VmError> {
        loop {
            if self.control.should_stop() {
                return Err(VmError::Stopped);
            }
            if self.control.is_low_priority() {
                std::thread::yield_now();
            }
            match self.step() {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(VmError::Thrown(fault)) => self.unwind(fault)?,
                Err(VmError::Stopped) => return Err(VmError::Stopped),
            }
        }
    }

    // ========================================================================
    // Frames
    // ========================================================================

    fn push_frame(&mut self, unit: Arc<LoadedUnit>, method: &str, args: Vec<Value>) -> Result<(), VmError> {
        let index = unit
            .method_index(method)
            .ok_or_else(|| no_such_method(unit.name(), method))?;
        let m = &unit.unit().methods[index];
        if m.arity as usize != args.len() {
            return Err(Fault::new(
                kinds::NO_SUCH_METHOD,
                format!(
                    "{}::{} takes {} argument(s), got {}",
                    unit.name(),
                    method,
                    m.arity,
                    args.len()
                ),
            )
            .into());
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(Fault::new(
                kinds::STACK_OVERFLOW,
                format!("call depth exceeded {}", MAX_FRAMES),
            )
            .into());
        }

        // Confined units had the flag cleared by the rewriter
        let sync_key = if m.is_synchronized() {
            let key = MonitorKey::Unit(Arc::from(unit.name()));
            MonitorTable::global()
                .enter(&key, &self.control)
                .map_err(wake_error)?;
            Some(key)
        } else {
            None
        };

        let mut frame = CallFrame::new(unit, index, args, self.stack.len());
        frame.sync_key = sync_key;
        self.frames.push(frame);
        Ok(())
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            self.stack.truncate(frame.stack_base);
            if let Some(key) = frame.sync_key {
                MonitorTable::global().exit(&key, self.control.id());
            }
        }
    }

    fn frame(&self) -> Result<&CallFrame, VmError> {
        self.frames.last().ok_or_else(|| illegal("no active frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, VmError> {
        self.frames.last_mut().ok_or_else(|| illegal("no active frame"))
    }

    /// Find a handler for `fault`, popping frames until one is found
    fn unwind(&mut self, fault: Fault) -> Result<(), VmError> {
        loop {
            let Some(frame) = self.frames.last() else {
                return Err(VmError::Thrown(fault));
            };
            let unit = frame.unit.unit();
            let at = frame.insn_start as u32;
            let handler = frame
                .method()
                .handlers
                .iter()
                .find(|h| h.start <= at && at < h.end && catches(h, &fault, |i| unit.str_constant(i)))
                .map(|h| h.target as usize);

            if let Some(target) = handler {
                let base = frame.stack_base;
                self.stack.truncate(base);
                self.stack.push(Value::fault(fault));
                self.frame_mut()?.pc = target;
                return Ok(());
            }
            tracing::trace!(frame = %frame.name(), kind = %fault.kind, "unwinding");
            self.pop_frame();
        }
    }

    fn release_all(&mut self) {
        while !self.frames.is_empty() {
            self.pop_frame();
        }
        self.stack.clear();
        let thread = self.control.id();
        for (scope, key) in self.held.drain(..).rev() {
            match scope {
                Scope::Global => MonitorTable::global().exit(&key, thread),
                Scope::Task => self.task.monitors().exit(&key, thread),
            };
        }
    }

    // ========================================================================
    // Operand stack
    // ========================================================================

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        let base = self.frame()?.stack_base;
        if self.stack.len() <= base {
            return Err(illegal("operand stack underflow"));
        }
        self.stack.pop().ok_or_else(|| illegal("operand stack underflow"))
    }

    fn peek(&self) -> Result<&Value, VmError> {
        let base = self.frame()?.stack_base;
        if self.stack.len() <= base {
            return Err(illegal("operand stack underflow"));
        }
        self.stack.last().ok_or_else(|| illegal("operand stack underflow"))
    }

    fn pop_int(&mut self) -> Result<i64, VmError> {
        let value = self.pop()?;
        value.as_int().ok_or_else(|| Fault::type_error("int", &value).into())
    }

    fn binary_int_op<F>(&mut self, op: F) -> Result<(), VmError>
    where
        F: FnOnce(i64, i64) -> Result<i64, Fault>,
    {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Int(op(a, b)?));
        Ok(())
    }

    fn compare<F>(&mut self, test: F) -> Result<(), VmError>
    where
        F: FnOnce(Ordering) -> bool,
    {
        let b = self.pop()?;
        let a = self.pop()?;
        let ordering = match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::Str(x), Value::Str(y)) => x.cmp(y),
            (Value::Int(_), other) | (Value::Str(_), other) => {
                return Err(Fault::type_error(a.type_name(), other).into())
            }
            (other, _) => return Err(Fault::type_error("int or string", other).into()),
        };
        self.push(Value::Bool(test(ordering)));
        Ok(())
    }

    fn str_constant(&self, index: u16) -> Result<Arc<str>, VmError> {
        let frame = self.frame()?;
        frame
            .unit
            .unit()
            .str_constant(index)
            .map(Arc::from)
            .ok_or_else(|| illegal(format!("constant {} is not a string", index)))
    }

    fn enter_monitor(&mut self, scope: Scope) -> Result<(), VmError> {
        let value = self.pop()?;
        let key = MonitorKey::from_value(&value)?;
        let table = match scope {
            Scope::Global => MonitorTable::global(),
            Scope::Task => self.task.monitors(),
        };
        table.enter(&key, &self.control).map_err(wake_error)?;
        self.held.push((scope, key));
        Ok(())
    }

    fn exit_monitor(&mut self, scope: Scope) -> Result<(), VmError> {
        let value = self.pop()?;
        let key = MonitorKey::from_value(&value)?;
        let table = match scope {
            Scope::Global => MonitorTable::global(),
            Scope::Task => self.task.monitors(),
        };
        if !table.exit(&key, self.control.id()) {
            return Err(Fault::new(
                kinds::ILLEGAL_MONITOR_STATE,
                format!("monitor of {} is not held", value),
            )
            .into());
        }
        if let Some(pos) = self.held.iter().rposition(|(s, k)| *s == scope && *k == key) {
            self.held.remove(pos);
        }
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Execute one instruction; `Some` when the outermost frame returns
    fn step(&mut self) -> Result<Option<Value>, VmError> {
        let (insn, len) = {
            let frame = self.frame()?;
            let code = &frame.method().code;
            if frame.pc >= code.len() {
                // Falling off the end returns null
                (Insn::Return, 0)
            } else {
                decode_at(code, frame.pc).map_err(|e| Fault::new(kinds::LINKAGE, e.to_string()))?
            }
        };
        {
            let frame = self.frame_mut()?;
            frame.insn_start = frame.pc;
            frame.pc += len;
        }

        match insn {
            // ===== Constants =====
            Insn::Const(index) => {
                let value = match self.frame()?.unit.unit().constants.get(index as usize) {
                    Some(Constant::Int(n)) => Value::Int(*n),
                    Some(Constant::Str(s)) => Value::str(s),
                    None => return Err(illegal(format!("constant {} out of range", index))),
                };
                self.push(value);
            }
            Insn::Null => self.push(Value::Null),
            Insn::True => self.push(Value::Bool(true)),
            Insn::False => self.push(Value::Bool(false)),

            // ===== Locals =====
            Insn::Load(slot) => {
                let value = self
                    .frame()?
                    .locals
                    .get(slot as usize)
                    .cloned()
                    .ok_or_else(|| illegal(format!("local {} out of range", slot)))?;
                self.push(value);
            }
            Insn::Store(slot) => {
                let value = self.pop()?;
                let local = self
                    .frame_mut()?
                    .locals
                    .get_mut(slot as usize)
                    .ok_or_else(|| illegal(format!("local {} out of range", slot)))?;
                *local = value;
            }

            // ===== Arithmetic =====
            Insn::Add => self.binary_int_op(|a, b| Ok(a.wrapping_add(b)))?,
            Insn::Sub => self.binary_int_op(|a, b| Ok(a.wrapping_sub(b)))?,
            Insn::Mul => self.binary_int_op(|a, b| Ok(a.wrapping_mul(b)))?,
            Insn::Div => self.binary_int_op(|a, b| {
                if b == 0 {
                    return Err(Fault::new(kinds::ARITHMETIC, "division by zero"));
                }
                Ok(a.wrapping_div(b))
            })?,
            Insn::Mod => self.binary_int_op(|a, b| {
                if b == 0 {
                    return Err(Fault::new(kinds::ARITHMETIC, "division by zero"));
                }
                Ok(a.wrapping_rem(b))
            })?,
            Insn::Neg => {
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_neg()));
            }
            Insn::Concat => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::from(format!("{}{}", a, b)));
            }

            // ===== Comparison =====
            Insn::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a == b));
            }
            Insn::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a != b));
            }
            Insn::Lt => self.compare(|o| o == Ordering::Less)?,
            Insn::Le => self.compare(|o| o != Ordering::Greater)?,
            Insn::Gt => self.compare(|o| o == Ordering::Greater)?,
            Insn::Ge => self.compare(|o| o != Ordering::Less)?,

            Insn::Not => {
                let value = self.pop()?;
                let b = value
                    .as_bool()
                    .ok_or_else(|| Fault::type_error("bool", &value))?;
                self.push(Value::Bool(!b));
            }

            // ===== Control flow =====
            Insn::Jump(target) => self.frame_mut()?.pc = target as usize,
            Insn::JumpIfFalse(target) => {
                let value = self.pop()?;
                let condition = value
                    .as_bool()
                    .ok_or_else(|| Fault::type_error("bool", &value))?;
                if !condition {
                    self.frame_mut()?.pc = target as usize;
                }
            }

            // ===== Calls =====
            Insn::Invoke { target, argc } => self.call(target, argc)?,
            Insn::Return => {
                let base = self.frame()?.stack_base;
                let value = if self.stack.len() > base {
                    self.pop()?
                } else {
                    Value::Null
                };
                self.pop_frame();
                if self.frames.is_empty() {
                    return Ok(Some(value));
                }
                self.push(value);
            }

            // ===== Lists =====
            Insn::NewList(count) => {
                let count = count as usize;
                let base = self.frame()?.stack_base;
                if self.stack.len() < base + count {
                    return Err(illegal("operand stack underflow"));
                }
                let items = self.stack.split_off(self.stack.len() - count);
                self.push(Value::list(items));
            }
            Insn::GetIndex => {
                let index = self.pop_int()?;
                let list = self.pop()?;
                let item = match &list {
                    Value::List(items) => {
                        let items = lock_list(items);
                        usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get(i).cloned())
                            .ok_or_else(|| index_fault(index, items.len()))?
                    }
                    Value::Null => return Err(Fault::new(kinds::NULL, "index into null").into()),
                    other => return Err(Fault::type_error("list", other).into()),
                };
                self.push(item);
            }
            Insn::SetIndex => {
                let value = self.pop()?;
                let index = self.pop_int()?;
                let list = self.pop()?;
                match &list {
                    Value::List(items) => {
                        let mut items = lock_list(items);
                        let len = items.len();
                        let slot = usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get_mut(i))
                            .ok_or_else(|| index_fault(index, len))?;
                        *slot = value;
                    }
                    Value::Null => return Err(Fault::new(kinds::NULL, "index into null").into()),
                    other => return Err(Fault::type_error("list", other).into()),
                }
            }
            Insn::Len => {
                let value = self.pop()?;
                let len = match &value {
                    Value::List(items) => lock_list(items).len(),
                    Value::Str(s) => s.chars().count(),
                    other => return Err(Fault::type_error("list or string", other).into()),
                };
                self.push(Value::Int(len as i64));
            }

            // ===== Stack =====
            Insn::Pop => {
                self.pop()?;
            }
            Insn::Dup => {
                let top = self.peek()?.clone();
                self.push(top);
            }
            Insn::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b);
                self.push(a);
            }

            // ===== Faults =====
            Insn::Throw(kind) => {
                let kind = self.str_constant(kind)?;
                let message = match self.pop()? {
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                return Err(Fault::new(kind.as_ref(), message).into());
            }
            Insn::Rethrow => match self.pop()? {
                Value::Fault(fault) => return Err(VmError::Thrown((*fault).clone())),
                other => return Err(Fault::type_error("fault", &other).into()),
            },

            // ===== Monitors and units =====
            Insn::MonitorEnter => self.enter_monitor(Scope::Global)?,
            Insn::MonitorExit => self.exit_monitor(Scope::Global)?,
            Insn::UnitRef(index) => {
                let name = self.str_constant(index)?;
                if self.frame()?.unit.name() != name.as_ref() {
                    self.task.resolve_unit(&name)?;
                }
                self.push(Value::Unit(name));
            }

            // ===== Instrumentation =====
            Insn::EnterCheck => self.enter_check()?,
            Insn::ValidateCaught => self.validate_caught()?,
            Insn::TaskMonitorEnter => self.enter_monitor(Scope::Task)?,
            Insn::TaskMonitorExit => self.exit_monitor(Scope::Task)?,
            Insn::Trap(index) => {
                let target = self.str_constant(index)?;
                return Err(self.task.deny_forbidden_call(&target).into());
            }
        }
        Ok(None)
    }

    fn call(&mut self, target: u16, argc: u8) -> Result<(), VmError> {
        let target = self.str_constant(target)?;
        let (unit_name, method) = split_target(&target)?;

        let base = self.frame()?.stack_base;
        let argc = argc as usize;
        if self.stack.len() < base + argc {
            return Err(illegal("operand stack underflow"));
        }
        let args = self.stack.split_off(self.stack.len() - argc);

        let current = self.frame()?.unit.clone();
        let resolved = if current.name() == unit_name {
            Resolved::Code(current)
        } else {
            self.task.resolve_unit(unit_name)?
        };

        match resolved {
            Resolved::Code(unit) => self.push_frame(unit, method, args),
            Resolved::Native(native) => {
                let func = native
                    .get(method)
                    .cloned()
                    .ok_or_else(|| no_such_method(unit_name, method))?;
                if func.arity() as usize != args.len() {
                    return Err(no_such_method(unit_name, method).into());
                }
                let mut call = NativeCall::new(&self.task, &self.control, args);
                let value = func.call(&mut call)?;
                self.push(value);
                Ok(())
            }
            Resolved::Data(_) => Err(Fault::new(
                kinds::LINKAGE,
                format!("'{}' is a data unit", unit_name),
            )
            .into()),
        }
    }

    /// Refuse to run task code on a thread the task no longer owns
    fn enter_check(&self) -> Result<(), VmError> {
        match hooks::current_task() {
            Some(owner) if Arc::ptr_eq(&owner, &self.task) => {}
            _ => return Err(VmError::Stopped),
        }
        if self.task.is_shutting_down() {
            return Err(Fault::terminated().into());
        }
        Ok(())
    }

    /// Re-examine a just-caught fault at a handler entry
    fn validate_caught(&mut self) -> Result<(), VmError> {
        // Reached by a plain jump with nothing on the stack
        if self.stack.len() <= self.frame()?.stack_base {
            return Ok(());
        }
        let fault = match self.peek()? {
            Value::Fault(fault) => fault.clone(),
            _ => return Ok(()),
        };
        if self.task.is_shutting_down() && !fault.is_a(kinds::OUTPUT_LIMIT) {
            return Err(Fault::terminated().into());
        }
        match self.task.policy().verdict(&fault.kind) {
            CatchVerdict::Catch => Ok(()),
            CatchVerdict::Rethrow => Err(VmError::Thrown((*fault).clone())),
        }
    }
}

fn catches<'a>(handler: &Handler, fault: &Fault, constant: impl Fn(u16) -> Option<&'a str>) -> bool {
    match handler.catch {
        None => true,
        Some(index) => constant(index).is_some_and(|kind| fault.is_a(kind)),
    }
}

fn no_such_method(unit: &str, method: &str) -> Fault {
    Fault::new(kinds::NO_SUCH_METHOD, format!("{}::{}", unit, method))
}

fn index_fault(index: i64, len: usize) -> Fault {
    Fault::new(
        kinds::INDEX,
        format!("index {} out of bounds for length {}", index, len),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_errors() {
        assert_eq!(wake_error(Wake::Stopped), VmError::Stopped);
        match wake_error(Wake::Interrupted) {
            VmError::Thrown(fault) => assert_eq!(fault.kind, kinds::INTERRUPTED),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("a.b::run").unwrap(), ("a.b", "run"));
        assert!(split_target("nothing").is_err());
    }

    #[test]
    fn test_catches_by_hierarchy() {
        let handler = Handler {
            start: 0,
            end: 4,
            target: 4,
            catch: Some(0),
        };
        let constant = |_| Some(kinds::EXCEPTION);
        assert!(catches(&handler, &Fault::new(kinds::IO, ""), constant));
        assert!(!catches(&handler, &Fault::terminated(), constant));

        let any = Handler { catch: None, ..handler };
        assert!(catches(&any, &Fault::terminated(), |_| None));
    }
}
