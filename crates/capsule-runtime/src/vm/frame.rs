//! Call frame implementation for method calls

use crate::bytecode::Method;
use crate::loader::LoadedUnit;
use crate::value::Value;
use crate::vm::monitor::MonitorKey;
use std::sync::Arc;

/// One active method invocation
///
/// Operands live on the interpreter's shared stack above `stack_base`;
/// locals are owned by the frame.
#[derive(Debug)]
pub struct CallFrame {
    pub unit: Arc<LoadedUnit>,
    pub method: usize,
    /// Offset of the next instruction
    pub pc: usize,
    /// Offset of the instruction currently executing; handler lookup and
    /// unwinding through callers use it
    pub insn_start: usize,
    pub stack_base: usize,
    pub locals: Vec<Value>,
    /// Global monitor held for a trusted synchronized method
    pub sync_key: Option<MonitorKey>,
}

impl CallFrame {
    pub fn new(unit: Arc<LoadedUnit>, method: usize, args: Vec<Value>, stack_base: usize) -> Self {
        let slots = {
            let m = &unit.unit().methods[method];
            (m.locals as usize).max(m.arity as usize)
        };
        let mut locals = args;
        locals.resize(slots.max(locals.len()), Value::Null);
        Self {
            unit,
            method,
            pc: 0,
            insn_start: 0,
            stack_base,
            locals,
            sync_key: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.unit.unit().methods[self.method]
    }

    pub fn name(&self) -> String {
        format!("{}::{}", self.unit.name(), self.method().name)
    }
}
