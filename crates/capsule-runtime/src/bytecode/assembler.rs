//! Unit assembler
//!
//! Builds units instruction by instruction with symbolic labels, so
//! producers and tests never compute byte offsets by hand.
//!
//! ```
//! use capsule_runtime::bytecode::assembler::UnitBuilder;
//! use capsule_runtime::bytecode::Insn;
//!
//! let unit = UnitBuilder::new("app.hello")
//!     .method("main", 0, 0, |m| {
//!         m.str("hello").invoke("host.io::println", 1).op(Insn::Pop);
//!         m.op(Insn::Null).op(Insn::Return);
//!     })
//!     .build()
//!     .unwrap();
//! assert_eq!(unit.methods.len(), 1);
//! ```

use super::validator::{self, ValidationError};
use super::{encode_all, intern_constant, CodeUnit, Constant, Handler, Insn, Method, Unit, UnitFormatError};
use thiserror::Error;

/// Assembly failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("method {method}: label used but never placed")]
    UnboundLabel { method: String },
    #[error("method {method}: label placed twice")]
    LabelPlacedTwice { method: String },
    #[error("constant pool is full")]
    ConstantPoolFull,
    #[error("assembled unit is invalid: {}", first_error(.0))]
    Invalid(Vec<ValidationError>),
    #[error(transparent)]
    Format(#[from] UnitFormatError),
}

fn first_error(errors: &[ValidationError]) -> String {
    errors.first().map(|e| e.to_string()).unwrap_or_default()
}

/// Position in a method's instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

enum Pending {
    Insn(Insn),
    Jump(Label),
    JumpIfFalse(Label),
}

impl Pending {
    fn encoded_len(&self) -> usize {
        match self {
            Pending::Insn(insn) => insn.encoded_len(),
            Pending::Jump(_) => Insn::Jump(0).encoded_len(),
            Pending::JumpIfFalse(_) => Insn::JumpIfFalse(0).encoded_len(),
        }
    }
}

struct PendingHandler {
    start: Label,
    end: Label,
    target: Label,
    catch: Option<u16>,
}

/// Builder for one method; obtained through [`UnitBuilder::method`]
pub struct MethodBuilder<'a> {
    pool: &'a mut Vec<Constant>,
    name: String,
    arity: u8,
    locals: u16,
    flags: u8,
    code: Vec<Pending>,
    labels: Vec<Option<usize>>,
    handlers: Vec<PendingHandler>,
    error: Option<AssembleError>,
}

impl<'a> MethodBuilder<'a> {
    fn new(pool: &'a mut Vec<Constant>, name: &str, arity: u8, locals: u16) -> Self {
        Self {
            pool,
            name: name.to_string(),
            arity,
            locals,
            flags: 0,
            code: Vec::new(),
            labels: Vec::new(),
            handlers: Vec::new(),
            error: None,
        }
    }

    fn constant(&mut self, constant: Constant) -> u16 {
        match intern_constant(self.pool, constant) {
            Some(index) => index,
            None => {
                self.error.get_or_insert(AssembleError::ConstantPoolFull);
                0
            }
        }
    }

    /// Append a plain instruction
    pub fn op(&mut self, insn: Insn) -> &mut Self {
        self.code.push(Pending::Insn(insn));
        self
    }

    /// Push an integer constant
    pub fn int(&mut self, value: i64) -> &mut Self {
        let index = self.constant(Constant::Int(value));
        self.op(Insn::Const(index))
    }

    /// Push a string constant
    pub fn str(&mut self, value: &str) -> &mut Self {
        let index = self.constant(Constant::Str(value.to_string()));
        self.op(Insn::Const(index))
    }

    pub fn load(&mut self, slot: u16) -> &mut Self {
        self.op(Insn::Load(slot))
    }

    pub fn store(&mut self, slot: u16) -> &mut Self {
        self.op(Insn::Store(slot))
    }

    /// Call `unit::method` with `argc` arguments from the stack
    pub fn invoke(&mut self, target: &str, argc: u8) -> &mut Self {
        let target = self.constant(Constant::Str(target.to_string()));
        self.op(Insn::Invoke { target, argc })
    }

    /// Throw a fault of `kind`; the message is taken from the stack
    pub fn throw(&mut self, kind: &str) -> &mut Self {
        let kind = self.constant(Constant::Str(kind.to_string()));
        self.op(Insn::Throw(kind))
    }

    /// Push a reference to the named unit
    pub fn unit_ref(&mut self, unit: &str) -> &mut Self {
        let name = self.constant(Constant::Str(unit.to_string()));
        self.op(Insn::UnitRef(name))
    }

    /// Create an unplaced label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Place `label` at the next instruction
    pub fn mark(&mut self, label: Label) -> &mut Self {
        match self.labels.get_mut(label.0) {
            Some(slot @ None) => *slot = Some(self.code.len()),
            _ => {
                let method = self.name.clone();
                self.error
                    .get_or_insert(AssembleError::LabelPlacedTwice { method });
            }
        }
        self
    }

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.code.push(Pending::Jump(label));
        self
    }

    pub fn jump_if_false(&mut self, label: Label) -> &mut Self {
        self.code.push(Pending::JumpIfFalse(label));
        self
    }

    /// Protect `[start, end)` with a handler at `target` catching `catch`
    /// (every fault when `None`)
    pub fn try_region(
        &mut self,
        start: Label,
        end: Label,
        target: Label,
        catch: Option<&str>,
    ) -> &mut Self {
        let catch = catch.map(|kind| self.constant(Constant::Str(kind.to_string())));
        self.handlers.push(PendingHandler {
            start,
            end,
            target,
            catch,
        });
        self
    }

    pub fn synchronized(&mut self) -> &mut Self {
        self.flags |= Method::SYNCHRONIZED;
        self
    }

    pub fn finalizer(&mut self) -> &mut Self {
        self.flags |= Method::FINALIZER;
        self
    }

    fn finish(self) -> Result<Method, AssembleError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let mut offsets = Vec::with_capacity(self.code.len() + 1);
        let mut offset = 0u32;
        for pending in &self.code {
            offsets.push(offset);
            offset += pending.encoded_len() as u32;
        }
        offsets.push(offset);

        let resolve = |label: Label| -> Result<u32, AssembleError> {
            self.labels
                .get(label.0)
                .copied()
                .flatten()
                .map(|index| offsets[index])
                .ok_or_else(|| AssembleError::UnboundLabel {
                    method: self.name.clone(),
                })
        };

        let mut insns = Vec::with_capacity(self.code.len());
        for pending in &self.code {
            insns.push(match pending {
                Pending::Insn(insn) => *insn,
                Pending::Jump(label) => Insn::Jump(resolve(*label)?),
                Pending::JumpIfFalse(label) => Insn::JumpIfFalse(resolve(*label)?),
            });
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            handlers.push(Handler {
                start: resolve(handler.start)?,
                end: resolve(handler.end)?,
                target: resolve(handler.target)?,
                catch: handler.catch,
            });
        }

        Ok(Method {
            name: self.name.clone(),
            arity: self.arity,
            locals: self.locals,
            flags: self.flags,
            code: encode_all(&insns),
            handlers,
        })
    }
}

/// Builder for a whole unit
pub struct UnitBuilder {
    unit: Unit,
    error: Option<AssembleError>,
}

impl UnitBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            unit: Unit::new(name),
            error: None,
        }
    }

    /// Add a method; `locals` counts the argument slots too
    pub fn method(
        mut self,
        name: &str,
        arity: u8,
        locals: u16,
        build: impl FnOnce(&mut MethodBuilder<'_>),
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let mut builder = MethodBuilder::new(&mut self.unit.constants, name, arity, locals);
        build(&mut builder);
        match builder.finish() {
            Ok(method) => self.unit.methods.push(method),
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Finish and validate the unit
    pub fn build(self) -> Result<Unit, AssembleError> {
        let unit = self.build_unchecked()?;
        validator::validate(&unit, false).map_err(AssembleError::Invalid)?;
        Ok(unit)
    }

    /// Finish without validation
    pub fn build_unchecked(self) -> Result<Unit, AssembleError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.unit),
        }
    }

    /// Finish, validate and encode for submission
    pub fn build_code_unit(self) -> Result<CodeUnit, AssembleError> {
        Ok(CodeUnit::executable(&self.build()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode_all;

    #[test]
    fn test_labels_resolve_to_offsets() {
        let unit = UnitBuilder::new("t")
            .method("count", 0, 1, |m| {
                let top = m.label();
                let done = m.label();
                m.int(0).store(0);
                m.mark(top);
                m.load(0).int(3).op(Insn::Lt).jump_if_false(done);
                m.load(0).int(1).op(Insn::Add).store(0).jump(top);
                m.mark(done);
                m.load(0).op(Insn::Return);
            })
            .build()
            .unwrap();

        let decoded = decode_all(&unit.methods[0].code).unwrap();
        let jumps: Vec<Insn> = decoded
            .iter()
            .map(|(_, i)| *i)
            .filter(|i| i.jump_target().is_some())
            .collect();
        // top = 6 (after Const+Store), done = 6 + 3+3+1+5 + 3+3+1+3+5
        assert_eq!(jumps, vec![Insn::JumpIfFalse(33), Insn::Jump(6)]);
    }

    #[test]
    fn test_constants_are_shared_across_methods() {
        let unit = UnitBuilder::new("t")
            .method("a", 0, 0, |m| {
                m.str("x").op(Insn::Return);
            })
            .method("b", 0, 0, |m| {
                m.str("x").op(Insn::Return);
            })
            .build()
            .unwrap();
        assert_eq!(unit.constants, vec![Constant::Str("x".into())]);
    }

    #[test]
    fn test_unbound_label() {
        let result = UnitBuilder::new("t")
            .method("m", 0, 0, |m| {
                let nowhere = m.label();
                m.jump(nowhere);
            })
            .build();
        assert_eq!(
            result,
            Err(AssembleError::UnboundLabel {
                method: "m".into()
            })
        );
    }

    #[test]
    fn test_try_region_and_flags() {
        let unit = UnitBuilder::new("t")
            .method("m", 0, 0, |m| {
                let (start, end, handler) = (m.label(), m.label(), m.label());
                m.synchronized();
                m.mark(start).str("boom").throw("app.err");
                m.mark(end).mark(handler).op(Insn::Return);
                m.try_region(start, end, handler, Some("app"));
            })
            .build()
            .unwrap();

        let method = &unit.methods[0];
        assert!(method.is_synchronized());
        assert_eq!(
            method.handlers,
            vec![Handler {
                start: 0,
                end: 6,
                target: 6,
                catch: Some(2)
            }]
        );
    }

    #[test]
    fn test_invalid_unit_rejected() {
        let result = UnitBuilder::new("t")
            .method("m", 0, 0, |m| {
                m.op(Insn::EnterCheck).op(Insn::Null).op(Insn::Return);
            })
            .build();
        assert!(matches!(result, Err(AssembleError::Invalid(_))));
    }
}
