//! Unit validator, static checks before a unit is executed
//!
//! Performs, per method:
//! 1. **Decode pass**: every byte is a known opcode with its operands
//! 2. **Jump targets**: destinations land on an instruction boundary
//! 3. **Constant refs**: indices are in the pool and have the right type
//! 4. **Locals**: slot indices are below the method's local count
//! 5. **Handlers**: regions and targets are well formed
//! 6. **Terminator**: control cannot run off the end of the code
//!
//! Instrumentation opcodes are only accepted when explicitly allowed, so
//! submitted units cannot forge the rewriter's checks.

use super::insn::{decode_at, DecodeError, Insn};
use super::{Constant, Method, Unit};
use std::collections::HashSet;

// ============================================================================
// Public API
// ============================================================================

/// A validation error with the method and byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Method name (empty for unit-level errors).
    pub method: String,
    /// Byte offset in the method's code.
    pub offset: usize,
    /// What went wrong.
    pub kind: ValidationErrorKind,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.method.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} @ {:#06x}: {}", self.method, self.offset, self.kind)
        }
    }
}

/// Kinds of errors the validator can detect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Bytes that do not decode to an instruction.
    Decode(DecodeError),
    /// Two methods share a name.
    DuplicateMethod,
    /// A method declares fewer locals than arguments.
    LocalsBelowArity { arity: u8, locals: u16 },
    /// A method has no instructions.
    EmptyBody,
    /// A jump target falls outside the code.
    JumpOutOfBounds { target: usize, len: usize },
    /// A jump target does not land on an instruction boundary.
    JumpMisaligned { target: usize },
    /// A constant-pool index exceeds the pool size.
    ConstantIndexOutOfBounds { index: usize, pool_size: usize },
    /// The referenced constant must be a string.
    ExpectedStringConstant { index: usize },
    /// An invoke target is not of the form `unit::method`.
    MalformedCallTarget { target: String },
    /// A local slot index exceeds the declared locals.
    LocalOutOfBounds { index: u16, locals: u16 },
    /// An instrumentation opcode in a unit that may not contain one.
    ReservedOpcode { opcode: &'static str },
    /// A handler region or target is malformed.
    BadHandler { index: usize, reason: &'static str },
    /// Control can fall off the end of the method.
    MissingTerminator,
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "{}", e),
            Self::DuplicateMethod => write!(f, "duplicate method name"),
            Self::LocalsBelowArity { arity, locals } => {
                write!(f, "{} locals cannot hold {} arguments", locals, arity)
            }
            Self::EmptyBody => write!(f, "method has no instructions"),
            Self::JumpOutOfBounds { target, len } => {
                write!(f, "jump target {} is out of bounds (len={})", target, len)
            }
            Self::JumpMisaligned { target } => {
                write!(
                    f,
                    "jump target {} does not align to an instruction boundary",
                    target
                )
            }
            Self::ConstantIndexOutOfBounds { index, pool_size } => {
                write!(
                    f,
                    "constant index {} out of bounds (pool size={})",
                    index, pool_size
                )
            }
            Self::ExpectedStringConstant { index } => {
                write!(f, "constant {} must be a string", index)
            }
            Self::MalformedCallTarget { target } => {
                write!(f, "call target '{}' is not 'unit::method'", target)
            }
            Self::LocalOutOfBounds { index, locals } => {
                write!(f, "local {} out of bounds (locals={})", index, locals)
            }
            Self::ReservedOpcode { opcode } => {
                write!(f, "reserved instruction {} is not allowed here", opcode)
            }
            Self::BadHandler { index, reason } => write!(f, "handler {}: {}", index, reason),
            Self::MissingTerminator => write!(f, "method can run past its last instruction"),
        }
    }
}

/// Validate `unit`, collecting all errors found.
///
/// `allow_instrumentation` admits the rewriter's reserved opcodes. Does NOT
/// short-circuit on the first error.
pub fn validate(unit: &Unit, allow_instrumentation: bool) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut names = HashSet::new();
    for method in &unit.methods {
        if !names.insert(method.name.as_str()) {
            errors.push(ValidationError {
                method: method.name.clone(),
                offset: 0,
                kind: ValidationErrorKind::DuplicateMethod,
            });
        }
        validate_method(unit, method, allow_instrumentation, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// ============================================================================
// Passes
// ============================================================================

fn validate_method(
    unit: &Unit,
    method: &Method,
    allow_instrumentation: bool,
    errors: &mut Vec<ValidationError>,
) {
    let mut report = |offset: usize, kind: ValidationErrorKind| {
        errors.push(ValidationError {
            method: method.name.clone(),
            offset,
            kind,
        })
    };

    if method.locals < method.arity as u16 {
        report(
            0,
            ValidationErrorKind::LocalsBelowArity {
                arity: method.arity,
                locals: method.locals,
            },
        );
    }

    if method.code.is_empty() {
        report(0, ValidationErrorKind::EmptyBody);
        return;
    }

    // Pass 1: decode
    let mut decoded: Vec<(usize, Insn)> = Vec::new();
    let mut offset = 0;
    while offset < method.code.len() {
        match decode_at(&method.code, offset) {
            Ok((insn, len)) => {
                decoded.push((offset, insn));
                offset += len;
            }
            Err(e) => {
                report(offset, ValidationErrorKind::Decode(e));
                return;
            }
        }
    }
    let boundaries: HashSet<usize> = decoded.iter().map(|(o, _)| *o).collect();
    let len = method.code.len();

    for (offset, insn) in &decoded {
        let offset = *offset;
        let opcode = insn.opcode();

        if opcode.is_instrumentation() && !allow_instrumentation {
            report(
                offset,
                ValidationErrorKind::ReservedOpcode {
                    opcode: opcode_name(insn),
                },
            );
        }

        // Pass 2: jump targets
        if let Some(target) = insn.jump_target() {
            let target = target as usize;
            if target >= len {
                report(offset, ValidationErrorKind::JumpOutOfBounds { target, len });
            } else if !boundaries.contains(&target) {
                report(offset, ValidationErrorKind::JumpMisaligned { target });
            }
        }

        // Pass 3: constant references
        if let Some(index) = insn.constant_ref() {
            let index = index as usize;
            match unit.constants.get(index) {
                None => report(
                    offset,
                    ValidationErrorKind::ConstantIndexOutOfBounds {
                        index,
                        pool_size: unit.constants.len(),
                    },
                ),
                Some(Constant::Int(_)) if !matches!(insn, Insn::Const(_)) => {
                    report(offset, ValidationErrorKind::ExpectedStringConstant { index })
                }
                Some(Constant::Str(target)) if matches!(insn, Insn::Invoke { .. }) => {
                    let well_formed = target
                        .split_once("::")
                        .map(|(u, m)| !u.is_empty() && !m.is_empty())
                        .unwrap_or(false);
                    if !well_formed {
                        report(
                            offset,
                            ValidationErrorKind::MalformedCallTarget {
                                target: target.clone(),
                            },
                        );
                    }
                }
                Some(_) => {}
            }
        }

        // Pass 4: locals
        if let Insn::Load(index) | Insn::Store(index) = insn {
            if *index >= method.locals {
                report(
                    offset,
                    ValidationErrorKind::LocalOutOfBounds {
                        index: *index,
                        locals: method.locals,
                    },
                );
            }
        }
    }

    // Pass 5: handlers
    for (index, handler) in method.handlers.iter().enumerate() {
        let (start, end, target) = (
            handler.start as usize,
            handler.end as usize,
            handler.target as usize,
        );
        let reason = if start >= end {
            Some("empty protected region")
        } else if end > len {
            Some("protected region runs past the code")
        } else if !boundaries.contains(&start) || (end < len && !boundaries.contains(&end)) {
            Some("protected region is not instruction aligned")
        } else if !boundaries.contains(&target) {
            Some("target is not an instruction")
        } else if let Some(catch) = handler.catch {
            match unit.constants.get(catch as usize) {
                Some(Constant::Str(kind)) if !kind.is_empty() => None,
                _ => Some("catch kind must be a non-empty string constant"),
            }
        } else {
            None
        };
        if let Some(reason) = reason {
            report(start, ValidationErrorKind::BadHandler { index, reason });
        }
    }

    // Pass 6: terminator
    if let Some((offset, last)) = decoded.last() {
        if !last.opcode().is_terminator() {
            report(*offset, ValidationErrorKind::MissingTerminator);
        }
    }
}

fn opcode_name(insn: &Insn) -> &'static str {
    match insn.opcode() {
        super::Opcode::EnterCheck => "EnterCheck",
        super::Opcode::ValidateCaught => "ValidateCaught",
        super::Opcode::TaskMonitorEnter => "TaskMonitorEnter",
        super::Opcode::TaskMonitorExit => "TaskMonitorExit",
        super::Opcode::Trap => "Trap",
        _ => "instruction",
    }
}
