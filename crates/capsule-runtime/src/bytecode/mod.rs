//! Code units
//!
//! A unit is a named constant pool plus a list of methods. Each method owns
//! its instruction bytes and an ordered exception-handler table whose
//! offsets index into those bytes.

pub mod assembler;
pub mod disasm;
pub mod insn;
mod opcode;
mod serialize;
pub mod validator;

pub use insn::{decode_all, decode_at, encode_all, DecodeError, Insn};
pub use opcode::Opcode;

use serialize::{length, read_constant, read_method, write_constant, write_method, write_name, Reader};
use std::sync::Arc;
use thiserror::Error;

/// Magic number opening every encoded unit
pub const UNIT_MAGIC: [u8; 4] = *b"CAPS";

/// Current unit format version
///
/// Incremented on backward-incompatible format changes; decoding rejects
/// any other version.
pub const UNIT_FORMAT_VERSION: u16 = 1;

/// Unit decoding failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitFormatError {
    #[error("not a unit: bad magic number")]
    BadMagic,
    #[error("unit format version {found} is not supported (expected {})", UNIT_FORMAT_VERSION)]
    UnsupportedVersion { found: u16 },
    #[error("unit data truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("invalid UTF-8 at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("unknown constant tag {tag:#04x} at offset {offset}")]
    UnknownConstantTag { tag: u8, offset: usize },
    #[error("{0} trailing bytes after unit")]
    TrailingBytes(usize),
    #[error("{what} of {len} does not fit the unit format")]
    TooLarge { what: &'static str, len: usize },
}

/// Constant-pool entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i64),
    Str(String),
}

/// Exception-handler table entry
///
/// Protects `[start, end)` and transfers control to `target` for faults
/// that are, or descend from, the kind named by string constant `catch`
/// (all faults when `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub catch: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    pub arity: u8,
    /// Local slots including the arguments
    pub locals: u16,
    pub flags: u8,
    pub code: Vec<u8>,
    pub handlers: Vec<Handler>,
}

impl Method {
    /// Holds the unit's monitor for the duration of the call
    pub const SYNCHRONIZED: u8 = 0x01;
    /// Cleanup hook; stripped from confined units
    pub const FINALIZER: u8 = 0x02;

    pub fn is_synchronized(&self) -> bool {
        self.flags & Self::SYNCHRONIZED != 0
    }

    pub fn is_finalizer(&self) -> bool {
        self.flags & Self::FINALIZER != 0
    }

    /// Insert instructions at the start of the method.
    ///
    /// Jump targets and handler offsets are shifted so that existing
    /// control flow, including jumps back to offset 0, skips the prologue.
    pub fn insert_prologue(&mut self, prologue: &[Insn]) -> Result<(), DecodeError> {
        let shift: u32 = prologue.iter().map(|i| i.encoded_len() as u32).sum();
        let body = decode_all(&self.code)?;

        let mut code = encode_all(prologue);
        for (_, insn) in body {
            let insn = match insn.jump_target() {
                Some(target) => insn.with_jump_target(target + shift),
                None => insn,
            };
            insn.encode(&mut code);
        }

        for handler in &mut self.handlers {
            handler.start += shift;
            handler.end += shift;
            handler.target += shift;
        }
        self.code = code;
        Ok(())
    }
}

pub(crate) fn intern_constant(pool: &mut Vec<Constant>, constant: Constant) -> Option<u16> {
    if let Some(index) = pool.iter().position(|c| *c == constant) {
        return Some(index as u16);
    }
    let index = u16::try_from(pool.len()).ok()?;
    pool.push(constant);
    Some(index)
}

/// Decoded executable unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub name: String,
    pub constants: Vec<Constant>,
    pub methods: Vec<Method>,
}

impl Unit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constants: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Add a constant, reusing an identical entry; `None` when the pool is full
    pub fn add_constant(&mut self, constant: Constant) -> Option<u16> {
        intern_constant(&mut self.constants, constant)
    }

    pub fn str_constant(&self, index: u16) -> Option<&str> {
        match self.constants.get(index as usize) {
            Some(Constant::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    /// Serialize to the binary unit format
    ///
    /// Format:
    /// - Header: magic "CAPS" + version u16 + flags u16
    /// - Name: u16 length + UTF-8
    /// - Constants: count u32 + tagged entries
    /// - Methods: count u16 + methods (name, arity, locals, flags, code, handlers)
    pub fn to_bytes(&self) -> Result<Vec<u8>, UnitFormatError> {
        let mut bytes = Vec::new();

        bytes.extend_from_slice(&UNIT_MAGIC);
        bytes.extend_from_slice(&UNIT_FORMAT_VERSION.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());

        write_name(&self.name, &mut bytes)?;

        bytes.extend_from_slice(&length::<u32>("constant count", self.constants.len())?.to_be_bytes());
        for constant in &self.constants {
            write_constant(constant, &mut bytes)?;
        }

        bytes.extend_from_slice(&length::<u16>("method count", self.methods.len())?.to_be_bytes());
        for method in &self.methods {
            write_method(method, &mut bytes)?;
        }

        Ok(bytes)
    }

    /// Deserialize from the binary unit format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UnitFormatError> {
        let mut reader = Reader::new(bytes);

        if reader.take(4).map_err(|_| UnitFormatError::BadMagic)? != UNIT_MAGIC {
            return Err(UnitFormatError::BadMagic);
        }
        let version = reader.u16()?;
        if version != UNIT_FORMAT_VERSION {
            return Err(UnitFormatError::UnsupportedVersion { found: version });
        }
        let _flags = reader.u16()?;

        let name = reader.name()?;

        let constant_count = reader.u32()? as usize;
        let mut constants = Vec::with_capacity(constant_count.min(reader.remaining()));
        for _ in 0..constant_count {
            constants.push(read_constant(&mut reader)?);
        }

        let method_count = reader.u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(read_method(&mut reader)?);
        }

        if reader.remaining() > 0 {
            return Err(UnitFormatError::TrailingBytes(reader.remaining()));
        }

        Ok(Unit {
            name,
            constants,
            methods,
        })
    }
}

/// What a code unit's bytes contain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// An encoded [`Unit`]
    Executable,
    /// Opaque resource bytes
    Data,
}

/// A named unit as handed to the engine; immutable once submitted
#[derive(Debug, Clone)]
pub struct CodeUnit {
    pub name: String,
    pub bytes: Arc<[u8]>,
    pub kind: UnitKind,
}

impl CodeUnit {
    /// Encode an assembled unit
    pub fn executable(unit: &Unit) -> Result<Self, UnitFormatError> {
        Ok(Self {
            name: unit.name.clone(),
            bytes: Arc::from(unit.to_bytes()?),
            kind: UnitKind::Executable,
        })
    }

    /// Executable unit from already-encoded bytes
    pub fn from_encoded(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: Arc::from(bytes.into()),
            kind: UnitKind::Executable,
        }
    }

    pub fn data(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: Arc::from(bytes.into()),
            kind: UnitKind::Data,
        }
    }

    pub fn is_executable(&self) -> bool {
        self.kind == UnitKind::Executable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_unit() -> Unit {
        let mut unit = Unit::new("app.main");
        let hello = unit.add_constant(Constant::Str("hello".into())).unwrap();
        unit.add_constant(Constant::Int(-42)).unwrap();
        unit.methods.push(Method {
            name: "run".into(),
            arity: 1,
            locals: 2,
            flags: Method::SYNCHRONIZED,
            code: encode_all(&[Insn::Const(hello), Insn::Return]),
            handlers: vec![Handler {
                start: 0,
                end: 3,
                target: 3,
                catch: None,
            }],
        });
        unit
    }

    #[test]
    fn test_unit_to_bytes_header() {
        let bytes = sample_unit().to_bytes().unwrap();
        assert_eq!(&bytes[0..4], b"CAPS");
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), UNIT_FORMAT_VERSION);
    }

    #[test]
    fn test_unit_from_bytes_restores_unit() {
        let unit = sample_unit();
        assert_eq!(Unit::from_bytes(&unit.to_bytes().unwrap()).unwrap(), unit);
    }

    #[test]
    fn test_oversized_name_is_rejected() {
        let unit = Unit::new("n".repeat(usize::from(u16::MAX) + 1));
        assert_eq!(
            unit.to_bytes(),
            Err(UnitFormatError::TooLarge {
                what: "name length",
                len: 65536
            })
        );
    }

    #[test]
    fn test_handler_count_must_fit() {
        let mut unit = sample_unit();
        let handler = unit.methods[0].handlers[0];
        unit.methods[0].handlers = vec![handler; usize::from(u16::MAX) + 1];
        assert!(matches!(
            unit.to_bytes(),
            Err(UnitFormatError::TooLarge { what: "handler count", .. })
        ));
        assert!(CodeUnit::executable(&unit).is_err());

        unit.methods[0].handlers.pop();
        assert!(unit.to_bytes().is_ok());
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(
            Unit::from_bytes(b"NOPE\x00\x01"),
            Err(UnitFormatError::BadMagic)
        );
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = sample_unit().to_bytes().unwrap();
        bytes[5] = 9;
        assert_eq!(
            Unit::from_bytes(&bytes),
            Err(UnitFormatError::UnsupportedVersion { found: 9 })
        );
    }

    #[test]
    fn test_truncated_unit() {
        let bytes = sample_unit().to_bytes().unwrap();
        assert!(matches!(
            Unit::from_bytes(&bytes[..bytes.len() - 3]),
            Err(UnitFormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_add_constant_dedups() {
        let mut unit = Unit::new("u");
        let a = unit.add_constant(Constant::Str("x".into()));
        let b = unit.add_constant(Constant::Str("x".into()));
        assert_eq!(a, b);
        assert_eq!(unit.constants.len(), 1);
    }

    #[test]
    fn test_insert_prologue_shifts_offsets() {
        let mut method = Method {
            name: "loop".into(),
            arity: 0,
            locals: 0,
            flags: 0,
            code: encode_all(&[Insn::Null, Insn::Pop, Insn::Jump(0)]),
            handlers: vec![Handler {
                start: 0,
                end: 2,
                target: 2,
                catch: None,
            }],
        };

        method.insert_prologue(&[Insn::True, Insn::Pop]).unwrap();

        let decoded = decode_all(&method.code).unwrap();
        assert_eq!(decoded[4], (4, Insn::Jump(2)));
        assert_eq!(
            method.handlers[0],
            Handler {
                start: 2,
                end: 4,
                target: 4,
                catch: None
            }
        );
    }
}
