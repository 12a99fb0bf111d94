//! Unit serialization and deserialization

use super::{Constant, Handler, Method, UnitFormatError};

const TAG_INT: u8 = 0x01;
const TAG_STR: u8 = 0x02;
const NO_CATCH: u16 = 0xFFFF;

/// Cursor over an encoded unit
pub(super) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(super) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(super) fn position(&self) -> usize {
        self.pos
    }

    pub(super) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(super) fn take(&mut self, n: usize) -> Result<&'a [u8], UnitFormatError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(UnitFormatError::Truncated { offset: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(super) fn u8(&mut self) -> Result<u8, UnitFormatError> {
        Ok(self.take(1)?[0])
    }

    pub(super) fn u16(&mut self) -> Result<u16, UnitFormatError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(super) fn u32(&mut self) -> Result<u32, UnitFormatError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(super) fn i64(&mut self) -> Result<i64, UnitFormatError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_be_bytes(buf))
    }

    /// u16-length-prefixed UTF-8 name
    pub(super) fn name(&mut self) -> Result<String, UnitFormatError> {
        let offset = self.pos;
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| UnitFormatError::InvalidUtf8 { offset })
    }

    /// u32-length-prefixed UTF-8 text
    pub(super) fn text(&mut self) -> Result<String, UnitFormatError> {
        let offset = self.pos;
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| UnitFormatError::InvalidUtf8 { offset })
    }
}

/// Length prefix of type `T`, or an error when `len` does not fit
pub(super) fn length<T: TryFrom<usize>>(what: &'static str, len: usize) -> Result<T, UnitFormatError> {
    T::try_from(len).map_err(|_| UnitFormatError::TooLarge { what, len })
}

pub(super) fn write_name(name: &str, bytes: &mut Vec<u8>) -> Result<(), UnitFormatError> {
    bytes.extend_from_slice(&length::<u16>("name length", name.len())?.to_be_bytes());
    bytes.extend_from_slice(name.as_bytes());
    Ok(())
}

pub(super) fn write_constant(constant: &Constant, bytes: &mut Vec<u8>) -> Result<(), UnitFormatError> {
    match constant {
        Constant::Int(n) => {
            bytes.push(TAG_INT);
            bytes.extend_from_slice(&n.to_be_bytes());
        }
        Constant::Str(s) => {
            bytes.push(TAG_STR);
            bytes.extend_from_slice(&length::<u32>("string constant", s.len())?.to_be_bytes());
            bytes.extend_from_slice(s.as_bytes());
        }
    }
    Ok(())
}

pub(super) fn read_constant(reader: &mut Reader<'_>) -> Result<Constant, UnitFormatError> {
    let offset = reader.position();
    match reader.u8()? {
        TAG_INT => Ok(Constant::Int(reader.i64()?)),
        TAG_STR => Ok(Constant::Str(reader.text()?)),
        tag => Err(UnitFormatError::UnknownConstantTag { tag, offset }),
    }
}

pub(super) fn write_method(method: &Method, bytes: &mut Vec<u8>) -> Result<(), UnitFormatError> {
    write_name(&method.name, bytes)?;
    bytes.push(method.arity);
    bytes.extend_from_slice(&method.locals.to_be_bytes());
    bytes.push(method.flags);

    bytes.extend_from_slice(&length::<u32>("code length", method.code.len())?.to_be_bytes());
    bytes.extend_from_slice(&method.code);

    bytes.extend_from_slice(&length::<u16>("handler count", method.handlers.len())?.to_be_bytes());
    for handler in &method.handlers {
        bytes.extend_from_slice(&handler.start.to_be_bytes());
        bytes.extend_from_slice(&handler.end.to_be_bytes());
        bytes.extend_from_slice(&handler.target.to_be_bytes());
        bytes.extend_from_slice(&handler.catch.unwrap_or(NO_CATCH).to_be_bytes());
    }
    Ok(())
}

pub(super) fn read_method(reader: &mut Reader<'_>) -> Result<Method, UnitFormatError> {
    let name = reader.name()?;
    let arity = reader.u8()?;
    let locals = reader.u16()?;
    let flags = reader.u8()?;

    let code_len = reader.u32()? as usize;
    let code = reader.take(code_len)?.to_vec();

    let handler_count = reader.u16()? as usize;
    let mut handlers = Vec::with_capacity(handler_count);
    for _ in 0..handler_count {
        let start = reader.u32()?;
        let end = reader.u32()?;
        let target = reader.u32()?;
        let catch = match reader.u16()? {
            NO_CATCH => None,
            index => Some(index),
        };
        handlers.push(Handler {
            start,
            end,
            target,
            catch,
        });
    }

    Ok(Method {
        name,
        arity,
        locals,
        flags,
        code,
        handlers,
    })
}
