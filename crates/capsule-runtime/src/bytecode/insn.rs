//! Decoded instructions
//!
//! `Insn` is the structured form of one instruction. Jump operands hold
//! absolute byte offsets into the method's code.

use super::opcode::Opcode;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insn {
    Const(u16),
    Null,
    True,
    False,
    Load(u16),
    Store(u16),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    Jump(u32),
    JumpIfFalse(u32),
    Invoke { target: u16, argc: u8 },
    Return,
    NewList(u16),
    GetIndex,
    SetIndex,
    Len,
    Pop,
    Dup,
    Swap,
    Throw(u16),
    Rethrow,
    MonitorEnter,
    MonitorExit,
    UnitRef(u16),
    EnterCheck,
    ValidateCaught,
    TaskMonitorEnter,
    TaskMonitorExit,
    Trap(u16),
}

/// Instruction decoding failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {byte:#04x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },
    #[error("instruction {opcode:?} at offset {offset} is truncated")]
    Truncated { offset: usize, opcode: Opcode },
}

impl Insn {
    pub fn opcode(&self) -> Opcode {
        match self {
            Insn::Const(_) => Opcode::Const,
            Insn::Null => Opcode::Null,
            Insn::True => Opcode::True,
            Insn::False => Opcode::False,
            Insn::Load(_) => Opcode::Load,
            Insn::Store(_) => Opcode::Store,
            Insn::Add => Opcode::Add,
            Insn::Sub => Opcode::Sub,
            Insn::Mul => Opcode::Mul,
            Insn::Div => Opcode::Div,
            Insn::Mod => Opcode::Mod,
            Insn::Neg => Opcode::Neg,
            Insn::Concat => Opcode::Concat,
            Insn::Eq => Opcode::Eq,
            Insn::Ne => Opcode::Ne,
            Insn::Lt => Opcode::Lt,
            Insn::Le => Opcode::Le,
            Insn::Gt => Opcode::Gt,
            Insn::Ge => Opcode::Ge,
            Insn::Not => Opcode::Not,
            Insn::Jump(_) => Opcode::Jump,
            Insn::JumpIfFalse(_) => Opcode::JumpIfFalse,
            Insn::Invoke { .. } => Opcode::Invoke,
            Insn::Return => Opcode::Return,
            Insn::NewList(_) => Opcode::NewList,
            Insn::GetIndex => Opcode::GetIndex,
            Insn::SetIndex => Opcode::SetIndex,
            Insn::Len => Opcode::Len,
            Insn::Pop => Opcode::Pop,
            Insn::Dup => Opcode::Dup,
            Insn::Swap => Opcode::Swap,
            Insn::Throw(_) => Opcode::Throw,
            Insn::Rethrow => Opcode::Rethrow,
            Insn::MonitorEnter => Opcode::MonitorEnter,
            Insn::MonitorExit => Opcode::MonitorExit,
            Insn::UnitRef(_) => Opcode::UnitRef,
            Insn::EnterCheck => Opcode::EnterCheck,
            Insn::ValidateCaught => Opcode::ValidateCaught,
            Insn::TaskMonitorEnter => Opcode::TaskMonitorEnter,
            Insn::TaskMonitorExit => Opcode::TaskMonitorExit,
            Insn::Trap(_) => Opcode::Trap,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        1 + self.opcode().operand_len()
    }

    /// Jump destination, if this is a jump
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Insn::Jump(t) | Insn::JumpIfFalse(t) => Some(*t),
            _ => None,
        }
    }

    /// Same instruction with its jump destination replaced
    pub fn with_jump_target(self, target: u32) -> Self {
        match self {
            Insn::Jump(_) => Insn::Jump(target),
            Insn::JumpIfFalse(_) => Insn::JumpIfFalse(target),
            other => other,
        }
    }

    /// Constant-pool index referenced by this instruction
    pub fn constant_ref(&self) -> Option<u16> {
        match self {
            Insn::Const(i) | Insn::Throw(i) | Insn::UnitRef(i) | Insn::Trap(i) => Some(*i),
            Insn::Invoke { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        match *self {
            Insn::Const(i)
            | Insn::Load(i)
            | Insn::Store(i)
            | Insn::NewList(i)
            | Insn::Throw(i)
            | Insn::UnitRef(i)
            | Insn::Trap(i) => out.extend_from_slice(&i.to_be_bytes()),
            Insn::Invoke { target, argc } => {
                out.extend_from_slice(&target.to_be_bytes());
                out.push(argc);
            }
            Insn::Jump(t) | Insn::JumpIfFalse(t) => out.extend_from_slice(&t.to_be_bytes()),
            _ => {}
        }
    }
}

/// Decode the instruction starting at `offset`; returns it with its length
pub fn decode_at(code: &[u8], offset: usize) -> Result<(Insn, usize), DecodeError> {
    let byte = *code
        .get(offset)
        .ok_or(DecodeError::UnknownOpcode { offset, byte: 0 })?;
    let opcode =
        Opcode::try_from(byte).map_err(|_| DecodeError::UnknownOpcode { offset, byte })?;
    let len = 1 + opcode.operand_len();
    let operands = code
        .get(offset + 1..offset + len)
        .ok_or(DecodeError::Truncated { offset, opcode })?;

    let u16_at = |i: usize| u16::from_be_bytes([operands[i], operands[i + 1]]);

    let insn = match opcode {
        Opcode::Const => Insn::Const(u16_at(0)),
        Opcode::Null => Insn::Null,
        Opcode::True => Insn::True,
        Opcode::False => Insn::False,
        Opcode::Load => Insn::Load(u16_at(0)),
        Opcode::Store => Insn::Store(u16_at(0)),
        Opcode::Add => Insn::Add,
        Opcode::Sub => Insn::Sub,
        Opcode::Mul => Insn::Mul,
        Opcode::Div => Insn::Div,
        Opcode::Mod => Insn::Mod,
        Opcode::Neg => Insn::Neg,
        Opcode::Concat => Insn::Concat,
        Opcode::Eq => Insn::Eq,
        Opcode::Ne => Insn::Ne,
        Opcode::Lt => Insn::Lt,
        Opcode::Le => Insn::Le,
        Opcode::Gt => Insn::Gt,
        Opcode::Ge => Insn::Ge,
        Opcode::Not => Insn::Not,
        Opcode::Jump | Opcode::JumpIfFalse => {
            let target = u32::from_be_bytes([operands[0], operands[1], operands[2], operands[3]]);
            if opcode == Opcode::Jump {
                Insn::Jump(target)
            } else {
                Insn::JumpIfFalse(target)
            }
        }
        Opcode::Invoke => Insn::Invoke {
            target: u16_at(0),
            argc: operands[2],
        },
        Opcode::Return => Insn::Return,
        Opcode::NewList => Insn::NewList(u16_at(0)),
        Opcode::GetIndex => Insn::GetIndex,
        Opcode::SetIndex => Insn::SetIndex,
        Opcode::Len => Insn::Len,
        Opcode::Pop => Insn::Pop,
        Opcode::Dup => Insn::Dup,
        Opcode::Swap => Insn::Swap,
        Opcode::Throw => Insn::Throw(u16_at(0)),
        Opcode::Rethrow => Insn::Rethrow,
        Opcode::MonitorEnter => Insn::MonitorEnter,
        Opcode::MonitorExit => Insn::MonitorExit,
        Opcode::UnitRef => Insn::UnitRef(u16_at(0)),
        Opcode::EnterCheck => Insn::EnterCheck,
        Opcode::ValidateCaught => Insn::ValidateCaught,
        Opcode::TaskMonitorEnter => Insn::TaskMonitorEnter,
        Opcode::TaskMonitorExit => Insn::TaskMonitorExit,
        Opcode::Trap => Insn::Trap(u16_at(0)),
    };

    Ok((insn, len))
}

/// Decode a whole method body into `(offset, insn)` pairs
pub fn decode_all(code: &[u8]) -> Result<Vec<(u32, Insn)>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let (insn, len) = decode_at(code, offset)?;
        out.push((offset as u32, insn));
        offset += len;
    }
    Ok(out)
}

/// Encode instructions back to back
pub fn encode_all(insns: &[Insn]) -> Vec<u8> {
    let mut out = Vec::with_capacity(insns.iter().map(Insn::encoded_len).sum());
    for insn in insns {
        insn.encode(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_operands() {
        let code = encode_all(&[
            Insn::Const(0x0102),
            Insn::Invoke {
                target: 7,
                argc: 2,
            },
            Insn::Jump(0xA0B0C0D0),
        ]);

        let decoded = decode_all(&code).unwrap();
        assert_eq!(
            decoded,
            vec![
                (0, Insn::Const(0x0102)),
                (
                    3,
                    Insn::Invoke {
                        target: 7,
                        argc: 2
                    }
                ),
                (7, Insn::Jump(0xA0B0C0D0)),
            ]
        );
    }

    #[test]
    fn test_truncated_operand() {
        let code = [Opcode::Load as u8, 0x00];
        assert!(matches!(
            decode_at(&code, 0),
            Err(DecodeError::Truncated {
                offset: 0,
                opcode: Opcode::Load
            })
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            decode_all(&[0x61, 0xEE]),
            Err(DecodeError::UnknownOpcode {
                offset: 1,
                byte: 0xEE
            })
        ));
    }
}
