//! Instruction set
//!
//! Stack-based instructions organized by category. Operands are encoded
//! big-endian directly after the opcode byte.

/// Bytecode opcode
///
/// Explicit byte values keep the encoding stable across releases.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Constants (0x01-0x0F) =====
    /// Push constant from pool [u16 index]
    Const = 0x01,
    /// Push null
    Null = 0x02,
    /// Push true
    True = 0x03,
    /// Push false
    False = 0x04,

    // ===== Locals (0x10-0x1F) =====
    /// Push local [u16 index]
    Load = 0x10,
    /// Pop into local [u16 index]
    Store = 0x11,

    // ===== Arithmetic (0x20-0x2F) =====
    /// Pop b, pop a, push a + b
    Add = 0x20,
    /// Pop b, pop a, push a - b
    Sub = 0x21,
    /// Pop b, pop a, push a * b
    Mul = 0x22,
    /// Pop b, pop a, push a / b
    Div = 0x23,
    /// Pop b, pop a, push a % b
    Mod = 0x24,
    /// Pop a, push -a
    Neg = 0x25,
    /// Pop b, pop a, push display(a) ++ display(b)
    Concat = 0x26,

    // ===== Comparison (0x30-0x3F) =====
    Eq = 0x30,
    Ne = 0x31,
    Lt = 0x32,
    Le = 0x33,
    Gt = 0x34,
    Ge = 0x35,

    // ===== Logical (0x40-0x4F) =====
    /// Pop a, push !a
    Not = 0x40,

    // ===== Control flow (0x50-0x5F) =====
    /// Jump to absolute offset [u32]
    Jump = 0x50,
    /// Pop condition, jump to absolute offset if false [u32]
    JumpIfFalse = 0x51,

    // ===== Calls (0x60-0x6F) =====
    /// Invoke `unit::method` named by a string constant [u16 target, u8 argc]
    Invoke = 0x60,
    /// Pop return value and leave the method
    Return = 0x61,

    // ===== Lists (0x70-0x7F) =====
    /// Pop n values into a new list [u16 count]
    NewList = 0x70,
    /// Pop index, pop list, push list[index]
    GetIndex = 0x71,
    /// Pop value, pop index, pop list, list[index] = value
    SetIndex = 0x72,
    /// Pop list or string, push its length
    Len = 0x73,

    // ===== Stack (0x80-0x8F) =====
    Pop = 0x80,
    Dup = 0x81,
    Swap = 0x82,

    // ===== Faults (0x90-0x9F) =====
    /// Pop message, throw a fault of the kind named by a string constant [u16]
    Throw = 0x90,
    /// Pop a caught fault and throw it again
    Rethrow = 0x91,

    // ===== Monitors and units (0xA0-0xAF) =====
    /// Pop a value and acquire its monitor
    MonitorEnter = 0xA0,
    /// Pop a value and release its monitor
    MonitorExit = 0xA1,
    /// Push a reference to the unit named by a string constant [u16]
    UnitRef = 0xA2,

    // ===== Instrumentation (0xE0-0xEF) =====
    // Emitted only by the rewriter; rejected in submitted units.
    /// Verify the calling thread still belongs to this task
    EnterCheck = 0xE0,
    /// Re-examine the fault on top of the stack at a handler entry
    ValidateCaught = 0xE1,
    /// Pop a value and acquire its monitor in the task's own table
    TaskMonitorEnter = 0xE2,
    /// Pop a value and release its monitor in the task's own table
    TaskMonitorExit = 0xE3,
    /// Deny the forbidden call named by a string constant [u16]
    Trap = 0xE4,
}

impl Opcode {
    /// Number of operand bytes following the opcode
    pub fn operand_len(self) -> usize {
        match self {
            Opcode::Const
            | Opcode::Load
            | Opcode::Store
            | Opcode::NewList
            | Opcode::Throw
            | Opcode::UnitRef
            | Opcode::Trap => 2,
            Opcode::Invoke => 3,
            Opcode::Jump | Opcode::JumpIfFalse => 4,
            _ => 0,
        }
    }

    /// Opcodes only the rewriter may produce
    pub fn is_instrumentation(self) -> bool {
        (self as u8) >= 0xE0
    }

    /// Instructions after which control never falls through
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Return | Opcode::Jump | Opcode::Throw | Opcode::Rethrow
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(Opcode::Const),
            0x02 => Ok(Opcode::Null),
            0x03 => Ok(Opcode::True),
            0x04 => Ok(Opcode::False),
            0x10 => Ok(Opcode::Load),
            0x11 => Ok(Opcode::Store),
            0x20 => Ok(Opcode::Add),
            0x21 => Ok(Opcode::Sub),
            0x22 => Ok(Opcode::Mul),
            0x23 => Ok(Opcode::Div),
            0x24 => Ok(Opcode::Mod),
            0x25 => Ok(Opcode::Neg),
            0x26 => Ok(Opcode::Concat),
            0x30 => Ok(Opcode::Eq),
            0x31 => Ok(Opcode::Ne),
            0x32 => Ok(Opcode::Lt),
            0x33 => Ok(Opcode::Le),
            0x34 => Ok(Opcode::Gt),
            0x35 => Ok(Opcode::Ge),
            0x40 => Ok(Opcode::Not),
            0x50 => Ok(Opcode::Jump),
            0x51 => Ok(Opcode::JumpIfFalse),
            0x60 => Ok(Opcode::Invoke),
            0x61 => Ok(Opcode::Return),
            0x70 => Ok(Opcode::NewList),
            0x71 => Ok(Opcode::GetIndex),
            0x72 => Ok(Opcode::SetIndex),
            0x73 => Ok(Opcode::Len),
            0x80 => Ok(Opcode::Pop),
            0x81 => Ok(Opcode::Dup),
            0x82 => Ok(Opcode::Swap),
            0x90 => Ok(Opcode::Throw),
            0x91 => Ok(Opcode::Rethrow),
            0xA0 => Ok(Opcode::MonitorEnter),
            0xA1 => Ok(Opcode::MonitorExit),
            0xA2 => Ok(Opcode::UnitRef),
            0xE0 => Ok(Opcode::EnterCheck),
            0xE1 => Ok(Opcode::ValidateCaught),
            0xE2 => Ok(Opcode::TaskMonitorEnter),
            0xE3 => Ok(Opcode::TaskMonitorExit),
            0xE4 => Ok(Opcode::Trap),
            _ => Err(()),
        }
    }
}
