//! ISIL operands.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `[base + index * scale + addend]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsilMemoryOperand {
    pub base: Option<String>,
    pub index: Option<String>,
    pub scale: u8,
    pub addend: i64,
}

impl IsilMemoryOperand {
    pub fn absolute(address: i64) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            addend: address,
        }
    }

    pub fn based(base: impl Into<String>, addend: i64) -> Self {
        Self {
            base: Some(base.into()),
            index: None,
            scale: 1,
            addend,
        }
    }

    /// Same operand displaced by `delta` bytes.
    pub fn offset_by(&self, delta: i64) -> Self {
        Self {
            addend: self.addend.wrapping_add(delta),
            ..self.clone()
        }
    }
}

impl fmt::Display for IsilMemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(base) = &self.base {
            parts.push(base.clone());
        }
        if let Some(index) = &self.index {
            if self.scale > 1 {
                parts.push(format!("{}*{}", index, self.scale));
            } else {
                parts.push(index.clone());
            }
        }
        if self.addend != 0 || parts.is_empty() {
            if parts.is_empty() {
                parts.push(format!("{:#x}", self.addend));
            } else if self.addend < 0 {
                return write!(f, "[{}-{:#x}]", parts.join("+"), self.addend.unsigned_abs());
            } else {
                parts.push(format!("{:#x}", self.addend));
            }
        }
        write!(f, "[{}]", parts.join("+"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsilOperandKind {
    Register,
    Immediate,
    Memory,
    Stack,
}

/// One operand of an ISIL node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsilOperand {
    /// Architecture register, normalized to its full-width name
    Register(String),
    Immediate(i64),
    Memory(IsilMemoryOperand),
    /// Slot at the given offset from the current stack pointer
    Stack(i64),
}

impl IsilOperand {
    pub fn reg(name: impl Into<String>) -> Self {
        IsilOperand::Register(name.into())
    }

    pub fn imm(value: i64) -> Self {
        IsilOperand::Immediate(value)
    }

    pub fn kind(&self) -> IsilOperandKind {
        match self {
            IsilOperand::Register(_) => IsilOperandKind::Register,
            IsilOperand::Immediate(_) => IsilOperandKind::Immediate,
            IsilOperand::Memory(_) => IsilOperandKind::Memory,
            IsilOperand::Stack(_) => IsilOperandKind::Stack,
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, IsilOperand::Immediate(_))
    }

    /// Memory or stack slot
    pub fn is_memory_like(&self) -> bool {
        matches!(self, IsilOperand::Memory(_) | IsilOperand::Stack(_))
    }

    pub fn as_immediate(&self) -> Option<i64> {
        match self {
            IsilOperand::Immediate(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<&str> {
        match self {
            IsilOperand::Register(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for IsilOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsilOperand::Register(r) => write!(f, "{}", r),
            IsilOperand::Immediate(v) if *v < 0 => write!(f, "-{:#x}", v.unsigned_abs()),
            IsilOperand::Immediate(v) => write!(f, "{:#x}", v),
            IsilOperand::Memory(m) => write!(f, "{}", m),
            IsilOperand::Stack(off) if *off < 0 => write!(f, "stack[-{:#x}]", off.unsigned_abs()),
            IsilOperand::Stack(off) => write!(f, "stack[{:#x}]", off),
        }
    }
}
