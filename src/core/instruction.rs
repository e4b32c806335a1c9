//! Instruction and Operand types for decoded machine instructions.
//!
//! `Instruction` is the architecture-neutral record every decoder backend
//! produces. Besides the textual mnemonic and structured operands it carries
//! the control-flow classification the CFG builder needs, so the builder
//! never has to interpret mnemonics itself.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::VirtualAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandKind {
    Register,
    Immediate,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

/// One decoded operand. Only the fields matching `kind` are populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    /// Width in bits, 0 when the backend does not report it
    pub size: u8,
    pub access: Access,
    /// Rendered operand, for diagnostics only
    pub text: String,
    pub register: Option<String>,
    pub immediate: Option<i64>,
    pub displacement: Option<i64>,
    pub scale: Option<u8>,
    pub base: Option<String>,
    pub index: Option<String>,
    /// Base update: a pre-indexed memory operand (`[sp, #-16]!`) or a
    /// block-transfer base register (`ldm r4!, {..}`)
    #[serde(default)]
    pub writeback: bool,
}

fn hex_signed(value: i64) -> String {
    if value < 0 {
        format!("-{:#x}", value.unsigned_abs())
    } else {
        format!("{:#x}", value)
    }
}

impl Operand {
    fn bare(kind: OperandKind, size: u8, access: Access, text: String) -> Self {
        Self {
            kind,
            size,
            access,
            text,
            register: None,
            immediate: None,
            displacement: None,
            scale: None,
            base: None,
            index: None,
            writeback: false,
        }
    }

    pub fn register(name: impl Into<String>, size: u8, access: Access) -> Self {
        let name = name.into();
        Self {
            register: Some(name.clone()),
            ..Self::bare(OperandKind::Register, size, access, name)
        }
    }

    pub fn immediate(value: i64, size: u8) -> Self {
        Self {
            immediate: Some(value),
            ..Self::bare(OperandKind::Immediate, size, Access::Read, hex_signed(value))
        }
    }

    /// `[base + index * scale +/- disp]`; every part is optional.
    pub fn memory(
        size: u8,
        access: Access,
        displacement: Option<i64>,
        base: Option<String>,
        index: Option<String>,
        scale: Option<u8>,
    ) -> Self {
        let mut terms: Vec<String> = base.iter().cloned().collect();
        if let Some(index) = &index {
            match scale {
                Some(s) if s > 1 => terms.push(format!("{} * {}", index, s)),
                _ => terms.push(index.clone()),
            }
        }
        let mut text = terms.join(" + ");
        match displacement {
            Some(d) if terms.is_empty() => text = hex_signed(d),
            Some(d) if d > 0 => text.push_str(&format!(" + {:#x}", d)),
            Some(d) if d < 0 => text.push_str(&format!(" - {:#x}", d.unsigned_abs())),
            _ => {}
        }

        Self {
            displacement,
            scale,
            base,
            index,
            ..Self::bare(OperandKind::Memory, size, access, format!("[{}]", text))
        }
    }

    /// Mark a memory operand as pre-indexed, or a base register as updated.
    pub fn with_writeback(mut self) -> Self {
        let updatable = self.is_memory() || self.kind == OperandKind::Register;
        if updatable && !self.writeback {
            self.writeback = true;
            self.text.push('!');
        }
        self
    }

    pub fn is_immediate(&self) -> bool {
        self.kind == OperandKind::Immediate
    }

    pub fn is_memory(&self) -> bool {
        self.kind == OperandKind::Memory
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// How an instruction transfers control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowControl {
    /// Execution continues with the next instruction
    Next,
    /// Direct unconditional branch
    Branch,
    /// Direct conditional branch; falls through when not taken
    ConditionalBranch,
    /// Branch through a register or memory operand
    IndirectBranch,
    /// Direct call
    Call,
    /// Call through a register or memory operand
    IndirectCall,
    /// Return to the caller
    Return,
    /// Trap/breakpoint/undefined instruction; execution does not continue
    Interrupt,
}

impl FlowControl {
    /// True when this instruction closes a basic block regardless of policy.
    pub fn ends_block(&self) -> bool {
        !matches!(self, FlowControl::Next | FlowControl::Call | FlowControl::IndirectCall)
    }

    pub fn is_call(&self) -> bool {
        matches!(self, FlowControl::Call | FlowControl::IndirectCall)
    }
}

/// Branch condition, normalized across architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Equal,
    NotEqual,
    /// Signed greater than
    Greater,
    /// Signed greater than or equal
    GreaterOrEqual,
    /// Signed less than
    Less,
    /// Signed less than or equal
    LessOrEqual,
    /// Unsigned greater than
    Above,
    /// Unsigned greater than or equal
    AboveOrEqual,
    /// Unsigned less than
    Below,
    /// Unsigned less than or equal
    BelowOrEqual,
    Sign,
    NotSign,
    Overflow,
    NotOverflow,
    Parity,
    NotParity,
}

impl Condition {
    /// Parse the ARM condition-code suffix (`eq`, `ne`, `hs`, ...).
    pub fn from_arm_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "eq" => Condition::Equal,
            "ne" => Condition::NotEqual,
            "hs" | "cs" => Condition::AboveOrEqual,
            "lo" | "cc" => Condition::Below,
            "mi" => Condition::Sign,
            "pl" => Condition::NotSign,
            "vs" => Condition::Overflow,
            "vc" => Condition::NotOverflow,
            "hi" => Condition::Above,
            "ls" => Condition::BelowOrEqual,
            "ge" => Condition::GreaterOrEqual,
            "lt" => Condition::Less,
            "gt" => Condition::Greater,
            "le" => Condition::LessOrEqual,
            _ => return None,
        })
    }
}

/// Decoded instruction at a specific address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Address where this instruction is located
    pub address: VirtualAddress,
    /// Raw bytes of the instruction
    pub bytes: Vec<u8>,
    /// Instruction mnemonic (e.g., "mov", "add", "b.eq")
    pub mnemonic: String,
    /// Structured operands
    pub operands: Vec<Operand>,
    /// Length of the instruction in bytes
    pub length: u16,
    /// Control-flow classification
    pub flow: FlowControl,
    /// Direct branch or call target, when statically known
    pub branch_target: Option<VirtualAddress>,
    /// Condition for conditional branches
    pub condition: Option<Condition>,
}

impl Instruction {
    /// Get the end address of this instruction (exclusive)
    pub fn end_address(&self) -> VirtualAddress {
        self.address.saturating_add(u64::from(self.length))
    }

    /// Get the number of operands
    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Get a human-readable disassembly string
    pub fn disassembly(&self) -> String {
        let mut result = format!("{:08x}: ", self.address);
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                result.push(' ');
            }
            result.push_str(&format!("{:02x}", byte));
        }
        while result.len() < 30 {
            result.push(' ');
        }
        result.push_str(&self.to_string());
        result
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operand_str = if self.operands.is_empty() {
            String::new()
        } else {
            let ops: Vec<String> = self.operands.iter().map(|op| op.to_string()).collect();
            format!(" {}", ops.join(", "))
        };

        write!(f, "{}{}", self.mnemonic, operand_str)
    }
}
