//! The ISIL operation vocabulary and its operand contract.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::isil::operand::IsilOperand;

/// Branch conditions share the decoder's normalized condition set.
pub use crate::core::instruction::Condition as IsilCondition;

/// Architecture-neutral operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsilOpcode {
    /// `dst <- src`
    Move,
    /// `dst <- &mem`
    LoadAddress,
    Exchange,
    /// `dst <- lhs op rhs`
    Add,
    Subtract,
    Multiply,
    Divide,
    ShiftLeft,
    ShiftRight,
    And,
    Or,
    Xor,
    /// `dst <- op src`
    Not,
    Negate,
    Compare,
    Test,
    /// Adjust the stack pointer by an immediate
    ShiftStack,
    Push,
    Pop,
    Goto,
    JumpIf(IsilCondition),
    Call,
    /// Call into a helper that never returns
    CallNoReturn,
    Return,
    Interrupt,
    Nop,
    /// Instruction with no modeled semantics
    NotImplemented,
}

/// How many operands an opcode takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    AtMost(usize),
}

impl Arity {
    fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == *k,
            Arity::AtLeast(k) => n >= *k,
            Arity::AtMost(k) => n <= *k,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(k) => write!(f, "{}", k),
            Arity::AtLeast(k) => write!(f, "at least {}", k),
            Arity::AtMost(k) => write!(f, "at most {}", k),
        }
    }
}

impl IsilOpcode {
    pub fn arity(&self) -> Arity {
        use IsilOpcode::*;
        match self {
            Move | LoadAddress | Exchange | Not | Negate | Compare | Test => Arity::Exactly(2),
            Add | Subtract | Multiply | Divide | ShiftLeft | ShiftRight | And | Or | Xor => {
                Arity::Exactly(3)
            }
            ShiftStack | Push | Pop | Goto | JumpIf(_) => Arity::Exactly(1),
            Call | CallNoReturn => Arity::AtLeast(1),
            Return => Arity::AtMost(1),
            Interrupt | Nop | NotImplemented => Arity::Exactly(0),
        }
    }

    /// The node transfers control away from the next node.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            IsilOpcode::Goto
                | IsilOpcode::JumpIf(_)
                | IsilOpcode::Call
                | IsilOpcode::CallNoReturn
                | IsilOpcode::Return
                | IsilOpcode::Interrupt
        )
    }

    fn writes_first_operand(&self) -> bool {
        use IsilOpcode::*;
        matches!(
            self,
            Move | LoadAddress
                | Exchange
                | Add
                | Subtract
                | Multiply
                | Divide
                | ShiftLeft
                | ShiftRight
                | And
                | Or
                | Xor
                | Not
                | Negate
                | Pop
        )
    }

    /// Check `operands` against this opcode's contract.
    pub fn validate(&self, operands: &[IsilOperand]) -> Result<(), String> {
        let arity = self.arity();
        if !arity.accepts(operands.len()) {
            return Err(format!(
                "expected {} operands, got {}",
                arity,
                operands.len()
            ));
        }

        if self.writes_first_operand() && operands[0].is_immediate() {
            return Err("destination cannot be an immediate".to_string());
        }

        match self {
            IsilOpcode::LoadAddress => {
                if operands[0].as_register().is_none() {
                    return Err("destination must be a register".to_string());
                }
                if !operands[1].is_memory_like() {
                    return Err("source must be a memory or stack reference".to_string());
                }
            }
            IsilOpcode::Exchange if operands[1].is_immediate() => {
                return Err("cannot exchange with an immediate".to_string());
            }
            IsilOpcode::Compare | IsilOpcode::Test
                if operands.iter().all(|o| o.is_immediate()) =>
            {
                return Err("comparison needs a non-constant operand".to_string());
            }
            IsilOpcode::ShiftStack if !operands[0].is_immediate() => {
                return Err("stack shift must be an immediate".to_string());
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for IsilOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsilOpcode::JumpIf(cond) => write!(f, "JumpIf({:?})", cond),
            other => write!(f, "{:?}", other),
        }
    }
}
