//! The ISIL node: one normalized operation tied to its source instruction.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::VirtualAddress;
use crate::error::{IsilError, Result};
use crate::isil::opcode::IsilOpcode;
use crate::isil::operand::IsilOperand;
use crate::keyfunctions::KeyFunctionRole;

/// An instruction-set-independent node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsilNode {
    /// Address of the machine instruction this node was derived from
    pub address: VirtualAddress,
    pub opcode: IsilOpcode,
    pub operands: Vec<IsilOperand>,
    /// Runtime helper role of a call target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_function: Option<KeyFunctionRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Long-form name used by hosts that mirror the IR vocabulary.
pub type InstructionSetIndependentNode = IsilNode;

impl IsilNode {
    /// Build a node, checking the opcode's operand contract.
    pub fn new(
        address: VirtualAddress,
        opcode: IsilOpcode,
        operands: Vec<IsilOperand>,
    ) -> Result<Self> {
        opcode
            .validate(&operands)
            .map_err(|reason| IsilError::InvalidNode { opcode, reason })?;
        Ok(Self {
            address,
            opcode,
            operands,
            key_function: None,
            note: None,
        })
    }

    pub fn not_implemented(address: VirtualAddress, note: impl Into<String>) -> Self {
        Self {
            address,
            opcode: IsilOpcode::NotImplemented,
            operands: Vec::new(),
            key_function: None,
            note: Some(note.into()),
        }
    }

    pub fn with_key_function(mut self, role: Option<KeyFunctionRole>) -> Self {
        self.key_function = role;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Direct target of a call or jump node.
    pub fn branch_target(&self) -> Option<VirtualAddress> {
        if !self.opcode.is_control_flow() {
            return None;
        }
        self.operands
            .first()
            .and_then(|o| o.as_immediate())
            .map(|v| v as u64)
    }
}

impl fmt::Display for IsilNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.address, self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " " } else { ", " }, op)?;
        }
        if let Some(role) = self.key_function {
            write!(f, " <{}>", role)?;
        }
        if let Some(note) = &self.note {
            write!(f, " ; {}", note)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isil::opcode::IsilCondition;

    #[test]
    fn test_valid_node() {
        let node = IsilNode::new(
            0x1000,
            IsilOpcode::Compare,
            vec![IsilOperand::reg("rax"), IsilOperand::imm(0)],
        )
        .unwrap();
        assert_eq!(node.to_string(), "0x1000: Compare rax, 0x0");
        assert_eq!(node.branch_target(), None);
    }

    #[test]
    fn test_invalid_node_is_rejected() {
        let err = IsilNode::new(0x1000, IsilOpcode::Move, vec![IsilOperand::reg("rax")])
            .unwrap_err();
        assert!(matches!(
            err,
            IsilError::InvalidNode {
                opcode: IsilOpcode::Move,
                ..
            }
        ));
    }

    #[test]
    fn test_call_display_and_target() {
        let node = IsilNode::new(0x1004, IsilOpcode::Call, vec![IsilOperand::imm(0x4000)])
            .unwrap()
            .with_key_function(Some(KeyFunctionRole::ObjectAllocator));
        assert_eq!(node.branch_target(), Some(0x4000));
        assert_eq!(node.to_string(), "0x1004: Call 0x4000 <object-allocator>");

        let jcc = IsilNode::new(
            0x1002,
            IsilOpcode::JumpIf(IsilCondition::Equal),
            vec![IsilOperand::imm(0x1009)],
        )
        .unwrap();
        assert_eq!(jcc.branch_target(), Some(0x1009));
    }

    #[test]
    fn test_serialized_form_omits_empty_fields() {
        let node = IsilNode::new(0x10, IsilOpcode::Return, vec![]).unwrap();
        let json = serde_json::to_string(&node).unwrap();
        assert!(!json.contains("key_function"));
        assert!(!json.contains("note"));
        let back: IsilNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
