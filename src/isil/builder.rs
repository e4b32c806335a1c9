//! Address-stamped construction of ISIL node sequences.

use tracing::warn;

use crate::core::address::VirtualAddress;
use crate::isil::node::IsilNode;
use crate::isil::opcode::{IsilCondition, IsilOpcode};
use crate::isil::operand::IsilOperand;
use crate::keyfunctions::KeyFunctionRole;

/// Collects nodes for one method. Every node is stamped with the address
/// of the instruction currently being lowered.
#[derive(Debug, Default)]
pub struct IsilBuilder {
    nodes: Vec<IsilNode>,
    address: VirtualAddress,
    emit_nops: bool,
}

impl IsilBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep explicit `Nop` nodes for padding instructions.
    pub fn with_nops(mut self, emit_nops: bool) -> Self {
        self.emit_nops = emit_nops;
        self
    }

    pub fn set_address(&mut self, address: VirtualAddress) {
        self.address = address;
    }

    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Emit a node. An operand shape the opcode rejects degrades to
    /// `NotImplemented` so one odd instruction cannot abort lowering; only
    /// an accepted node is handed back.
    pub fn emit(
        &mut self,
        opcode: IsilOpcode,
        operands: Vec<IsilOperand>,
    ) -> Option<&mut IsilNode> {
        match IsilNode::new(self.address, opcode, operands) {
            Ok(node) => {
                self.nodes.push(node);
                self.nodes.last_mut()
            }
            Err(e) => {
                warn!(
                    address = format_args!("{:#x}", self.address),
                    error = %e,
                    "Degrading invalid ISIL node"
                );
                self.nodes.push(IsilNode::not_implemented(self.address, e.to_string()));
                None
            }
        }
    }

    pub fn move_(&mut self, dst: IsilOperand, src: IsilOperand) {
        self.emit(IsilOpcode::Move, vec![dst, src]);
    }

    pub fn load_address(&mut self, dst: IsilOperand, src: IsilOperand) {
        self.emit(IsilOpcode::LoadAddress, vec![dst, src]);
    }

    /// Three-operand arithmetic or logic.
    pub fn binary(
        &mut self,
        opcode: IsilOpcode,
        dst: IsilOperand,
        lhs: IsilOperand,
        rhs: IsilOperand,
    ) {
        self.emit(opcode, vec![dst, lhs, rhs]);
    }

    pub fn unary(&mut self, opcode: IsilOpcode, dst: IsilOperand, src: IsilOperand) {
        self.emit(opcode, vec![dst, src]);
    }

    pub fn compare(&mut self, lhs: IsilOperand, rhs: IsilOperand) {
        self.emit(IsilOpcode::Compare, vec![lhs, rhs]);
    }

    pub fn test(&mut self, lhs: IsilOperand, rhs: IsilOperand) {
        self.emit(IsilOpcode::Test, vec![lhs, rhs]);
    }

    /// Positive `delta` releases stack, negative allocates.
    pub fn shift_stack(&mut self, delta: i64) {
        self.emit(IsilOpcode::ShiftStack, vec![IsilOperand::imm(delta)]);
    }

    pub fn push(&mut self, src: IsilOperand) {
        self.emit(IsilOpcode::Push, vec![src]);
    }

    pub fn pop(&mut self, dst: IsilOperand) {
        self.emit(IsilOpcode::Pop, vec![dst]);
    }

    pub fn goto(&mut self, target: IsilOperand) {
        self.emit(IsilOpcode::Goto, vec![target]);
    }

    pub fn jump_if(&mut self, condition: IsilCondition, target: IsilOperand) {
        self.emit(IsilOpcode::JumpIf(condition), vec![target]);
    }

    pub fn call(&mut self, target: IsilOperand, role: Option<KeyFunctionRole>) {
        let opcode = if role.is_some_and(|r| r.is_no_return()) {
            IsilOpcode::CallNoReturn
        } else {
            IsilOpcode::Call
        };
        if let Some(node) = self.emit(opcode, vec![target]) {
            node.key_function = role;
        }
    }

    pub fn ret(&mut self, value: Option<IsilOperand>) {
        self.emit(IsilOpcode::Return, value.into_iter().collect());
    }

    pub fn interrupt(&mut self) {
        self.emit(IsilOpcode::Interrupt, vec![]);
    }

    /// Padding: nothing, or a `Nop` when configured.
    pub fn nop(&mut self) {
        if self.emit_nops {
            self.emit(IsilOpcode::Nop, vec![]);
        }
    }

    pub fn not_implemented(&mut self, text: impl Into<String>) {
        self.nodes.push(IsilNode::not_implemented(self.address, text));
    }

    /// Attach `note` to every node emitted since the builder held `start` nodes.
    pub fn annotate_since(&mut self, start: usize, note: &str) {
        for node in self.nodes.iter_mut().skip(start) {
            node.note = Some(note.to_string());
        }
    }

    pub fn finish(self) -> Vec<IsilNode> {
        self.nodes
    }
}
