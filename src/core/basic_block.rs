//! BasicBlock type for representing straight-line code regions.
//!
//! A block is a contiguous run of decoded instructions `[start, end)` with a
//! single entry at `start`. Its outgoing control edges, the calls it makes
//! and whether decoding stopped early are recorded on the block itself.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::{AddressRange, VirtualAddress};
use crate::core::control_flow_graph::{
    CallReference, ControlFlowEdge, ControlFlowEdgeKind, EdgeTarget,
};
use crate::core::instruction::Instruction;

/// Why a basic block ends where it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Terminator {
    /// The next instruction starts another block
    Fallthrough,
    /// Direct unconditional branch inside the method
    Branch,
    /// Direct conditional branch
    ConditionalBranch,
    /// Branch whose target is computed at run time
    IndirectBranch,
    /// Return to caller
    Return,
    /// Unconditional jump leaving the method
    TailCall,
    /// Call configured to close the block (call-return edge follows)
    Call,
    /// Call into a helper that never returns
    NoReturnCall,
    /// Trap or breakpoint instruction
    Trap,
    /// The next instruction could not be decoded
    DecodeFailure,
    /// Decoding ran past the end of the method body
    OutOfRange,
    /// Graph budgets ran out while this block was open
    BudgetExhausted,
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Terminator::Fallthrough => "fallthrough",
            Terminator::Branch => "branch",
            Terminator::ConditionalBranch => "conditional-branch",
            Terminator::IndirectBranch => "indirect-branch",
            Terminator::Return => "return",
            Terminator::TailCall => "tail-call",
            Terminator::Call => "call",
            Terminator::NoReturnCall => "no-return-call",
            Terminator::Trap => "trap",
            Terminator::DecodeFailure => "decode-failure",
            Terminator::OutOfRange => "out-of-range",
            Terminator::BudgetExhausted => "budget-exhausted",
        };
        f.write_str(s)
    }
}

/// BasicBlock represents a straight-line code region in one method's CFG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Starting address of the basic block
    pub start: VirtualAddress,
    /// Ending address of the basic block (exclusive)
    pub end: VirtualAddress,
    /// Decoded instructions in program order
    pub instructions: Vec<Instruction>,
    /// How the block ends
    pub terminator: Terminator,
    /// Outgoing control edges
    pub successors: Vec<ControlFlowEdge>,
    /// Calls made from inside this block
    pub calls: Vec<CallReference>,
    /// Decoding failed right after the last instruction
    pub truncated: bool,
}

impl BasicBlock {
    /// Create an empty block starting at `start`.
    pub fn new(start: VirtualAddress) -> Self {
        Self {
            start,
            end: start,
            instructions: Vec::new(),
            terminator: Terminator::Fallthrough,
            successors: Vec::new(),
            calls: Vec::new(),
            truncated: false,
        }
    }

    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.start, self.end)
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Append a decoded instruction and extend the block end.
    pub fn push(&mut self, instruction: Instruction) {
        self.end = instruction.end_address();
        self.instructions.push(instruction);
    }

    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Check whether an instruction starts exactly at `addr`.
    pub fn has_instruction_at(&self, addr: VirtualAddress) -> bool {
        self.instructions
            .binary_search_by_key(&addr, |i| i.address)
            .is_ok()
    }

    /// Add an outgoing edge.
    pub fn add_successor(&mut self, kind: ControlFlowEdgeKind, target: EdgeTarget) {
        let edge = ControlFlowEdge::new(kind, target);
        if !self.successors.contains(&edge) {
            self.successors.push(edge);
        }
    }

    /// Start addresses of successor blocks that are part of the graph.
    pub fn successor_starts(&self) -> impl Iterator<Item = VirtualAddress> + '_ {
        self.successors.iter().filter_map(|e| e.target.block())
    }

    /// Split this block at the instruction starting at `addr`.
    ///
    /// On success `self` becomes `[start, addr)` ending in a fallthrough edge
    /// to the returned block `[addr, end)`, which inherits the terminator,
    /// successors, call references and truncation marker. Returns `None` when
    /// `addr` is the block start or not an instruction boundary.
    pub fn split_at(&mut self, addr: VirtualAddress) -> Option<BasicBlock> {
        if addr == self.start {
            return None;
        }
        let idx = self
            .instructions
            .binary_search_by_key(&addr, |i| i.address)
            .ok()?;

        let tail_instructions = self.instructions.split_off(idx);
        let (tail_calls, head_calls): (Vec<_>, Vec<_>) =
            self.calls.drain(..).partition(|c| c.site >= addr);
        self.calls = head_calls;

        let tail = BasicBlock {
            start: addr,
            end: self.end,
            instructions: tail_instructions,
            terminator: self.terminator,
            successors: std::mem::take(&mut self.successors),
            calls: tail_calls,
            truncated: self.truncated,
        };

        self.end = addr;
        self.terminator = Terminator::Fallthrough;
        self.truncated = false;
        self.add_successor(ControlFlowEdgeKind::Fallthrough, EdgeTarget::Block(addr));
        Some(tail)
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bb_{:x} {} ({} insns, {}{})",
            self.start,
            self.range(),
            self.instructions.len(),
            self.terminator,
            if self.truncated { ", truncated" } else { "" }
        )
    }
}
