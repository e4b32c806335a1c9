//! ControlFlowGraph type for representing intra-procedural control flow.
//!
//! Blocks are keyed by their start address, so a block reached through any
//! number of edges exists exactly once. Control edges live on the blocks;
//! calls are recorded as `CallReference`s and never become graph edges.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::core::address::{AddressRange, VirtualAddress};
use crate::core::basic_block::BasicBlock;
use crate::keyfunctions::KeyFunctionRole;

/// Edge kind in control flow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlFlowEdgeKind {
    /// Execution runs into the next block
    Fallthrough,
    /// Unconditional direct branch
    Branch,
    /// Taken side of a conditional branch
    ConditionalBranch,
    /// Return site of a call that closes its block
    CallReturn,
    /// Computed jump whose target is not known statically
    Indirect,
}

impl ControlFlowEdgeKind {
    pub fn value(&self) -> &str {
        match self {
            ControlFlowEdgeKind::Fallthrough => "fallthrough",
            ControlFlowEdgeKind::Branch => "branch",
            ControlFlowEdgeKind::ConditionalBranch => "conditional",
            ControlFlowEdgeKind::CallReturn => "call-return",
            ControlFlowEdgeKind::Indirect => "indirect",
        }
    }
}

/// Where an edge leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeTarget {
    /// Start address of a block in the same graph
    Block(VirtualAddress),
    /// Control leaves the modeled graph here
    Unknown,
}

impl EdgeTarget {
    pub fn block(&self) -> Option<VirtualAddress> {
        match self {
            EdgeTarget::Block(a) => Some(*a),
            EdgeTarget::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, EdgeTarget::Unknown)
    }
}

/// Edge in control flow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlFlowEdge {
    pub kind: ControlFlowEdgeKind,
    pub target: EdgeTarget,
}

impl ControlFlowEdge {
    pub fn new(kind: ControlFlowEdgeKind, target: EdgeTarget) -> Self {
        Self { kind, target }
    }
}

/// Destination of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallTarget {
    Direct(VirtualAddress),
    /// Register or memory operand
    Indirect,
}

impl CallTarget {
    pub fn address(&self) -> Option<VirtualAddress> {
        match self {
            CallTarget::Direct(a) => Some(*a),
            CallTarget::Indirect => None,
        }
    }
}

/// A call made from a block. Not a control edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallReference {
    /// Address of the call (or tail jump) instruction
    pub site: VirtualAddress,
    pub target: CallTarget,
    /// Runtime helper role of the target, when the registry knows it
    pub role: Option<KeyFunctionRole>,
    /// Jump that leaves the method instead of a real call
    pub tail_call: bool,
}

impl CallReference {
    pub fn new(site: VirtualAddress, target: CallTarget) -> Self {
        Self {
            site,
            target,
            role: None,
            tail_call: false,
        }
    }

    pub fn with_role(mut self, role: Option<KeyFunctionRole>) -> Self {
        self.role = role;
        self
    }

    pub fn as_tail_call(mut self) -> Self {
        self.tail_call = true;
        self
    }
}

/// ControlFlowGraph represents intra-procedural control flow for one method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFlowGraph {
    /// Canonical entry address of the method
    pub entry: VirtualAddress,
    /// Address range of the method body the graph was built from
    pub body: AddressRange,
    blocks: BTreeMap<VirtualAddress, BasicBlock>,
    /// Set when a budget stopped discovery before the worklist drained
    pub incomplete: bool,
}

impl ControlFlowGraph {
    /// Create a new empty graph for a body starting at `entry`
    pub fn new(entry: VirtualAddress, body: AddressRange) -> Self {
        Self {
            entry,
            body,
            blocks: BTreeMap::new(),
            incomplete: false,
        }
    }

    pub fn insert_block(&mut self, block: BasicBlock) {
        self.blocks.insert(block.start, block);
    }

    pub fn remove_block(&mut self, start: VirtualAddress) -> Option<BasicBlock> {
        self.blocks.remove(&start)
    }

    pub fn block(&self, start: VirtualAddress) -> Option<&BasicBlock> {
        self.blocks.get(&start)
    }

    pub fn block_mut(&mut self, start: VirtualAddress) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&start)
    }

    pub fn contains_block(&self, start: VirtualAddress) -> bool {
        self.blocks.contains_key(&start)
    }

    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.blocks.get(&self.entry)
    }

    /// Blocks in start-address order
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut BasicBlock> {
        self.blocks.values_mut()
    }

    pub fn block_starts(&self) -> Vec<VirtualAddress> {
        self.blocks.keys().copied().collect()
    }

    /// The block whose (non-empty) range covers `addr`.
    pub fn block_containing(&self, addr: VirtualAddress) -> Option<&BasicBlock> {
        let (_, bb) = self.blocks.range(..=addr).next_back()?;
        if addr < bb.end {
            Some(bb)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn edge_count(&self) -> usize {
        self.blocks.values().map(|b| b.successors.len()).sum()
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }

    /// In-graph successor starts of `start`
    pub fn successors(&self, start: VirtualAddress) -> Vec<VirtualAddress> {
        self.blocks
            .get(&start)
            .map(|b| b.successor_starts().collect())
            .unwrap_or_default()
    }

    pub fn predecessors(&self, start: VirtualAddress) -> Vec<VirtualAddress> {
        self.blocks
            .values()
            .filter(|b| b.successor_starts().any(|s| s == start))
            .map(|b| b.start)
            .collect()
    }

    /// Blocks with no outgoing edges at all
    pub fn exit_blocks(&self) -> Vec<VirtualAddress> {
        self.blocks
            .values()
            .filter(|b| b.successors.is_empty())
            .map(|b| b.start)
            .collect()
    }

    pub fn truncated_blocks(&self) -> Vec<VirtualAddress> {
        self.blocks
            .values()
            .filter(|b| b.truncated)
            .map(|b| b.start)
            .collect()
    }

    /// All call references in block order.
    pub fn call_references(&self) -> impl Iterator<Item = &CallReference> {
        self.blocks.values().flat_map(|b| b.calls.iter())
    }

    pub fn unknown_edge_count(&self) -> usize {
        self.blocks
            .values()
            .flat_map(|b| b.successors.iter())
            .filter(|e| e.target.is_unknown())
            .count()
    }

    /// True when any block is truncated or discovery stopped early.
    pub fn is_degraded(&self) -> bool {
        self.incomplete || self.blocks.values().any(|b| b.truncated)
    }

    /// Calculate cyclomatic complexity (M = E - N + 2P, where P=1 for connected graph)
    pub fn cyclomatic_complexity(&self) -> u32 {
        if self.blocks.is_empty() {
            return 0;
        }
        let edges = self
            .blocks
            .values()
            .map(|b| b.successor_starts().count())
            .sum::<usize>() as u32;
        let nodes = self.blocks.len() as u32;
        edges.saturating_sub(nodes).saturating_add(2)
    }

    /// Check if the graph has cycles
    pub fn has_cycles(&self) -> bool {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        self.blocks.keys().any(|&start| {
            !visited.contains(&start) && self.has_cycle_dfs(start, &mut visited, &mut on_stack)
        })
    }

    fn has_cycle_dfs(
        &self,
        start: VirtualAddress,
        visited: &mut HashSet<VirtualAddress>,
        on_stack: &mut HashSet<VirtualAddress>,
    ) -> bool {
        visited.insert(start);
        on_stack.insert(start);

        for succ in self.successors(start) {
            if !visited.contains(&succ) {
                if self.has_cycle_dfs(succ, visited, on_stack) {
                    return true;
                }
            } else if on_stack.contains(&succ) {
                return true;
            }
        }

        on_stack.remove(&start);
        false
    }

    /// Validate the structural invariants of the graph
    pub fn validate(&self) -> Result<(), String> {
        if !self.blocks.is_empty() && !self.blocks.contains_key(&self.entry) {
            return Err(format!("Entry block {:#x} is missing", self.entry));
        }

        let mut prev_end: Option<VirtualAddress> = None;
        for (start, block) in &self.blocks {
            if *start != block.start {
                return Err(format!(
                    "Block keyed at {:#x} starts at {:#x}",
                    start, block.start
                ));
            }
            if let Some(end) = prev_end {
                if block.start < end {
                    return Err(format!("Block {:#x} overlaps its predecessor", block.start));
                }
            }
            prev_end = Some(block.end);

            let mut cursor = block.start;
            for insn in &block.instructions {
                if insn.address != cursor {
                    return Err(format!(
                        "Block {:#x} has a gap before instruction {:#x}",
                        block.start, insn.address
                    ));
                }
                cursor = insn.end_address();
            }
            if cursor != block.end {
                return Err(format!(
                    "Block {:#x} ends at {:#x} but its instructions end at {:#x}",
                    block.start, block.end, cursor
                ));
            }

            for succ in block.successor_starts() {
                if !self.blocks.contains_key(&succ) {
                    return Err(format!(
                        "Edge from {:#x} references unknown block {:#x}",
                        block.start, succ
                    ));
                }
            }
        }
        Ok(())
    }

    /// Get statistics about the graph
    pub fn statistics(&self) -> ControlFlowGraphStats {
        let mut edge_kind_counts = HashMap::new();
        for edge in self.blocks.values().flat_map(|b| b.successors.iter()) {
            *edge_kind_counts.entry(edge.kind).or_insert(0) += 1;
        }

        ControlFlowGraphStats {
            block_count: self.block_count(),
            edge_count: self.edge_count(),
            instruction_count: self.instruction_count(),
            exit_blocks: self.exit_blocks().len(),
            truncated_blocks: self.truncated_blocks().len(),
            call_references: self.call_references().count(),
            unknown_edges: self.unknown_edge_count(),
            cyclomatic_complexity: self.cyclomatic_complexity(),
            has_cycles: self.has_cycles(),
            edge_kind_counts,
        }
    }
}

/// Statistics about a control flow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFlowGraphStats {
    pub block_count: usize,
    pub edge_count: usize,
    pub instruction_count: usize,
    pub exit_blocks: usize,
    pub truncated_blocks: usize,
    pub call_references: usize,
    pub unknown_edges: usize,
    pub cyclomatic_complexity: u32,
    pub has_cycles: bool,
    pub edge_kind_counts: HashMap<ControlFlowEdgeKind, usize>,
}

impl fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ControlFlowGraph(entry={:#x}, blocks={}, edges={}{})",
            self.entry,
            self.block_count(),
            self.edge_count(),
            if self.is_degraded() { ", degraded" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::basic_block::Terminator;
    use crate::core::instruction::{FlowControl, Instruction};

    fn insn(addr: u64, len: u16) -> Instruction {
        Instruction {
            address: addr,
            bytes: vec![0x90; len as usize],
            mnemonic: "nop".to_string(),
            operands: vec![],
            length: len,
            flow: FlowControl::Next,
            branch_target: None,
            condition: None,
        }
    }

    fn block(start: u64, len: u16, succ: &[(ControlFlowEdgeKind, EdgeTarget)]) -> BasicBlock {
        let mut bb = BasicBlock::new(start);
        bb.push(insn(start, len));
        for (kind, target) in succ {
            bb.add_successor(*kind, *target);
        }
        bb
    }

    // 0x10 -> {0x20, 0x30}; 0x20 -> 0x30; 0x30 exits
    fn diamond() -> ControlFlowGraph {
        let mut g = ControlFlowGraph::new(0x10, AddressRange::new(0x10, 0x40));
        g.insert_block(block(
            0x10,
            0x10,
            &[
                (ControlFlowEdgeKind::ConditionalBranch, EdgeTarget::Block(0x30)),
                (ControlFlowEdgeKind::Fallthrough, EdgeTarget::Block(0x20)),
            ],
        ));
        g.insert_block(block(
            0x20,
            0x10,
            &[(ControlFlowEdgeKind::Fallthrough, EdgeTarget::Block(0x30))],
        ));
        let mut exit = block(0x30, 0x10, &[]);
        exit.terminator = Terminator::Return;
        g.insert_block(exit);
        g
    }

    #[test]
    fn test_queries() {
        let g = diamond();
        assert_eq!(g.block_count(), 3);
        assert_eq!(g.edge_count(), 3);
        assert_eq!(g.successors(0x10), vec![0x30, 0x20]);
        assert_eq!(g.predecessors(0x30), vec![0x10, 0x20]);
        assert_eq!(g.exit_blocks(), vec![0x30]);
        assert_eq!(g.block_containing(0x25).map(|b| b.start), Some(0x20));
        assert!(g.block_containing(0x40).is_none());
        assert!(g.validate().is_ok());
        assert!(!g.is_degraded());
    }

    #[test]
    fn test_complexity_and_cycles() {
        let mut g = diamond();
        assert_eq!(g.cyclomatic_complexity(), 2);
        assert!(!g.has_cycles());

        g.block_mut(0x30)
            .unwrap()
            .add_successor(ControlFlowEdgeKind::Branch, EdgeTarget::Block(0x10));
        assert!(g.has_cycles());
    }

    #[test]
    fn test_unknown_edges_do_not_break_validation() {
        let mut g = ControlFlowGraph::new(0x10, AddressRange::new(0x10, 0x20));
        g.insert_block(block(
            0x10,
            0x10,
            &[(ControlFlowEdgeKind::Indirect, EdgeTarget::Unknown)],
        ));
        assert!(g.validate().is_ok());
        assert_eq!(g.unknown_edge_count(), 1);
        assert!(g.exit_blocks().is_empty());
    }

    #[test]
    fn test_validate_catches_dangling_edge() {
        let mut g = ControlFlowGraph::new(0x10, AddressRange::new(0x10, 0x20));
        g.insert_block(block(
            0x10,
            0x10,
            &[(ControlFlowEdgeKind::Branch, EdgeTarget::Block(0x99))],
        ));
        let err = g.validate().unwrap_err();
        assert!(err.contains("unknown block"));
    }

    #[test]
    fn test_validate_catches_overlap() {
        let mut g = ControlFlowGraph::new(0x10, AddressRange::new(0x10, 0x30));
        g.insert_block(block(0x10, 8, &[]));
        g.insert_block(block(0x14, 8, &[]));
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_degraded_and_statistics() {
        let mut g = diamond();
        g.block_mut(0x20).unwrap().truncated = true;
        assert!(g.is_degraded());
        let stats = g.statistics();
        assert_eq!(stats.truncated_blocks, 1);
        assert_eq!(stats.edge_kind_counts[&ControlFlowEdgeKind::Fallthrough], 2);
        assert!(g.to_string().contains("degraded"));
    }
}
