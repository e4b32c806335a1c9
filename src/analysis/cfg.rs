//! Bounded, worklist-driven CFG construction for one method body.
//!
//! The builder is shared by every instruction set: architecture-specific
//! knowledge lives entirely in the `Disassembler` (instruction length, flow
//! classification, direct targets). It discovers blocks from the entry,
//! splits blocks when a later target lands inside them, records calls as
//! call references, and never fails: decode errors truncate the block they
//! occur in and exhausted budgets mark the graph incomplete.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, trace, warn};

use crate::config::CfgConfig;
use crate::core::address::{AddressRange, VirtualAddress};
use crate::core::basic_block::{BasicBlock, Terminator};
use crate::core::control_flow_graph::{
    CallReference, CallTarget, ControlFlowEdgeKind, ControlFlowGraph, EdgeTarget,
};
use crate::core::disassembler::Disassembler;
use crate::core::instruction::FlowControl;
use crate::keyfunctions::KeyFunctionRegistry;

/// Build the CFG of the body `bytes` mapped at `entry`.
pub fn build_cfg<D: Disassembler + ?Sized>(
    decoder: &D,
    entry: VirtualAddress,
    bytes: &[u8],
    config: &CfgConfig,
    key_functions: &KeyFunctionRegistry,
) -> ControlFlowGraph {
    CfgBuilder::new(decoder, entry, bytes, config, key_functions).run()
}

struct CfgBuilder<'a, D: Disassembler + ?Sized> {
    decoder: &'a D,
    bytes: &'a [u8],
    body: AddressRange,
    config: &'a CfgConfig,
    key_functions: &'a KeyFunctionRegistry,
    graph: ControlFlowGraph,
    worklist: VecDeque<VirtualAddress>,
    queued: HashSet<VirtualAddress>,
    instructions_left: usize,
}

/// Why decoding of a block stopped.
enum Stop {
    /// Block closed normally; keep draining the worklist
    Continue,
    /// Instruction budget ran out; stop discovery
    Exhausted,
}

impl<'a, D: Disassembler + ?Sized> CfgBuilder<'a, D> {
    fn new(
        decoder: &'a D,
        entry: VirtualAddress,
        bytes: &'a [u8],
        config: &'a CfgConfig,
        key_functions: &'a KeyFunctionRegistry,
    ) -> Self {
        let body = AddressRange::with_len(entry, bytes.len() as u64);
        Self {
            decoder,
            bytes,
            body,
            config,
            key_functions,
            graph: ControlFlowGraph::new(entry, body),
            worklist: VecDeque::new(),
            queued: HashSet::new(),
            instructions_left: config.max_instructions,
        }
    }

    /// Queue `target` if it lies in the body and return the edge target for it.
    fn edge_to(&mut self, target: VirtualAddress) -> EdgeTarget {
        if !self.body.contains(target) {
            return EdgeTarget::Unknown;
        }
        if target % self.decoder.instruction_alignment() != 0 {
            warn!(
                target = format_args!("{:#x}", target),
                "Branch target is not instruction aligned"
            );
            return EdgeTarget::Unknown;
        }
        if self.queued.insert(target) {
            self.worklist.push_back(target);
        }
        EdgeTarget::Block(target)
    }

    fn run(mut self) -> ControlFlowGraph {
        let entry = self.graph.entry;
        if self.body.is_empty() {
            return self.graph;
        }
        self.edge_to(entry);

        while let Some(start) = self.worklist.pop_front() {
            if self.graph.contains_block(start) {
                continue;
            }
            if self.graph.block_count() >= self.config.max_blocks {
                debug!(
                    max_blocks = self.config.max_blocks,
                    pending = self.worklist.len() + 1,
                    "Block budget exhausted"
                );
                self.graph.incomplete = true;
                break;
            }
            if self.split_existing(start) {
                continue;
            }
            if let Stop::Exhausted = self.decode_block(start) {
                debug!(
                    max_instructions = self.config.max_instructions,
                    "Instruction budget exhausted"
                );
                self.graph.incomplete = true;
                break;
            }
        }

        self.retarget_dangling_edges();
        self.graph
    }

    /// Split the block containing `target` when it is an instruction
    /// boundary. Returns true when `target` is now handled.
    fn split_existing(&mut self, target: VirtualAddress) -> bool {
        let Some(container) = self.graph.block_containing(target).map(|b| b.start) else {
            return false;
        };
        let tail = self
            .graph
            .block_mut(container)
            .and_then(|bb| bb.split_at(target));
        match tail {
            Some(tail) => {
                debug!(
                    block = format_args!("{:#x}", container),
                    at = format_args!("{:#x}", target),
                    "Split block at branch target"
                );
                self.graph.insert_block(tail);
            }
            None => {
                // Target lands inside an instruction; the edge is dropped to unknown
                warn!(
                    target = format_args!("{:#x}", target),
                    block = format_args!("{:#x}", container),
                    "Branch target is not an instruction boundary"
                );
            }
        }
        true
    }

    fn decode_block(&mut self, start: VirtualAddress) -> Stop {
        let mut bb = BasicBlock::new(start);
        let mut addr = start;
        let mut stop = Stop::Continue;

        loop {
            if addr != start {
                if self.graph.contains_block(addr) {
                    bb.add_successor(ControlFlowEdgeKind::Fallthrough, EdgeTarget::Block(addr));
                    bb.terminator = Terminator::Fallthrough;
                    break;
                }
                if self.graph.block_containing(addr).is_some() {
                    // Re-synchronized into the middle of a known block
                    self.split_existing(addr);
                    let target = if self.graph.contains_block(addr) {
                        EdgeTarget::Block(addr)
                    } else {
                        EdgeTarget::Unknown
                    };
                    bb.add_successor(ControlFlowEdgeKind::Fallthrough, target);
                    bb.terminator = Terminator::Fallthrough;
                    break;
                }
            }
            if !self.body.contains(addr) {
                bb.terminator = Terminator::OutOfRange;
                break;
            }
            if self.instructions_left == 0 {
                bb.terminator = Terminator::BudgetExhausted;
                bb.add_successor(ControlFlowEdgeKind::Fallthrough, EdgeTarget::Unknown);
                stop = Stop::Exhausted;
                break;
            }

            let offset = (addr - self.body.start) as usize;
            let insn = match self.decoder.disassemble_instruction(addr, &self.bytes[offset..]) {
                Ok(insn) if insn.length > 0 && insn.end_address() <= self.body.end => insn,
                Ok(insn) => {
                    warn!(
                        address = format_args!("{:#x}", addr),
                        length = insn.length,
                        "Instruction runs past the method body; truncating block"
                    );
                    bb.truncated = true;
                    bb.terminator = Terminator::DecodeFailure;
                    break;
                }
                Err(e) => {
                    warn!(
                        address = format_args!("{:#x}", addr),
                        error = %e,
                        "Decode failure; truncating block"
                    );
                    bb.truncated = true;
                    bb.terminator = Terminator::DecodeFailure;
                    break;
                }
            };
            self.instructions_left -= 1;
            trace!(address = format_args!("{:#x}", addr), insn = %insn, "Decoded");

            let site = insn.address;
            let next = insn.end_address();
            let flow = insn.flow;
            let target = insn.branch_target;
            bb.push(insn);

            match flow {
                FlowControl::Next => {
                    addr = next;
                    continue;
                }
                FlowControl::Call | FlowControl::IndirectCall => {
                    let role = target.and_then(|t| self.key_functions.role_hint(t));
                    let call_target = target.map_or(CallTarget::Indirect, CallTarget::Direct);
                    bb.calls.push(CallReference::new(site, call_target).with_role(role));

                    if self.config.stop_at_no_return_calls
                        && role.is_some_and(|r| r.is_no_return())
                    {
                        bb.terminator = Terminator::NoReturnCall;
                        break;
                    }
                    if self.config.calls_end_blocks {
                        let edge = self.edge_to(next);
                        bb.add_successor(ControlFlowEdgeKind::CallReturn, edge);
                        bb.terminator = Terminator::Call;
                        break;
                    }
                    addr = next;
                    continue;
                }
                FlowControl::Branch => match target {
                    Some(t) if self.body.contains(t) => {
                        let edge = self.edge_to(t);
                        bb.add_successor(ControlFlowEdgeKind::Branch, edge);
                        bb.terminator = Terminator::Branch;
                    }
                    Some(t) => {
                        let role = self.key_functions.role_hint(t);
                        bb.calls.push(
                            CallReference::new(site, CallTarget::Direct(t))
                                .with_role(role)
                                .as_tail_call(),
                        );
                        bb.terminator = Terminator::TailCall;
                    }
                    None => {
                        bb.add_successor(ControlFlowEdgeKind::Indirect, EdgeTarget::Unknown);
                        bb.terminator = Terminator::IndirectBranch;
                    }
                },
                FlowControl::ConditionalBranch => {
                    let taken = match target {
                        Some(t) => self.edge_to(t),
                        None => EdgeTarget::Unknown,
                    };
                    if let (Some(t), EdgeTarget::Unknown) = (target, taken) {
                        let role = self.key_functions.role_hint(t);
                        bb.calls.push(
                            CallReference::new(site, CallTarget::Direct(t))
                                .with_role(role)
                                .as_tail_call(),
                        );
                    }
                    bb.add_successor(ControlFlowEdgeKind::ConditionalBranch, taken);
                    let fallthrough = self.edge_to(next);
                    bb.add_successor(ControlFlowEdgeKind::Fallthrough, fallthrough);
                    bb.terminator = Terminator::ConditionalBranch;
                }
                FlowControl::IndirectBranch => {
                    bb.add_successor(ControlFlowEdgeKind::Indirect, EdgeTarget::Unknown);
                    bb.terminator = Terminator::IndirectBranch;
                }
                FlowControl::Return => bb.terminator = Terminator::Return,
                FlowControl::Interrupt => bb.terminator = Terminator::Trap,
            }
            break;
        }

        trace!(block = %bb, "Closed block");
        self.graph.insert_block(bb);
        stop
    }

    /// Edges to targets that never became blocks (budget stop, misaligned
    /// targets) leave the modeled graph.
    fn retarget_dangling_edges(&mut self) {
        let starts: HashSet<VirtualAddress> = self.graph.block_starts().into_iter().collect();
        for bb in self.graph.blocks_mut() {
            for edge in bb.successors.iter_mut() {
                if let EdgeTarget::Block(t) = edge.target {
                    if !starts.contains(&t) {
                        edge.target = EdgeTarget::Unknown;
                    }
                }
            }
            bb.successors.dedup();
        }
    }
}
