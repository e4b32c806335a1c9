//! Shared lowering driver.
//!
//! Blocks are visited in start-address order and instructions in program
//! order. Each architecture supplies an [`InstructionLowering`] that maps one
//! decoded instruction to zero or more nodes; the helpers here cover the
//! parts every architecture treats the same way (calls, jumps, returns).

use tracing::{debug, trace};

use crate::config::LoweringConfig;
use crate::core::address::VirtualAddress;
use crate::core::control_flow_graph::ControlFlowGraph;
use crate::core::instruction::Instruction;
use crate::core::method::MethodAnalysisContext;
use crate::isil::builder::IsilBuilder;
use crate::isil::node::IsilNode;
use crate::isil::operand::IsilOperand;
use crate::keyfunctions::{KeyFunctionAddresses, KeyFunctionRole};

/// Read-only inputs available while lowering one method.
pub struct LoweringContext<'a> {
    pub graph: &'a ControlFlowGraph,
    pub method: &'a MethodAnalysisContext,
    pub key_functions: &'a KeyFunctionAddresses,
    pub config: &'a LoweringConfig,
    /// Register holding the return value, used when the method returns one
    pub return_register: &'a str,
}

impl<'a> LoweringContext<'a> {
    /// Role of a direct call target, when tagging is enabled.
    pub fn role_of(&self, target: VirtualAddress) -> Option<KeyFunctionRole> {
        if !self.config.tag_key_function_calls {
            return None;
        }
        self.key_functions.role_at(target).ok().flatten()
    }

    pub fn is_inside_method(&self, target: VirtualAddress) -> bool {
        self.graph.body.contains(target)
    }

    /// Emit a call to a direct target, tagging key function roles.
    pub fn emit_direct_call(&self, b: &mut IsilBuilder, target: VirtualAddress) {
        b.call(IsilOperand::imm(target as i64), self.role_of(target));
    }

    /// Emit an unconditional direct jump. A jump leaving the method is a
    /// tail call and becomes call + return when expansion is enabled.
    pub fn emit_direct_jump(&self, b: &mut IsilBuilder, target: VirtualAddress) {
        if self.is_inside_method(target) || !self.config.expand_tail_calls {
            b.goto(IsilOperand::imm(target as i64));
            return;
        }
        let role = self.role_of(target);
        b.call(IsilOperand::imm(target as i64), role);
        if !role.is_some_and(|r| r.is_no_return()) {
            self.emit_return(b);
        }
    }

    /// Emit a return, carrying the return register for non-void methods.
    pub fn emit_return(&self, b: &mut IsilBuilder) {
        let value = self
            .method
            .has_return_value()
            .then(|| IsilOperand::reg(self.return_register));
        b.ret(value);
    }
}

/// Per-architecture mapping from one decoded instruction to ISIL.
pub trait InstructionLowering {
    fn lower(&self, insn: &Instruction, cx: &LoweringContext<'_>, b: &mut IsilBuilder);
}

/// Lower every instruction of `cx.graph` in block start-address order.
pub fn lower_graph(
    lowering: &dyn InstructionLowering,
    cx: &LoweringContext<'_>,
) -> Vec<IsilNode> {
    let mut b = IsilBuilder::new().with_nops(cx.config.emit_nops);
    for block in cx.graph.blocks() {
        for insn in &block.instructions {
            b.set_address(insn.address);
            let before = b.len();
            lowering.lower(insn, cx, &mut b);
            trace!(
                address = format_args!("{:#x}", insn.address),
                insn = %insn,
                nodes = b.len() - before,
                "Lowered instruction"
            );
        }
    }
    let nodes = b.finish();
    debug!(
        method = %cx.method.name,
        blocks = cx.graph.block_count(),
        nodes = nodes.len(),
        "Lowered method to ISIL"
    );
    nodes
}
