//! ARM32 adapter, covering both ARM and Thumb state.
//!
//! Method pointers with bit 0 set are Thumb entry points. The tag bit is
//! stripped for decoding and address tagging and selects the Thumb decoder.

use std::sync::Arc;

use tracing::warn;

use crate::analysis::cfg;
use crate::arch::body::extract_body;
use crate::arch::operands::{convert, displaced, Addressing};
use crate::arch::InstructionSet;
use crate::config::AnalysisConfig;
use crate::core::address::VirtualAddress;
use crate::core::binary::Architecture;
use crate::core::control_flow_graph::ControlFlowGraph;
use crate::core::image::BinaryImage;
use crate::core::instruction::{FlowControl, Instruction, OperandKind};
use crate::core::method::MethodAnalysisContext;
use crate::disasm::capstone::{split_arm_mnemonic, CapstoneDisassembler};
use crate::error::Result;
use crate::isil::{
    lower_graph, InstructionLowering, IsilBuilder, IsilMemoryOperand, IsilNode, IsilOpcode,
    IsilOperand, LoweringContext,
};
use crate::keyfunctions::KeyFunctionRegistry;

const THUMB_BIT: u64 = 1;

pub struct ArmInstructionSet {
    image: Arc<dyn BinaryImage>,
    key_functions: Arc<KeyFunctionRegistry>,
    config: AnalysisConfig,
}

impl ArmInstructionSet {
    pub fn new(
        image: Arc<dyn BinaryImage>,
        key_functions: Arc<KeyFunctionRegistry>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            image,
            key_functions,
            config,
        }
    }

    pub fn is_thumb(ctx: &MethodAnalysisContext) -> bool {
        ctx.underlying_pointer & THUMB_BIT != 0
    }

    fn decoder(&self, ctx: &MethodAnalysisContext) -> Result<CapstoneDisassembler> {
        Ok(CapstoneDisassembler::arm(Self::is_thumb(ctx))?)
    }
}

impl InstructionSet for ArmInstructionSet {
    fn architecture(&self) -> Architecture {
        Architecture::ARM
    }

    fn pointer_for_method(&self, ctx: &MethodAnalysisContext) -> VirtualAddress {
        ctx.underlying_pointer & !THUMB_BIT
    }

    fn build_cfg(&self, ctx: &MethodAnalysisContext) -> Result<ControlFlowGraph> {
        let pointer = self.pointer_for_method(ctx);
        let span = crate::span_trace!(
            "build_cfg",
            method = %ctx.name,
            pointer = format_args!("{:#x}", pointer),
            thumb = Self::is_thumb(ctx)
        );
        let _guard = span.enter();

        let body = self.method_body(ctx)?;
        let decoder = self.decoder(ctx)?;
        let graph = cfg::build_cfg(&decoder, pointer, &body, &self.config.cfg, &self.key_functions);
        if graph.is_degraded() {
            warn!(
                truncated = graph.truncated_blocks().len(),
                incomplete = graph.incomplete,
                "CFG is degraded"
            );
        }
        Ok(graph)
    }

    fn raw_bytes_for_method(
        &self,
        ctx: &MethodAnalysisContext,
        is_attribute_generator: bool,
    ) -> Result<Vec<u8>> {
        let decoder = self.decoder(ctx)?;
        extract_body(
            self.image.as_ref(),
            &decoder,
            self.pointer_for_method(ctx),
            ctx.body_size,
            is_attribute_generator,
            &self.config.extraction,
        )
    }

    fn cfg_to_isil(
        &self,
        graph: &ControlFlowGraph,
        ctx: &MethodAnalysisContext,
    ) -> Result<Vec<IsilNode>> {
        let key_functions = self.key_functions.get()?;
        let span = crate::span_trace!("cfg_to_isil", method = %ctx.name);
        let _guard = span.enter();

        let cx = LoweringContext {
            graph,
            method: ctx,
            key_functions,
            config: &self.config.lowering,
            return_register: "r0",
        };
        Ok(lower_graph(&ArmLowering, &cx))
    }
}

fn canonical_register(name: &str) -> String {
    match name {
        "sb" => "r9",
        "sl" => "r10",
        "fp" => "r11",
        "ip" => "r12",
        "r13" => "sp",
        "r14" => "lr",
        "r15" => "pc",
        n => n,
    }
    .to_string()
}

fn binary_opcode(base: &str) -> Option<IsilOpcode> {
    Some(match base {
        "add" | "adc" => IsilOpcode::Add,
        "sub" | "sbc" => IsilOpcode::Subtract,
        "mul" => IsilOpcode::Multiply,
        "sdiv" | "udiv" => IsilOpcode::Divide,
        "lsl" => IsilOpcode::ShiftLeft,
        "lsr" | "asr" => IsilOpcode::ShiftRight,
        "and" => IsilOpcode::And,
        "orr" => IsilOpcode::Or,
        "eor" => IsilOpcode::Xor,
        _ => return None,
    })
}

struct ArmLowering;

impl ArmLowering {
    fn registers(insn: &Instruction) -> Vec<IsilOperand> {
        insn.operands
            .iter()
            .filter(|o| o.kind == OperandKind::Register)
            .filter_map(|o| convert(o, canonical_register))
            .collect()
    }

    /// `pop`/`ldm` register list; a `pc` entry becomes the return.
    fn lower_pop(insn: &Instruction, cx: &LoweringContext<'_>, b: &mut IsilBuilder) {
        let mut returns = false;
        for reg in Self::registers(insn) {
            if reg.as_register() == Some("pc") {
                returns = true;
            } else if reg.as_register() != Some("sp") {
                b.pop(reg);
            }
        }
        if returns {
            cx.emit_return(b);
        }
    }

    /// `ldm`: a stack base makes it a pop. Any other base is an address
    /// source, and each listed register loads the next word from it.
    fn lower_load_multiple(
        insn: &Instruction,
        base: &str,
        cx: &LoweringContext<'_>,
        b: &mut IsilBuilder,
    ) {
        let Some((first, list)) = insn.operands.split_first() else {
            b.not_implemented(insn.to_string());
            return;
        };
        let address = convert(first, canonical_register);
        let Some(base_reg) = address.as_ref().and_then(|a| a.as_register()) else {
            b.not_implemented(insn.to_string());
            return;
        };
        if base_reg == "sp" {
            return Self::lower_pop(insn, cx, b);
        }

        let regs: Vec<IsilOperand> = list
            .iter()
            .filter(|o| o.kind == OperandKind::Register)
            .filter_map(|o| convert(o, canonical_register))
            .collect();
        let words = regs.len() as i64;
        let descending = base.ends_with("da") || base.ends_with("db");
        let lowest = match base {
            "ldmib" => 4,
            "ldmda" => -4 * (words - 1),
            "ldmdb" => -4 * words,
            _ => 0,
        };
        // Offsets of the pc slot are taken after the base update
        let update = match (first.writeback, descending) {
            (false, _) => 0,
            (true, false) => 4 * words,
            (true, true) => -4 * words,
        };

        let mut jump = None;
        for (i, reg) in regs.into_iter().enumerate() {
            let offset = lowest + 4 * i as i64;
            if reg.as_register() == Some("pc") {
                jump = Some(offset - update);
                continue;
            }
            let slot = IsilMemoryOperand::based(base_reg, offset);
            b.move_(reg, IsilOperand::Memory(slot));
        }
        if update != 0 {
            let reg = IsilOperand::reg(base_reg);
            b.binary(IsilOpcode::Add, reg.clone(), reg, IsilOperand::imm(update));
        }
        if let Some(offset) = jump {
            b.goto(IsilOperand::Memory(IsilMemoryOperand::based(base_reg, offset)));
        }
    }

    fn lower_transfer(insn: &Instruction, cx: &LoweringContext<'_>, b: &mut IsilBuilder) {
        let parsed = split_arm_mnemonic(&insn.mnemonic);
        let op = |i: usize| insn.operands.get(i).and_then(|o| convert(o, canonical_register));

        match (insn.flow, insn.branch_target) {
            (FlowControl::ConditionalBranch, Some(target)) => {
                let Some(cond) = insn.condition else {
                    b.not_implemented(insn.to_string());
                    return;
                };
                if matches!(parsed.base, "cbz" | "cbnz") {
                    match op(0) {
                        Some(r) => b.compare(r, IsilOperand::imm(0)),
                        None => {
                            b.not_implemented(insn.to_string());
                            return;
                        }
                    }
                }
                b.jump_if(cond, IsilOperand::imm(target as i64));
            }
            // Predicated return or indirect jump: lower the transfer and
            // record the predicate on it
            (FlowControl::ConditionalBranch, None) => {
                let start = b.len();
                Self::lower_indirect(insn, parsed.base, cx, b);
                if let Some(cond) = insn.condition {
                    b.annotate_since(start, &format!("executes if {:?}", cond));
                }
            }
            (FlowControl::Branch, Some(target)) => cx.emit_direct_jump(b, target),
            (FlowControl::Call, Some(target)) => cx.emit_direct_call(b, target),
            (FlowControl::IndirectCall, _) => match op(0) {
                Some(r) => b.call(r, None),
                None => b.not_implemented(insn.to_string()),
            },
            (FlowControl::IndirectBranch | FlowControl::Return, _) => {
                Self::lower_indirect(insn, parsed.base, cx, b)
            }
            (FlowControl::Interrupt, _) => b.interrupt(),
            _ => b.not_implemented(insn.to_string()),
        }
    }

    /// Register-sourced transfers: returns through `lr` or `pc` loads,
    /// everything else is a jump through the source operand.
    fn lower_indirect(
        insn: &Instruction,
        base: &str,
        cx: &LoweringContext<'_>,
        b: &mut IsilBuilder,
    ) {
        let op = |i: usize| insn.operands.get(i).and_then(|o| convert(o, canonical_register));
        let source = match base {
            "pop" => return Self::lower_pop(insn, cx, b),
            "ldm" | "ldmia" | "ldmib" | "ldmda" | "ldmdb" => {
                return Self::lower_load_multiple(insn, base, cx, b);
            }
            "bx" => op(0),
            "mov" => op(1),
            "ldr" => Addressing::from_operands(&insn.operands, canonical_register).map(|a| a.mem),
            _ => None,
        };
        match source {
            Some(IsilOperand::Register(r)) if r == "lr" => cx.emit_return(b),
            Some(target) => b.goto(target),
            None => b.not_implemented(insn.to_string()),
        }
    }

    fn lower_load_store(insn: &Instruction, base: &str, b: &mut IsilBuilder) {
        let is_load = base.starts_with("ld");
        let is_pair = matches!(base, "ldrd" | "strd");
        let Some(addr) = Addressing::from_operands(&insn.operands, canonical_register) else {
            b.not_implemented(insn.to_string());
            return;
        };
        let count = if is_pair { 2 } else { 1 };
        let regs: Vec<_> = insn
            .operands
            .iter()
            .take(count)
            .filter(|o| o.kind == OperandKind::Register)
            .filter_map(|o| convert(o, canonical_register))
            .collect();
        if regs.len() != count {
            b.not_implemented(insn.to_string());
            return;
        }
        addr.emit_pre(b);
        for (i, reg) in regs.into_iter().enumerate() {
            let slot = displaced(&addr.mem, 4 * i as i64);
            if is_load {
                b.move_(reg, slot);
            } else {
                b.move_(slot, reg);
            }
        }
        addr.emit_post(b);
    }

    fn lower_data(insn: &Instruction, base: &str, cx: &LoweringContext<'_>, b: &mut IsilBuilder) {
        let op = |i: usize| insn.operands.get(i).and_then(|o| convert(o, canonical_register));

        match base {
            "push" | "vpush" => {
                for reg in Self::registers(insn).into_iter().rev() {
                    b.push(reg);
                }
            }
            "pop" | "vpop" => {
                for reg in Self::registers(insn) {
                    b.pop(reg);
                }
            }
            "ldm" | "ldmia" | "ldmib" | "ldmda" | "ldmdb" => {
                Self::lower_load_multiple(insn, base, cx, b)
            }
            "ldr" | "ldrb" | "ldrh" | "ldrsb" | "ldrsh" | "ldrd" | "str" | "strb" | "strh"
            | "strd" => Self::lower_load_store(insn, base, b),
            "mov" | "movw" | "adr" | "uxtb" | "uxth" | "sxtb" | "sxth" | "vmov" => {
                match (op(0), op(1)) {
                    (Some(d), Some(s)) => b.move_(d, s),
                    _ => b.not_implemented(insn.to_string()),
                }
            }
            "add" | "sub"
                if op(0).as_ref().and_then(|o| o.as_register()) == Some("sp")
                    && op(1).as_ref().and_then(|o| o.as_register()) == Some("sp")
                    && op(2).as_ref().is_some_and(|o| o.is_immediate()) =>
            {
                let amount = op(2).and_then(|o| o.as_immediate()).unwrap_or(0);
                b.shift_stack(if base == "sub" { -amount } else { amount });
            }
            // Thumb `sub sp, #imm` has no separate source
            "add" | "sub"
                if op(0).as_ref().and_then(|o| o.as_register()) == Some("sp")
                    && op(1).as_ref().is_some_and(|o| o.is_immediate())
                    && op(2).is_none() =>
            {
                let amount = op(1).and_then(|o| o.as_immediate()).unwrap_or(0);
                b.shift_stack(if base == "sub" { -amount } else { amount });
            }
            "rsb" => match (op(0), op(1), op(2)) {
                (Some(d), Some(l), Some(r)) => b.binary(IsilOpcode::Subtract, d, r, l),
                _ => b.not_implemented(insn.to_string()),
            },
            "mvn" | "neg" => match (op(0), op(1)) {
                (Some(d), Some(s)) => {
                    let opcode = if base == "mvn" {
                        IsilOpcode::Not
                    } else {
                        IsilOpcode::Negate
                    };
                    b.unary(opcode, d, s);
                }
                _ => b.not_implemented(insn.to_string()),
            },
            "cmp" => match (op(0), op(1)) {
                (Some(l), Some(r)) => b.compare(l, r),
                _ => b.not_implemented(insn.to_string()),
            },
            "tst" => match (op(0), op(1)) {
                (Some(l), Some(r)) => b.test(l, r),
                _ => b.not_implemented(insn.to_string()),
            },
            "nop" => b.nop(),
            _ => match binary_opcode(base) {
                Some(opcode) => match (op(0), op(1), op(2)) {
                    (Some(d), Some(l), Some(r)) => b.binary(opcode, d, l, r),
                    (Some(d), Some(s), None) => b.binary(opcode, d.clone(), d, s),
                    _ => b.not_implemented(insn.to_string()),
                },
                None => b.not_implemented(insn.to_string()),
            },
        }
    }
}

impl InstructionLowering for ArmLowering {
    fn lower(&self, insn: &Instruction, cx: &LoweringContext<'_>, b: &mut IsilBuilder) {
        if insn.flow != FlowControl::Next {
            Self::lower_transfer(insn, cx, b);
            return;
        }
        let parsed = split_arm_mnemonic(&insn.mnemonic);
        let start = b.len();
        Self::lower_data(insn, parsed.base, cx, b);
        // Predicated data processing is kept inline with its predicate noted
        if let Some(cond) = parsed.condition {
            b.annotate_since(start, &format!("executes if {:?}", cond));
        }
    }
}
