//! AArch64 adapter.

use std::sync::Arc;

use tracing::warn;

use crate::analysis::cfg;
use crate::arch::body::extract_body;
use crate::arch::operands::{convert, displaced, Addressing};
use crate::arch::InstructionSet;
use crate::config::AnalysisConfig;
use crate::core::binary::Architecture;
use crate::core::control_flow_graph::ControlFlowGraph;
use crate::core::image::BinaryImage;
use crate::core::instruction::{FlowControl, Instruction};
use crate::core::method::MethodAnalysisContext;
use crate::disasm::capstone::CapstoneDisassembler;
use crate::error::Result;
use crate::isil::{
    lower_graph, InstructionLowering, IsilBuilder, IsilNode, IsilOpcode, IsilOperand,
    LoweringContext,
};
use crate::keyfunctions::KeyFunctionRegistry;

pub struct Arm64InstructionSet {
    image: Arc<dyn BinaryImage>,
    key_functions: Arc<KeyFunctionRegistry>,
    config: AnalysisConfig,
}

impl Arm64InstructionSet {
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

    /// A fresh Capstone handle for one decode session.
    fn decoder(&self) -> Result<CapstoneDisassembler> {
        Ok(CapstoneDisassembler::arm64()?)
    }
}

impl InstructionSet for Arm64InstructionSet {
    fn architecture(&self) -> Architecture {
        Architecture::ARM64
    }

    fn build_cfg(&self, ctx: &MethodAnalysisContext) -> Result<ControlFlowGraph> {
        let pointer = self.pointer_for_method(ctx);
        let span = crate::span_trace!(
            "build_cfg",
            method = %ctx.name,
            pointer = format_args!("{:#x}", pointer)
        );
        let _guard = span.enter();

        let body = self.method_body(ctx)?;
        let decoder = self.decoder()?;
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
        let decoder = self.decoder()?;
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
            return_register: "x0",
        };
        Ok(lower_graph(&Arm64Lowering, &cx))
    }
}

/// `wN` views map onto `xN`; `fp`/`lr` onto their numbered names.
fn canonical_register(name: &str) -> String {
    match name {
        "wzr" => "xzr".to_string(),
        "wsp" => "sp".to_string(),
        "fp" => "x29".to_string(),
        "lr" => "x30".to_string(),
        n => match n.strip_prefix('w') {
            Some(num) if num.parse::<u8>().is_ok() => format!("x{}", num),
            _ => n.to_string(),
        },
    }
}

/// Access width implied by the transfer register.
fn register_width(name: Option<&str>) -> i64 {
    match name.and_then(|n| n.chars().next()) {
        Some('w') | Some('s') => 4,
        Some('q') => 16,
        Some('h') => 2,
        Some('b') => 1,
        _ => 8,
    }
}

fn binary_opcode(mnemonic: &str) -> Option<IsilOpcode> {
    Some(match mnemonic {
        "add" | "adds" => IsilOpcode::Add,
        "sub" | "subs" => IsilOpcode::Subtract,
        "mul" => IsilOpcode::Multiply,
        "sdiv" | "udiv" => IsilOpcode::Divide,
        "lsl" => IsilOpcode::ShiftLeft,
        "lsr" | "asr" => IsilOpcode::ShiftRight,
        "and" | "ands" => IsilOpcode::And,
        "orr" => IsilOpcode::Or,
        "eor" => IsilOpcode::Xor,
        _ => return None,
    })
}

struct Arm64Lowering;

impl Arm64Lowering {
    fn lower_transfer(&self, insn: &Instruction, cx: &LoweringContext<'_>, b: &mut IsilBuilder) {
        let op = |i: usize| insn.operands.get(i).and_then(|o| convert(o, canonical_register));
        let target = insn.branch_target.map(|t| IsilOperand::imm(t as i64));

        match insn.flow {
            FlowControl::ConditionalBranch => {
                let (Some(cond), Some(target)) = (insn.condition, target) else {
                    b.not_implemented(insn.to_string());
                    return;
                };
                match insn.mnemonic.as_str() {
                    "cbz" | "cbnz" => match op(0) {
                        Some(r) => b.compare(r, IsilOperand::imm(0)),
                        None => {
                            b.not_implemented(insn.to_string());
                            return;
                        }
                    },
                    "tbz" | "tbnz" => match (op(0), op(1).and_then(|o| o.as_immediate())) {
                        (Some(r), Some(bit)) if (0..64).contains(&bit) => {
                            b.test(r, IsilOperand::imm(1i64.wrapping_shl(bit as u32)))
                        }
                        _ => {
                            b.not_implemented(insn.to_string());
                            return;
                        }
                    },
                    _ => {}
                }
                b.jump_if(cond, target);
            }
            FlowControl::Branch => match insn.branch_target {
                Some(t) => cx.emit_direct_jump(b, t),
                None => b.not_implemented(insn.to_string()),
            },
            FlowControl::IndirectBranch => match op(0) {
                Some(r) => b.goto(r),
                None => b.not_implemented(insn.to_string()),
            },
            FlowControl::Call => match insn.branch_target {
                Some(t) => cx.emit_direct_call(b, t),
                None => b.not_implemented(insn.to_string()),
            },
            FlowControl::IndirectCall => match op(0) {
                Some(r) => b.call(r, None),
                None => b.not_implemented(insn.to_string()),
            },
            FlowControl::Return => cx.emit_return(b),
            FlowControl::Interrupt => b.interrupt(),
            FlowControl::Next => {}
        }
    }

    fn lower_load_store(&self, insn: &Instruction, b: &mut IsilBuilder) {
        let m = insn.mnemonic.as_str();
        let is_load = m.starts_with("ld");
        let is_pair = matches!(m, "ldp" | "ldpsw" | "ldnp" | "stp" | "stnp");
        let Some(addr) = Addressing::from_operands(&insn.operands, canonical_register) else {
            b.not_implemented(insn.to_string());
            return;
        };
        let regs: Vec<_> = insn
            .operands
            .iter()
            .take(if is_pair { 2 } else { 1 })
            .filter_map(|o| convert(o, canonical_register))
            .collect();
        if regs.len() != if is_pair { 2 } else { 1 } {
            b.not_implemented(insn.to_string());
            return;
        }
        let width = if m == "ldpsw" {
            4
        } else {
            register_width(insn.operands.first().and_then(|o| o.register.as_deref()))
        };

        addr.emit_pre(b);
        for (i, reg) in regs.into_iter().enumerate() {
            let slot = displaced(&addr.mem, width * i as i64);
            if is_load {
                b.move_(reg, slot);
            } else {
                b.move_(slot, reg);
            }
        }
        addr.emit_post(b);
    }
}

impl InstructionLowering for Arm64Lowering {
    fn lower(&self, insn: &Instruction, cx: &LoweringContext<'_>, b: &mut IsilBuilder) {
        if insn.flow != FlowControl::Next {
            self.lower_transfer(insn, cx, b);
            return;
        }

        let op = |i: usize| insn.operands.get(i).and_then(|o| convert(o, canonical_register));
        let m = insn.mnemonic.as_str();

        if m.starts_with("ldr")
            || m.starts_with("ldur")
            || m.starts_with("str")
            || m.starts_with("stur")
            || matches!(m, "ldp" | "ldpsw" | "ldnp" | "stp" | "stnp")
        {
            self.lower_load_store(insn, b);
            return;
        }

        match m {
            "mov" | "movz" | "fmov" | "sxtw" | "uxtw" | "sxtb" | "sxth" | "uxtb" | "uxth"
            | "adrp" | "adr" => match (op(0), op(1)) {
                (Some(d), Some(s)) => b.move_(d, s),
                _ => b.not_implemented(insn.to_string()),
            },
            "add" | "sub"
                if op(0).as_ref().and_then(|o| o.as_register()) == Some("sp")
                    && op(1).as_ref().and_then(|o| o.as_register()) == Some("sp")
                    && op(2).as_ref().is_some_and(|o| o.is_immediate()) =>
            {
                let amount = op(2).and_then(|o| o.as_immediate()).unwrap_or(0);
                b.shift_stack(if m == "sub" { -amount } else { amount });
            }
            "mvn" | "neg" => match (op(0), op(1)) {
                (Some(d), Some(s)) => {
                    let opcode = if m == "mvn" {
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
            _ => match binary_opcode(m) {
                Some(opcode) => match (op(0), op(1), op(2)) {
                    (Some(d), Some(l), Some(r)) => b.binary(opcode, d, l, r),
                    (Some(d), Some(s), None) => b.binary(opcode, d.clone(), d, s),
                    _ => b.not_implemented(insn.to_string()),
                },
                // movk/movn and anything else without modeled semantics
                None => b.not_implemented(insn.to_string()),
            },
        }
    }
}
