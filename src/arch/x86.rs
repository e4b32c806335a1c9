//! x86 / x86-64 adapter: the reference instruction set.

use std::sync::Arc;

use iced_x86::{Mnemonic as M, OpKind, Register};
use tracing::warn;

use crate::analysis::cfg;
use crate::arch::body::extract_body;
use crate::arch::InstructionSet;
use crate::config::AnalysisConfig;
use crate::core::binary::Architecture;
use crate::core::control_flow_graph::ControlFlowGraph;
use crate::core::image::BinaryImage;
use crate::core::instruction::{FlowControl, Instruction};
use crate::core::method::MethodAnalysisContext;
use crate::disasm::iced::IcedDisassembler;
use crate::error::Result;
use crate::isil::{
    lower_graph, InstructionLowering, IsilBuilder, IsilMemoryOperand, IsilNode, IsilOpcode,
    IsilOperand, LoweringContext,
};
use crate::keyfunctions::KeyFunctionRegistry;

pub struct X86InstructionSet {
    decoder: IcedDisassembler,
    image: Arc<dyn BinaryImage>,
    key_functions: Arc<KeyFunctionRegistry>,
    config: AnalysisConfig,
}

impl X86InstructionSet {
    pub fn new(
        arch: Architecture,
        image: Arc<dyn BinaryImage>,
        key_functions: Arc<KeyFunctionRegistry>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            decoder: IcedDisassembler::new(arch),
            image,
            key_functions,
            config,
        }
    }

    fn return_register(&self) -> &'static str {
        if self.decoder.bitness() == 64 {
            "rax"
        } else {
            "eax"
        }
    }
}

impl InstructionSet for X86InstructionSet {
    fn architecture(&self) -> Architecture {
        crate::core::disassembler::Disassembler::architecture(&self.decoder)
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
        let graph = cfg::build_cfg(
            &self.decoder,
            pointer,
            &body,
            &self.config.cfg,
            &self.key_functions,
        );
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
        extract_body(
            self.image.as_ref(),
            &self.decoder,
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
            return_register: self.return_register(),
        };
        let lowering = X86Lowering {
            decoder: self.decoder,
        };
        Ok(lower_graph(&lowering, &cx))
    }
}

/// x86 mapping table. Re-decodes each instruction with iced to work on
/// the full register model.
struct X86Lowering {
    decoder: IcedDisassembler,
}

impl X86Lowering {
    fn is_64(&self) -> bool {
        self.decoder.bitness() == 64
    }

    fn stack_pointer(&self) -> &'static str {
        if self.is_64() {
            "rsp"
        } else {
            "esp"
        }
    }

    fn frame_pointer(&self) -> &'static str {
        if self.is_64() {
            "rbp"
        } else {
            "ebp"
        }
    }

    fn accumulator(&self) -> IsilOperand {
        IsilOperand::reg(if self.is_64() { "rax" } else { "eax" })
    }

    /// Register name widened to the full general-purpose register.
    fn register(&self, r: Register) -> String {
        let full = if r.is_gpr() {
            if self.is_64() {
                r.full_register()
            } else {
                r.full_register32()
            }
        } else {
            r
        };
        format!("{:?}", full).to_ascii_lowercase()
    }

    fn is_stack_pointer(&self, r: Register) -> bool {
        matches!(r, Register::RSP | Register::ESP | Register::SP)
    }

    fn operand(&self, raw: &iced_x86::Instruction, n: u32) -> Option<IsilOperand> {
        if n >= raw.op_count() {
            return None;
        }
        Some(match raw.op_kind(n) {
            OpKind::Register => IsilOperand::Register(self.register(raw.op_register(n))),
            OpKind::Memory => {
                // fs/gs address thread-local blocks, which have no flat address
                if matches!(raw.segment_prefix(), Register::FS | Register::GS) {
                    return None;
                }
                let base = raw.memory_base();
                let index = raw.memory_index();
                let disp = if self.is_64() {
                    raw.memory_displacement64() as i64
                } else {
                    i64::from(raw.memory_displacement32() as i32)
                };
                if self.is_stack_pointer(base) && index == Register::None {
                    return Some(IsilOperand::Stack(disp));
                }
                let base = match base {
                    Register::None | Register::RIP | Register::EIP => None,
                    b => Some(self.register(b)),
                };
                let index_name = (index != Register::None).then(|| self.register(index));
                IsilOperand::Memory(IsilMemoryOperand {
                    base,
                    index: index_name,
                    scale: raw.memory_index_scale() as u8,
                    addend: disp,
                })
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                IsilOperand::imm(raw.near_branch_target() as i64)
            }
            OpKind::Immediate8 => IsilOperand::imm(i64::from(raw.immediate8())),
            OpKind::Immediate8_2nd => IsilOperand::imm(i64::from(raw.immediate8_2nd())),
            OpKind::Immediate16 => IsilOperand::imm(i64::from(raw.immediate16())),
            OpKind::Immediate32 => IsilOperand::imm(i64::from(raw.immediate32() as i32)),
            OpKind::Immediate64 => IsilOperand::imm(raw.immediate64() as i64),
            OpKind::Immediate8to16 => IsilOperand::imm(i64::from(raw.immediate8to16())),
            OpKind::Immediate8to32 => IsilOperand::imm(i64::from(raw.immediate8to32())),
            OpKind::Immediate8to64 => IsilOperand::imm(raw.immediate8to64()),
            OpKind::Immediate32to64 => IsilOperand::imm(raw.immediate32to64()),
            _ => return None,
        })
    }

    fn lower_raw(
        &self,
        raw: &iced_x86::Instruction,
        insn: &Instruction,
        cx: &LoweringContext<'_>,
        b: &mut IsilBuilder,
    ) {
        let op = |n: u32| self.operand(raw, n);

        // Control transfers first; the decoder already classified them
        match insn.flow {
            FlowControl::ConditionalBranch => {
                match (insn.condition, insn.branch_target) {
                    (Some(cond), Some(target)) => b.jump_if(cond, IsilOperand::imm(target as i64)),
                    // loop/jrcxz have no flag condition
                    _ => b.not_implemented(insn.to_string()),
                }
                return;
            }
            FlowControl::Branch => {
                match insn.branch_target {
                    Some(target) => cx.emit_direct_jump(b, target),
                    None => b.not_implemented(insn.to_string()),
                }
                return;
            }
            FlowControl::IndirectBranch => {
                match op(0) {
                    Some(target) => b.goto(target),
                    None => b.not_implemented(insn.to_string()),
                }
                return;
            }
            FlowControl::Call => {
                match insn.branch_target {
                    Some(target) => cx.emit_direct_call(b, target),
                    None => b.not_implemented(insn.to_string()),
                }
                return;
            }
            FlowControl::IndirectCall => {
                match op(0) {
                    Some(target) => b.call(target, None),
                    None => b.not_implemented(insn.to_string()),
                }
                return;
            }
            FlowControl::Return => {
                cx.emit_return(b);
                return;
            }
            FlowControl::Interrupt => {
                b.interrupt();
                return;
            }
            FlowControl::Next => {}
        }

        let two = |b: &mut IsilBuilder, opcode: IsilOpcode| match (op(0), op(1)) {
            (Some(d), Some(s)) => {
                b.emit(opcode, vec![d, s]);
            }
            _ => b.not_implemented(insn.to_string()),
        };
        // dst = dst op src
        let accumulate = |b: &mut IsilBuilder, opcode: IsilOpcode| match (op(0), op(1)) {
            (Some(d), Some(s)) => b.binary(opcode, d.clone(), d, s),
            _ => b.not_implemented(insn.to_string()),
        };

        match raw.mnemonic() {
            M::Mov | M::Movzx | M::Movsx | M::Movsxd | M::Movaps | M::Movups | M::Movapd
            | M::Movupd | M::Movss | M::Movsd | M::Movq | M::Movd | M::Movdqa | M::Movdqu => {
                two(b, IsilOpcode::Move)
            }
            M::Lea => two(b, IsilOpcode::LoadAddress),
            M::Xchg => two(b, IsilOpcode::Exchange),
            M::Add | M::Sub
                if raw.op_kind(0) == OpKind::Register
                    && self.is_stack_pointer(raw.op_register(0))
                    && op(1).and_then(|o| o.as_immediate()).is_some() =>
            {
                let amount = op(1).and_then(|o| o.as_immediate()).unwrap_or(0);
                b.shift_stack(if raw.mnemonic() == M::Sub { -amount } else { amount });
            }
            M::Xor | M::Sub
                if raw.op_count() == 2
                    && raw.op_kind(0) == OpKind::Register
                    && raw.op_kind(1) == OpKind::Register
                    && raw.op_register(0) == raw.op_register(1) =>
            {
                // Zeroing idiom
                if let Some(d) = op(0) {
                    b.move_(d, IsilOperand::imm(0));
                }
            }
            M::Add | M::Adc => accumulate(b, IsilOpcode::Add),
            M::Sub | M::Sbb => accumulate(b, IsilOpcode::Subtract),
            M::And => accumulate(b, IsilOpcode::And),
            M::Or => accumulate(b, IsilOpcode::Or),
            M::Xor => accumulate(b, IsilOpcode::Xor),
            M::Shl | M::Sal => accumulate(b, IsilOpcode::ShiftLeft),
            M::Shr | M::Sar => accumulate(b, IsilOpcode::ShiftRight),
            M::Imul => match raw.op_count() {
                1 => match op(0) {
                    Some(s) => b.binary(
                        IsilOpcode::Multiply,
                        self.accumulator(),
                        self.accumulator(),
                        s,
                    ),
                    None => b.not_implemented(insn.to_string()),
                },
                2 => accumulate(b, IsilOpcode::Multiply),
                _ => match (op(0), op(1), op(2)) {
                    (Some(d), Some(l), Some(r)) => b.binary(IsilOpcode::Multiply, d, l, r),
                    _ => b.not_implemented(insn.to_string()),
                },
            },
            M::Mul | M::Div | M::Idiv => {
                let opcode = if raw.mnemonic() == M::Mul {
                    IsilOpcode::Multiply
                } else {
                    IsilOpcode::Divide
                };
                match op(0) {
                    Some(s) => b.binary(opcode, self.accumulator(), self.accumulator(), s),
                    None => b.not_implemented(insn.to_string()),
                }
            }
            M::Inc | M::Dec => match op(0) {
                Some(d) => {
                    let opcode = if raw.mnemonic() == M::Inc {
                        IsilOpcode::Add
                    } else {
                        IsilOpcode::Subtract
                    };
                    b.binary(opcode, d.clone(), d, IsilOperand::imm(1));
                }
                None => b.not_implemented(insn.to_string()),
            },
            M::Neg | M::Not => match op(0) {
                Some(d) => {
                    let opcode = if raw.mnemonic() == M::Neg {
                        IsilOpcode::Negate
                    } else {
                        IsilOpcode::Not
                    };
                    b.unary(opcode, d.clone(), d);
                }
                None => b.not_implemented(insn.to_string()),
            },
            M::Cmp => two(b, IsilOpcode::Compare),
            M::Test => match (op(0), op(1)) {
                (Some(l), Some(r)) if l == r => b.compare(l, IsilOperand::imm(0)),
                (Some(l), Some(r)) => b.test(l, r),
                _ => b.not_implemented(insn.to_string()),
            },
            M::Push => match op(0) {
                Some(src) => b.push(src),
                None => b.not_implemented(insn.to_string()),
            },
            M::Pop => match op(0) {
                Some(dst) => b.pop(dst),
                None => b.not_implemented(insn.to_string()),
            },
            M::Leave => {
                b.move_(
                    IsilOperand::reg(self.stack_pointer()),
                    IsilOperand::reg(self.frame_pointer()),
                );
                b.pop(IsilOperand::reg(self.frame_pointer()));
            }
            M::Nop | M::Endbr64 | M::Endbr32 | M::Pause | M::Fnop => b.nop(),
            _ => b.not_implemented(insn.to_string()),
        }
    }
}

impl InstructionLowering for X86Lowering {
    fn lower(&self, insn: &Instruction, cx: &LoweringContext<'_>, b: &mut IsilBuilder) {
        match self.decoder.decode_raw(insn.address, &insn.bytes) {
            Ok(raw) => self.lower_raw(&raw, insn, cx, b),
            Err(_) => b.not_implemented(insn.to_string()),
        }
    }
}
