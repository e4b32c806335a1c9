use crate::core::address::VirtualAddress;
use crate::core::binary::Architecture;
use crate::core::disassembler::{Disassembler, DisassemblerError, DisassemblerResult};
use crate::core::instruction::{Access, Condition, FlowControl, Instruction, Operand};

/// x86/x86-64 decoder backed by iced-x86.
#[derive(Debug, Clone, Copy)]
pub struct IcedDisassembler {
    bits: u32,
    arch: Architecture,
}

impl IcedDisassembler {
    pub fn new(arch: Architecture) -> Self {
        let bits = match arch {
            Architecture::X86 => 32,
            _ => 64,
        };
        Self { bits, arch }
    }

    pub fn bitness(&self) -> u32 {
        self.bits
    }

    /// Decode one raw iced instruction. Used by lowering, which needs the
    /// full register model rather than the neutral operand text.
    pub fn decode_raw(
        &self,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> DisassemblerResult<iced_x86::Instruction> {
        use iced_x86::{Decoder, DecoderError, DecoderOptions};

        if bytes.is_empty() {
            return Err(DisassemblerError::InsufficientBytes {
                address,
                available: 0,
            });
        }
        let mut decoder = Decoder::with_ip(self.bits, bytes, address, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => DisassemblerError::InsufficientBytes {
                    address,
                    available: bytes.len(),
                },
                _ => DisassemblerError::InvalidInstruction { address },
            });
        }
        Ok(instr)
    }

    fn register_name(r: iced_x86::Register) -> String {
        format!("{:?}", r).to_ascii_lowercase()
    }

    fn iced_operands(instr: &iced_x86::Instruction, bits: u32) -> Vec<Operand> {
        use iced_x86::{OpKind, Register as IReg};
        let mut out = Vec::new();
        for i in 0..instr.op_count() {
            // Destination first in Intel order
            let access = if i == 0 && instr.op_count() > 1 {
                Access::ReadWrite
            } else {
                Access::Read
            };
            match instr.op_kind(i) {
                OpKind::Register => {
                    let r = instr.op_register(i);
                    out.push(Operand::register(
                        Self::register_name(r),
                        (r.size() * 8) as u8,
                        access,
                    ));
                }
                OpKind::Memory => {
                    let base = instr.memory_base();
                    let index = instr.memory_index();
                    let scale = instr.memory_index_scale();
                    let disp = instr.memory_displacement64() as i64;
                    let base_s = (base != IReg::None).then(|| Self::register_name(base));
                    let index_s = (index != IReg::None).then(|| Self::register_name(index));
                    let scale_u8 = (index != IReg::None && scale > 0).then_some(scale as u8);
                    out.push(Operand::memory(
                        (instr.memory_size().size() * 8).min(255) as u8,
                        access,
                        Some(disp),
                        base_s,
                        index_s,
                        scale_u8,
                    ));
                }
                OpKind::Immediate8
                | OpKind::Immediate8_2nd
                | OpKind::Immediate16
                | OpKind::Immediate32
                | OpKind::Immediate64
                | OpKind::Immediate8to16
                | OpKind::Immediate8to32
                | OpKind::Immediate8to64
                | OpKind::Immediate32to64 => {
                    out.push(Operand::immediate(instr.immediate(i) as i64, 0));
                }
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    let target = instr.near_branch_target() as i64;
                    out.push(Operand::immediate(target, if bits >= 64 { 64 } else { 32 }));
                }
                // Far branches and string operands carry no structured form
                _ => {}
            }
        }
        out
    }

    fn classify(instr: &iced_x86::Instruction) -> (FlowControl, Option<VirtualAddress>) {
        use iced_x86::{FlowControl as F, OpKind};

        let near = matches!(
            instr.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        );
        let target = near.then(|| instr.near_branch_target());
        match instr.flow_control() {
            F::Next | F::XbeginXabortXend => (FlowControl::Next, None),
            F::UnconditionalBranch if near => (FlowControl::Branch, target),
            F::UnconditionalBranch | F::IndirectBranch => (FlowControl::IndirectBranch, None),
            F::ConditionalBranch => (FlowControl::ConditionalBranch, target),
            F::Call if near => (FlowControl::Call, target),
            F::Call | F::IndirectCall => (FlowControl::IndirectCall, None),
            F::Return => (FlowControl::Return, None),
            F::Interrupt | F::Exception => (FlowControl::Interrupt, None),
        }
    }

    fn condition(instr: &iced_x86::Instruction) -> Option<Condition> {
        use iced_x86::ConditionCode as C;
        Some(match instr.condition_code() {
            C::o => Condition::Overflow,
            C::no => Condition::NotOverflow,
            C::b => Condition::Below,
            C::ae => Condition::AboveOrEqual,
            C::e => Condition::Equal,
            C::ne => Condition::NotEqual,
            C::be => Condition::BelowOrEqual,
            C::a => Condition::Above,
            C::s => Condition::Sign,
            C::ns => Condition::NotSign,
            C::p => Condition::Parity,
            C::np => Condition::NotParity,
            C::l => Condition::Less,
            C::ge => Condition::GreaterOrEqual,
            C::le => Condition::LessOrEqual,
            C::g => Condition::Greater,
            _ => return None,
        })
    }
}

/// Map an iced condition code onto the neutral condition set.
pub fn condition_of(instr: &iced_x86::Instruction) -> Option<Condition> {
    IcedDisassembler::condition(instr)
}

impl Disassembler for IcedDisassembler {
    fn disassemble_instruction(
        &self,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> DisassemblerResult<Instruction> {
        use iced_x86::{Formatter, IntelFormatter};

        if !matches!(self.arch, Architecture::X86 | Architecture::X86_64) {
            return Err(DisassemblerError::UnsupportedArchitecture(self.arch));
        }
        let instr = self.decode_raw(address, bytes)?;
        let len = instr.len();

        let mut fmt = IntelFormatter::new();
        let mut out = String::new();
        fmt.format(&instr, &mut out);
        let mnemonic = match out.split_once(' ') {
            Some((m, _)) => m.to_string(),
            None => out.clone(),
        };

        let (flow, branch_target) = Self::classify(&instr);
        let condition = if flow == FlowControl::ConditionalBranch {
            Self::condition(&instr)
        } else {
            None
        };

        Ok(Instruction {
            address,
            bytes: bytes[..len.min(bytes.len())].to_vec(),
            mnemonic,
            operands: Self::iced_operands(&instr, self.bits),
            length: len as u16,
            flow,
            branch_target,
            condition,
        })
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn name(&self) -> &str {
        "iced-x86"
    }
}
