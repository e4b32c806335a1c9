use capstone::arch::arm::ArmOperandType;
use capstone::arch::arm64::Arm64OperandType;
use capstone::prelude::*;
use capstone::Capstone;

use crate::core::address::VirtualAddress;
use crate::core::binary::Architecture;
use crate::core::disassembler::{Disassembler, DisassemblerError, DisassemblerResult};
use crate::core::instruction::{Access, Condition, FlowControl, Instruction, Operand};

/// ARM32/ARM64 decoder backed by Capstone.
///
/// A Capstone handle is not thread-safe, so callers create one decoder per
/// decode session (one method) instead of sharing it across workers.
pub struct CapstoneDisassembler {
    cs: Capstone,
    arch: Architecture,
    thumb: bool,
}

impl CapstoneDisassembler {
    /// AArch64 decoder.
    pub fn arm64() -> DisassemblerResult<Self> {
        let cs = Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .detail(true)
            .build()
            .map_err(|e| DisassemblerError::Backend(e.to_string()))?;
        Ok(Self {
            cs,
            arch: Architecture::ARM64,
            thumb: false,
        })
    }

    /// ARM32 decoder in ARM or Thumb state.
    pub fn arm(thumb: bool) -> DisassemblerResult<Self> {
        let mode = if thumb {
            arch::arm::ArchMode::Thumb
        } else {
            arch::arm::ArchMode::Arm
        };
        let cs = Capstone::new()
            .arm()
            .mode(mode)
            .detail(true)
            .build()
            .map_err(|e| DisassemblerError::Backend(e.to_string()))?;
        Ok(Self {
            cs,
            arch: Architecture::ARM,
            thumb,
        })
    }

    pub fn new(arch: Architecture) -> DisassemblerResult<Self> {
        match arch {
            Architecture::ARM64 => Self::arm64(),
            Architecture::ARM => Self::arm(false),
            other => Err(DisassemblerError::UnsupportedArchitecture(other)),
        }
    }

    pub fn is_thumb(&self) -> bool {
        self.thumb
    }

    fn min_instruction_length(&self) -> usize {
        if self.thumb {
            2
        } else {
            4
        }
    }

    fn reg(&self, r: RegId) -> String {
        self.cs.reg_name(r).unwrap_or_default()
    }

    fn mem_operand(
        &self,
        base: RegId,
        index: RegId,
        scale: Option<u8>,
        disp: i64,
        access: Access,
    ) -> Operand {
        let base = (base.0 != 0).then(|| self.reg(base));
        let index = (index.0 != 0).then(|| self.reg(index));
        Operand::memory(0, access, Some(disp), base, index, scale)
    }

    fn detail_operands(&self, insn: &capstone::Insn) -> Vec<Operand> {
        let mut operands = Vec::new();
        let Ok(detail) = self.cs.insn_detail(insn) else {
            return operands;
        };
        let arch_detail = detail.arch_detail();
        match self.arch {
            Architecture::ARM64 => {
                if let Some(ad) = arch_detail.arm64() {
                    let writeback = ad.writeback();
                    let count = ad.operands().count();
                    for (i, op) in ad.operands().enumerate() {
                        let access = operand_access(i, count);
                        match op.op_type {
                            Arm64OperandType::Reg(r) => {
                                operands.push(Operand::register(self.reg(r), 0, access))
                            }
                            Arm64OperandType::Imm(v) => operands.push(Operand::immediate(v, 0)),
                            Arm64OperandType::Mem(m) => {
                                let mut op = self.mem_operand(
                                    m.base(),
                                    m.index(),
                                    None,
                                    i64::from(m.disp()),
                                    access,
                                );
                                // Post-index forms carry a trailing immediate instead
                                if writeback && i + 1 == count {
                                    op = op.with_writeback();
                                }
                                operands.push(op);
                            }
                            _ => {}
                        }
                    }
                }
            }
            Architecture::ARM => {
                if let Some(ad) = arch_detail.arm() {
                    let writeback = ad.writeback();
                    let count = ad.operands().count();
                    // Block transfers (`ldm r4!, {..}`) update a register base
                    let register_base = writeback
                        && insn
                            .mnemonic()
                            .is_some_and(|m| m.starts_with("ldm") || m.starts_with("stm"));
                    for (i, op) in ad.operands().enumerate() {
                        let access = operand_access(i, count);
                        match op.op_type {
                            ArmOperandType::Reg(r) => {
                                let reg = Operand::register(self.reg(r), 0, access);
                                operands.push(if register_base && i == 0 {
                                    reg.with_writeback()
                                } else {
                                    reg
                                })
                            }
                            ArmOperandType::Imm(v) => {
                                operands.push(Operand::immediate(i64::from(v), 0))
                            }
                            ArmOperandType::Mem(m) => {
                                let scale = (m.index().0 != 0 && m.scale() > 1)
                                    .then_some(m.scale() as u8);
                                let mut op = self.mem_operand(
                                    m.base(),
                                    m.index(),
                                    scale,
                                    i64::from(m.disp()),
                                    access,
                                );
                                if writeback && i + 1 == count {
                                    op = op.with_writeback();
                                }
                                operands.push(op);
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {}
        }
        operands
    }
}

fn operand_access(index: usize, count: usize) -> Access {
    if index == 0 && count > 1 {
        Access::ReadWrite
    } else {
        Access::Read
    }
}

/// Last immediate operand, which holds the absolute target of direct branches.
fn last_immediate(operands: &[Operand]) -> Option<VirtualAddress> {
    operands
        .iter()
        .rev()
        .find_map(|o| o.immediate)
        .map(|v| v as u64)
}

fn names_pc(operands: &[Operand]) -> bool {
    operands
        .iter()
        .any(|o| matches!(o.register.as_deref(), Some("pc" | "r15")))
}

/// Classify an AArch64 instruction by mnemonic.
pub fn classify_arm64(
    mnemonic: &str,
    operands: &[Operand],
) -> (FlowControl, Option<VirtualAddress>, Option<Condition>) {
    match mnemonic {
        "ret" | "retaa" | "retab" => (FlowControl::Return, None, None),
        "b" => (FlowControl::Branch, last_immediate(operands), None),
        "bl" => (FlowControl::Call, last_immediate(operands), None),
        "br" | "braa" | "brab" | "braaz" | "brabz" => (FlowControl::IndirectBranch, None, None),
        "blr" | "blraa" | "blrab" | "blraaz" | "blrabz" => {
            (FlowControl::IndirectCall, None, None)
        }
        "cbz" | "tbz" => (
            FlowControl::ConditionalBranch,
            last_immediate(operands),
            Some(Condition::Equal),
        ),
        "cbnz" | "tbnz" => (
            FlowControl::ConditionalBranch,
            last_immediate(operands),
            Some(Condition::NotEqual),
        ),
        "brk" | "udf" | "hlt" => (FlowControl::Interrupt, None, None),
        m => match m.strip_prefix("b.").or_else(|| m.strip_prefix("bc.")) {
            Some("al") => (FlowControl::Branch, last_immediate(operands), None),
            Some(cc) => match Condition::from_arm_suffix(cc) {
                Some(cond) => (
                    FlowControl::ConditionalBranch,
                    last_immediate(operands),
                    Some(cond),
                ),
                None => (FlowControl::Next, None, None),
            },
            None => (FlowControl::Next, None, None),
        },
    }
}

/// ARM32 base mnemonics that accept the flag-setting `s` suffix.
const ARM_ALU_BASES: &[&str] = &[
    "add", "adc", "sub", "sbc", "rsb", "rsc", "mul", "mla", "mls", "and", "orr", "eor", "bic",
    "orn", "mov", "mvn", "lsl", "lsr", "asr", "ror", "rrx", "neg", "umull", "smull", "umlal",
    "smlal",
];

const ARM_OTHER_BASES: &[&str] = &[
    "cmp", "cmn", "tst", "teq", "b", "bl", "blx", "bx", "cbz", "cbnz", "ldr", "ldrb", "ldrh",
    "ldrsb", "ldrsh", "ldrd", "str", "strb", "strh", "strd", "ldm", "ldmia", "ldmdb", "ldmib",
    "ldmda", "stm", "stmia", "stmdb", "stmib", "stmda", "push", "pop", "nop", "svc", "bkpt",
    "udf", "adr", "movw", "movt", "sdiv", "udiv", "uxtb", "uxth", "sxtb", "sxth", "tbb", "tbh",
    "vpush", "vpop", "vmov", "vldr", "vstr", "dmb", "dsb", "isb", "clz", "rev",
];

/// A decomposed ARM32 mnemonic: `<base>[s][<cond>][.w|.n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmMnemonic<'a> {
    pub base: &'a str,
    pub set_flags: bool,
    /// `None` for unconditional (including an explicit `al`)
    pub condition: Option<Condition>,
}

/// Split an ARM32 mnemonic into base, flag-setting bit and condition.
/// Unknown mnemonics come back whole with no suffixes.
pub fn split_arm_mnemonic(mnemonic: &str) -> ArmMnemonic<'_> {
    let m = mnemonic
        .strip_suffix(".w")
        .or_else(|| mnemonic.strip_suffix(".n"))
        .unwrap_or(mnemonic);

    let mut candidates: Vec<(&str, bool)> = ARM_ALU_BASES
        .iter()
        .map(|b| (*b, true))
        .chain(ARM_OTHER_BASES.iter().map(|b| (*b, false)))
        .filter(|(b, _)| m.starts_with(b))
        .collect();
    candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    for (base, alu) in candidates {
        let mut rest = &m[base.len()..];
        let mut set_flags = false;
        if alu {
            if let Some(r) = rest.strip_prefix('s') {
                // "s" followed by nothing or a valid condition
                if r.is_empty() || r == "al" || Condition::from_arm_suffix(r).is_some() {
                    set_flags = true;
                    rest = r;
                }
            }
        }
        let condition = match rest {
            "" | "al" => None,
            cc => match Condition::from_arm_suffix(cc) {
                Some(c) => Some(c),
                None => continue,
            },
        };
        return ArmMnemonic {
            base,
            set_flags,
            condition,
        };
    }

    ArmMnemonic {
        base: m,
        set_flags: false,
        condition: None,
    }
}

/// Classify an ARM32 instruction by mnemonic and operands.
pub fn classify_arm(
    mnemonic: &str,
    operands: &[Operand],
) -> (FlowControl, Option<VirtualAddress>, Option<Condition>) {
    let parsed = split_arm_mnemonic(mnemonic);
    let cond = parsed.condition;
    // A conditional transfer keeps the fallthrough path alive
    let transfer = |unconditional: FlowControl| {
        if cond.is_some() {
            FlowControl::ConditionalBranch
        } else {
            unconditional
        }
    };

    match parsed.base {
        "b" => (transfer(FlowControl::Branch), last_immediate(operands), cond),
        "bl" => (FlowControl::Call, last_immediate(operands), None),
        "blx" => match last_immediate(operands) {
            Some(t) => (FlowControl::Call, Some(t), None),
            None => (FlowControl::IndirectCall, None, None),
        },
        "bx" => {
            let to_lr = matches!(
                operands.first().and_then(|o| o.register.as_deref()),
                Some("lr" | "r14")
            );
            let flow = if to_lr {
                FlowControl::Return
            } else {
                FlowControl::IndirectBranch
            };
            (transfer(flow), None, cond)
        }
        "cbz" => (
            FlowControl::ConditionalBranch,
            last_immediate(operands),
            Some(Condition::Equal),
        ),
        "cbnz" => (
            FlowControl::ConditionalBranch,
            last_immediate(operands),
            Some(Condition::NotEqual),
        ),
        "pop" if names_pc(operands) => (transfer(FlowControl::Return), None, cond),
        // Loading pc is a return only when the words come off the stack
        "ldm" | "ldmia" | "ldmib" | "ldmda" | "ldmdb" if names_pc(operands) => {
            let from_stack = matches!(
                operands.first().and_then(|o| o.register.as_deref()),
                Some("sp" | "r13")
            );
            let flow = if from_stack {
                FlowControl::Return
            } else {
                FlowControl::IndirectBranch
            };
            (transfer(flow), None, cond)
        }
        "mov"
            if operands.first().and_then(|o| o.register.as_deref()) == Some("pc")
                && operands.get(1).and_then(|o| o.register.as_deref()) == Some("lr") =>
        {
            (transfer(FlowControl::Return), None, cond)
        }
        "tbb" | "tbh" => (FlowControl::IndirectBranch, None, None),
        "ldr" | "add" | "sub" | "mov"
            if operands.first().and_then(|o| o.register.as_deref()) == Some("pc") =>
        {
            (transfer(FlowControl::IndirectBranch), None, cond)
        }
        "bkpt" | "udf" => (FlowControl::Interrupt, None, None),
        _ => (FlowControl::Next, None, None),
    }
}

impl Disassembler for CapstoneDisassembler {
    fn disassemble_instruction(
        &self,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> DisassemblerResult<Instruction> {
        if bytes.len() < self.min_instruction_length() {
            return Err(DisassemblerError::InsufficientBytes {
                address,
                available: bytes.len(),
            });
        }
        let insns = self
            .cs
            .disasm_count(bytes, address, 1)
            .map_err(|_| DisassemblerError::InvalidInstruction { address })?;
        let insn = insns
            .iter()
            .next()
            .ok_or(DisassemblerError::InvalidInstruction { address })?;

        let mnemonic = insn.mnemonic().unwrap_or("").to_ascii_lowercase();
        let operands = self.detail_operands(&insn);
        let (flow, branch_target, condition) = match self.arch {
            Architecture::ARM64 => classify_arm64(&mnemonic, &operands),
            _ => classify_arm(&mnemonic, &operands),
        };

        Ok(Instruction {
            address,
            bytes: insn.bytes().to_vec(),
            mnemonic,
            operands,
            length: insn.bytes().len() as u16,
            flow,
            branch_target,
            condition,
        })
    }

    fn instruction_alignment(&self) -> u64 {
        self.min_instruction_length() as u64
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn name(&self) -> &str {
        "capstone"
    }
}
