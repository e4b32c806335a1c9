//! Decoder selection by architecture, for callers that work below the
//! instruction-set adapters (fuzzing, standalone CFG construction).

use crate::core::address::VirtualAddress;
use crate::core::binary::Architecture;
use crate::core::disassembler::{Disassembler, DisassemblerError, DisassemblerResult};
use crate::core::instruction::Instruction;

use super::capstone::CapstoneDisassembler;
use super::iced::IcedDisassembler;

/// Either decoder backend behind one concrete type.
pub enum AnyDisassembler {
    X86(IcedDisassembler),
    Arm(CapstoneDisassembler),
}

macro_rules! each_backend {
    ($self:ident, $d:ident => $body:expr) => {
        match $self {
            AnyDisassembler::X86($d) => $body,
            AnyDisassembler::Arm($d) => $body,
        }
    };
}

impl Disassembler for AnyDisassembler {
    fn disassemble_instruction(
        &self,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> DisassemblerResult<Instruction> {
        each_backend!(self, d => d.disassemble_instruction(address, bytes))
    }

    fn instruction_alignment(&self) -> u64 {
        each_backend!(self, d => d.instruction_alignment())
    }

    fn architecture(&self) -> Architecture {
        each_backend!(self, d => d.architecture())
    }

    fn name(&self) -> &str {
        each_backend!(self, d => d.name())
    }
}

/// Decoder for `arch`. ARM32 starts in ARM state; use [`for_thumb`] for Thumb code.
pub fn for_arch(arch: Architecture) -> DisassemblerResult<AnyDisassembler> {
    match arch {
        Architecture::X86 | Architecture::X86_64 => {
            Ok(AnyDisassembler::X86(IcedDisassembler::new(arch)))
        }
        Architecture::ARM | Architecture::ARM64 => {
            CapstoneDisassembler::new(arch).map(AnyDisassembler::Arm)
        }
        Architecture::Wasm | Architecture::Unknown => {
            Err(DisassemblerError::UnsupportedArchitecture(arch))
        }
    }
}

pub fn for_thumb() -> DisassemblerResult<AnyDisassembler> {
    CapstoneDisassembler::arm(true).map(AnyDisassembler::Arm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_selection() {
        assert_eq!(for_arch(Architecture::X86_64).unwrap().name(), "iced-x86");
        assert_eq!(for_arch(Architecture::ARM64).unwrap().name(), "capstone");
        assert_eq!(
            for_arch(Architecture::Wasm).err(),
            Some(DisassemblerError::UnsupportedArchitecture(Architecture::Wasm))
        );
        assert!(for_arch(Architecture::Unknown).is_err());
    }

    #[test]
    fn test_alignment_per_backend() {
        assert_eq!(for_arch(Architecture::X86).unwrap().instruction_alignment(), 1);
        assert_eq!(for_arch(Architecture::ARM).unwrap().instruction_alignment(), 4);
        assert_eq!(for_thumb().unwrap().instruction_alignment(), 2);
        assert_eq!(for_arch(Architecture::ARM64).unwrap().instruction_alignment(), 4);
    }
}
