//! Single-instruction decoding interface.
//!
//! Backends (iced-x86, Capstone) implement [`Disassembler`]. Decode errors
//! are local and non-fatal: the CFG builder turns them into truncated blocks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::address::VirtualAddress;
use crate::core::binary::Architecture;
use crate::core::instruction::Instruction;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DisassemblerError {
    #[error("invalid instruction at {address:#x}")]
    InvalidInstruction { address: VirtualAddress },

    /// The bytes end before the instruction does
    #[error("instruction at {address:#x} is cut short ({available} bytes available)")]
    InsufficientBytes {
        address: VirtualAddress,
        available: usize,
    },

    #[error("no decoder backend for {0}")]
    UnsupportedArchitecture(Architecture),

    /// The backend itself could not be set up
    #[error("decoder backend failure: {0}")]
    Backend(String),
}

pub type DisassemblerResult<T> = Result<T, DisassemblerError>;

pub trait Disassembler {
    /// Decode the instruction at `address`; `bytes` starts at `address`.
    ///
    /// Implementations must fill in `flow`, `branch_target` and `condition`.
    fn disassemble_instruction(
        &self,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> DisassemblerResult<Instruction>;

    /// Every instruction starts on a multiple of this many bytes.
    fn instruction_alignment(&self) -> u64 {
        1
    }

    fn architecture(&self) -> Architecture;

    fn name(&self) -> &str;
}
