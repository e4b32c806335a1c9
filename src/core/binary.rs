//! Architecture descriptors for a loaded binary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instruction set architectures a binary may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// x86 (32-bit)
    X86,
    /// x86-64 (64-bit)
    X86_64,
    /// ARM (32-bit, ARM and Thumb states)
    ARM,
    /// ARM64/AArch64 (64-bit)
    ARM64,
    /// WebAssembly bytecode
    Wasm,
    /// Unknown/unsupported architecture
    Unknown,
}

impl Architecture {
    /// Get the address size in bits for this architecture
    pub fn address_bits(&self) -> u8 {
        match self {
            Architecture::X86 => 32,
            Architecture::X86_64 => 64,
            Architecture::ARM => 32,
            Architecture::ARM64 => 64,
            Architecture::Wasm => 32,
            Architecture::Unknown => 64, // Default to 64-bit
        }
    }

    /// Pointer size in bytes
    pub fn pointer_size(&self) -> u64 {
        u64::from(self.address_bits() / 8)
    }

    /// Check if this is a 64-bit architecture
    pub fn is_64_bit(&self) -> bool {
        self.address_bits() == 64
    }

    /// Map an `object` crate architecture onto ours.
    pub fn from_object(arch: object::Architecture) -> Self {
        match arch {
            object::Architecture::I386 => Architecture::X86,
            object::Architecture::X86_64 => Architecture::X86_64,
            object::Architecture::Arm => Architecture::ARM,
            object::Architecture::Aarch64 => Architecture::ARM64,
            object::Architecture::Wasm32 => Architecture::Wasm,
            _ => Architecture::Unknown,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "x86"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::ARM => write!(f, "arm"),
            Architecture::ARM64 => write!(f, "arm64"),
            Architecture::Wasm => write!(f, "wasm"),
            Architecture::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86" | "i386" | "i686" => Ok(Architecture::X86),
            "x86_64" | "x86-64" | "amd64" | "x64" => Ok(Architecture::X86_64),
            "arm" | "arm32" | "armv7" => Ok(Architecture::ARM),
            "arm64" | "aarch64" => Ok(Architecture::ARM64),
            "wasm" | "wasm32" => Ok(Architecture::Wasm),
            other => Err(format!("unknown architecture '{}'", other)),
        }
    }
}
