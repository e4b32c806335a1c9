//! Instruction decoder backends.
//!
//! - iced-x86 for x86/x64
//! - capstone for ARM32 (ARM and Thumb) and AArch64

pub mod capstone;
pub mod iced;
pub mod registry;
