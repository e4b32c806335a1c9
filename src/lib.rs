//! Instruction-set-independent lowering of compiled managed-runtime code.
//!
//! For each method discovered in a loaded binary, an architecture adapter
//! builds a control-flow graph over the method's machine code and lowers it
//! to ISIL, a small architecture-neutral IR. Calls into well-known runtime
//! helpers are tagged with their role.

/// Analysis configuration
pub mod config;
/// Error types
pub mod error;
/// Tracing setup and logging macros
pub mod logging;

/// Core data types module
pub mod core;
/// Decoder backends
pub mod disasm;

/// CFG construction and the analysis session
pub mod analysis;
/// Instruction-set adapters
pub mod arch;
/// The instruction-set-independent IR
pub mod isil;
/// Runtime helper roles and their resolution
pub mod keyfunctions;

pub use analysis::{AnalysisReport, AnalysisSession, MethodAnalysis, MethodFailure};
pub use arch::{for_arch, InstructionSet};
pub use config::AnalysisConfig;
pub use core::binary::Architecture;
pub use core::control_flow_graph::ControlFlowGraph;
pub use core::image::{BinaryImage, SegmentedImage};
pub use core::method::{MethodAnalysisContext, MethodFlags, MethodId};
pub use error::{IsilError, Result};
pub use isil::{InstructionSetIndependentNode, IsilNode, IsilOpcode, IsilOperand};
pub use keyfunctions::{
    KeyFunctionAddress, KeyFunctionAddresses, KeyFunctionRegistry, KeyFunctionResolver,
    KeyFunctionRole, SymbolTableResolver,
};
