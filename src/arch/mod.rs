//! Instruction-set adapters.
//!
//! One adapter is selected per loaded binary from the detected architecture.
//! Adapters share the CFG builder, body extraction and lowering driver by
//! composition; each one supplies its decoder and its instruction lowering
//! table.

pub mod arm;
pub mod arm64;
pub mod body;
mod operands;
pub mod x86;

use std::sync::Arc;

use crate::config::AnalysisConfig;
use crate::core::address::VirtualAddress;
use crate::core::binary::Architecture;
use crate::core::control_flow_graph::ControlFlowGraph;
use crate::core::image::BinaryImage;
use crate::core::method::MethodAnalysisContext;
use crate::error::{IsilError, Result};
use crate::isil::IsilNode;
use crate::keyfunctions::{KeyFunctionAddresses, KeyFunctionRegistry};

/// The per-architecture capability contract.
pub trait InstructionSet: Send + Sync {
    fn architecture(&self) -> Architecture;

    /// Build the CFG of the method. Decode problems degrade the graph;
    /// only a missing body is an error.
    fn build_cfg(&self, ctx: &MethodAnalysisContext) -> Result<ControlFlowGraph>;

    /// Exact machine-code bytes of the method.
    fn raw_bytes_for_method(
        &self,
        ctx: &MethodAnalysisContext,
        is_attribute_generator: bool,
    ) -> Result<Vec<u8>>;

    /// Canonical start address used for decoding and address tagging.
    fn pointer_for_method(&self, ctx: &MethodAnalysisContext) -> VirtualAddress {
        ctx.underlying_pointer
    }

    /// Lower a finished CFG. Requires the key function registry to be published.
    fn cfg_to_isil(
        &self,
        graph: &ControlFlowGraph,
        ctx: &MethodAnalysisContext,
    ) -> Result<Vec<IsilNode>>;

    /// A fresh, unresolved key function catalogue for this architecture.
    fn create_key_function_addresses(&self) -> KeyFunctionAddresses {
        KeyFunctionAddresses::new(self.architecture())
    }

    /// Method body, extracted once and cached on the context.
    fn method_body(&self, ctx: &MethodAnalysisContext) -> Result<Arc<[u8]>> {
        ctx.body_or_try_init(|| self.raw_bytes_for_method(ctx, ctx.is_attribute_generator()))
    }
}

/// Select the adapter for `arch`.
pub fn for_arch(
    arch: Architecture,
    image: Arc<dyn BinaryImage>,
    key_functions: Arc<KeyFunctionRegistry>,
    config: AnalysisConfig,
) -> Result<Box<dyn InstructionSet>> {
    match arch {
        Architecture::X86 | Architecture::X86_64 => Ok(Box::new(x86::X86InstructionSet::new(
            arch,
            image,
            key_functions,
            config,
        ))),
        Architecture::ARM64 => Ok(Box::new(arm64::Arm64InstructionSet::new(
            image,
            key_functions,
            config,
        ))),
        Architecture::ARM => Ok(Box::new(arm::ArmInstructionSet::new(
            image,
            key_functions,
            config,
        ))),
        Architecture::Wasm | Architecture::Unknown => {
            Err(IsilError::UnsupportedArchitecture(arch.to_string()))
        }
    }
}
