//! Key function resolution strategies.
//!
//! A resolver fills an unresolved [`KeyFunctionAddresses`] before it is
//! published. Strategies are pluggable; their failures are reported to the
//! session rather than matched on, so they return `anyhow::Result`.

use anyhow::Context;
use tracing::{debug, info};

use crate::arch::InstructionSet;
use crate::core::address::VirtualAddress;
use crate::core::basic_block::Terminator;
use crate::core::control_flow_graph::CallTarget;
use crate::core::image::{BinaryImage, ImageSymbol};
use crate::core::method::{MethodAnalysisContext, MethodId};
use crate::keyfunctions::addresses::KeyFunctionAddresses;
use crate::keyfunctions::role::KeyFunctionRole;

/// A heuristic that locates runtime helpers in one binary.
pub trait KeyFunctionResolver: Send + Sync {
    fn name(&self) -> &str;

    /// Record every helper address found. Must not mark the catalogue resolved.
    fn resolve(
        &self,
        image: &dyn BinaryImage,
        isa: &dyn InstructionSet,
        addresses: &mut KeyFunctionAddresses,
    ) -> anyhow::Result<()>;
}

/// Resolves roles from exported runtime API names.
///
/// Exports are frequently small thunks that jump straight to the real
/// implementation. Such thunks are followed one level: the role is bound
/// to the jump target and the export address is kept as an alias, so calls
/// through either address are tagged.
#[derive(Debug, Clone)]
pub struct SymbolTableResolver {
    follow_thunks: bool,
}

impl Default for SymbolTableResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTableResolver {
    pub fn new() -> Self {
        Self {
            follow_thunks: true,
        }
    }

    pub fn without_thunk_following() -> Self {
        Self {
            follow_thunks: false,
        }
    }

    /// First symbol matching one of the role's export names, in preference order.
    fn find_export(symbols: &[ImageSymbol], role: KeyFunctionRole) -> Option<&ImageSymbol> {
        role.export_names().iter().find_map(|wanted| {
            symbols
                .iter()
                .find(|s| s.name.strip_prefix('_').unwrap_or(&s.name) == *wanted)
        })
    }

    /// Target of a single-jump thunk at `ctx`, if it is one.
    fn thunk_target(
        isa: &dyn InstructionSet,
        ctx: &MethodAnalysisContext,
    ) -> Option<VirtualAddress> {
        let graph = isa.build_cfg(ctx).ok()?;
        let entry = graph.entry_block()?;
        if graph.block_count() != 1
            || entry.instruction_count() != 1
            || entry.terminator != Terminator::TailCall
        {
            return None;
        }
        entry.calls.iter().find_map(|c| match c.target {
            CallTarget::Direct(t) if c.tail_call => Some(t),
            _ => None,
        })
    }
}

impl KeyFunctionResolver for SymbolTableResolver {
    fn name(&self) -> &str {
        "symbol-table"
    }

    fn resolve(
        &self,
        image: &dyn BinaryImage,
        isa: &dyn InstructionSet,
        addresses: &mut KeyFunctionAddresses,
    ) -> anyhow::Result<()> {
        let symbols = image.symbols();
        let mut found = 0usize;

        for (index, role) in KeyFunctionRole::ALL.into_iter().enumerate() {
            let Some(symbol) = Self::find_export(&symbols, role) else {
                continue;
            };
            let ctx = MethodAnalysisContext::new(
                MethodId(index as u32),
                symbol.name.clone(),
                symbol.address,
            );
            let export = isa.pointer_for_method(&ctx);
            if !image.is_executable(export) {
                debug!(%role, symbol = %symbol.name, "Export is not in executable memory");
                continue;
            }

            let thunk = if self.follow_thunks {
                Self::thunk_target(isa, &ctx).filter(|t| image.is_executable(*t))
            } else {
                None
            };
            match thunk {
                Some(target) => {
                    addresses
                        .set(role, target)
                        .with_context(|| format!("recording {} at {:#x}", role, target))?;
                    addresses
                        .add_alias(export, role)
                        .with_context(|| format!("aliasing {} thunk at {:#x}", role, export))?;
                    debug!(
                        %role,
                        thunk = format_args!("{:#x}", export),
                        target = format_args!("{:#x}", target),
                        "Followed key function thunk"
                    );
                }
                None => {
                    addresses
                        .set(role, export)
                        .with_context(|| format!("recording {} at {:#x}", role, export))?;
                }
            }
            found += 1;
        }

        info!(
            resolver = self.name(),
            found,
            roles = KeyFunctionRole::ALL.len(),
            "Resolved key functions from exports"
        );
        Ok(())
    }
}
