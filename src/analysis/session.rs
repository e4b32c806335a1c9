//! Whole-binary analysis driver.
//!
//! One session per loaded binary. The session selects the instruction set
//! once, owns the key function barrier, and runs CFG construction plus
//! lowering per method. Per-method failures are collected in the report;
//! barrier violations abort the run.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::arch::{self, InstructionSet};
use crate::config::AnalysisConfig;
use crate::core::address::VirtualAddress;
use crate::core::control_flow_graph::ControlFlowGraph;
use crate::core::image::BinaryImage;
use crate::core::method::{MethodAnalysisContext, MethodId};
use crate::error::{IsilError, Result};
use crate::isil::IsilNode;
use crate::keyfunctions::{KeyFunctionAddresses, KeyFunctionRegistry, KeyFunctionResolver};

/// CFG and ISIL of one method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodAnalysis {
    pub id: MethodId,
    pub name: String,
    /// Canonical start address used for decoding
    pub pointer: VirtualAddress,
    pub graph: ControlFlowGraph,
    pub isil: Vec<IsilNode>,
    /// The graph has truncated blocks or hit a budget
    pub degraded: bool,
}

/// A method skipped because of a recoverable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodFailure {
    pub id: MethodId,
    pub name: String,
    pub error: String,
}

/// Outcome of analysing a batch of methods, in input order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub analyses: Vec<MethodAnalysis>,
    pub failures: Vec<MethodFailure>,
}

impl AnalysisReport {
    pub fn degraded_count(&self) -> usize {
        self.analyses.iter().filter(|a| a.degraded).count()
    }

    pub fn get(&self, id: MethodId) -> Option<&MethodAnalysis> {
        self.analyses.iter().find(|a| a.id == id)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct AnalysisSession {
    image: Arc<dyn BinaryImage>,
    isa: Box<dyn InstructionSet>,
    key_functions: Arc<KeyFunctionRegistry>,
    config: AnalysisConfig,
}

impl AnalysisSession {
    /// Select the instruction set for `image`. Fails for architectures
    /// without an adapter and for invalid configuration.
    pub fn new(image: Arc<dyn BinaryImage>, config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        let arch = image.architecture();
        let key_functions = Arc::new(KeyFunctionRegistry::new());
        let isa = arch::for_arch(arch, image.clone(), key_functions.clone(), config.clone())?;
        info!(%arch, parallel = config.parallel, "Created analysis session");
        Ok(Self {
            image,
            isa,
            key_functions,
            config,
        })
    }

    pub fn instruction_set(&self) -> &dyn InstructionSet {
        self.isa.as_ref()
    }

    pub fn key_functions(&self) -> &KeyFunctionRegistry {
        &self.key_functions
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run `resolvers` in order on a fresh catalogue, close it and publish
    /// it. A failing resolver is logged and skipped; whatever the others
    /// found is still published. Resolution happens once per session.
    pub fn resolve_key_functions(
        &self,
        resolvers: &[&dyn KeyFunctionResolver],
    ) -> Result<&KeyFunctionAddresses> {
        if self.key_functions.is_published() {
            return Err(IsilError::RegistryAlreadyResolved);
        }
        let mut addresses = self.isa.create_key_function_addresses();
        for resolver in resolvers {
            let outcome = resolver.resolve(self.image.as_ref(), self.isa.as_ref(), &mut addresses);
            if let Err(e) = outcome {
                warn!(
                    resolver = resolver.name(),
                    error = %format!("{:#}", e),
                    "Key function resolver failed"
                );
            }
        }
        addresses.mark_resolved();
        info!(known = addresses.known_count(), "Publishing key function addresses");
        self.key_functions.publish(addresses)?;
        self.key_functions.get()
    }

    /// Build the CFG of one method and lower it.
    pub fn analyze_method(&self, ctx: &MethodAnalysisContext) -> Result<MethodAnalysis> {
        self.key_functions.get()?;
        let graph = self.isa.build_cfg(ctx)?;
        let isil = self.isa.cfg_to_isil(&graph, ctx)?;
        Ok(MethodAnalysis {
            id: ctx.id,
            name: ctx.full_name(),
            pointer: self.isa.pointer_for_method(ctx),
            degraded: graph.is_degraded(),
            graph,
            isil,
        })
    }

    /// Analyse every method. Recoverable failures are recorded per method;
    /// an unpublished key function registry fails the whole call before
    /// any method is touched.
    pub fn analyze_methods(&self, methods: &[MethodAnalysisContext]) -> Result<AnalysisReport> {
        if let Err(e) = self.key_functions.get() {
            return Err(crate::log_error!(e, "key functions must be resolved before analysis"));
        }

        let results: Vec<Result<MethodAnalysis>> = if self.config.parallel {
            methods.par_iter().map(|ctx| self.analyze_method(ctx)).collect()
        } else {
            methods.iter().map(|ctx| self.analyze_method(ctx)).collect()
        };

        let mut report = AnalysisReport::default();
        for (ctx, result) in methods.iter().zip(results) {
            match result {
                Ok(analysis) => report.analyses.push(analysis),
                Err(e) if e.is_fatal() => return Err(crate::log_error!(e)),
                Err(e) => {
                    warn!(method = %ctx, error = %e, "Skipping method");
                    report.failures.push(MethodFailure {
                        id: ctx.id,
                        name: ctx.full_name(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            analyzed = report.analyses.len(),
            failed = report.failures.len(),
            degraded = report.degraded_count(),
            "Analysis complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::binary::Architecture;
    use crate::core::image::SegmentedImage;
    use crate::keyfunctions::SymbolTableResolver;

    fn session(parallel: bool) -> AnalysisSession {
        // 0x1000: xor eax, eax; ret   0x1003: jmp rax
        let code = vec![0x31, 0xc0, 0xc3, 0xff, 0xe0];
        let image = SegmentedImage::new(Architecture::X86_64).with_code(0x1000, code);
        let config = AnalysisConfig {
            parallel,
            ..AnalysisConfig::default()
        };
        AnalysisSession::new(Arc::new(image), config).unwrap()
    }

    fn methods() -> Vec<MethodAnalysisContext> {
        vec![
            MethodAnalysisContext::new(MethodId(1), "Zero", 0x1000).with_body_size(3),
            MethodAnalysisContext::new(MethodId(2), "Unmapped", 0x9000).with_body_size(4),
            MethodAnalysisContext::new(MethodId(3), "Dispatch", 0x1003).with_body_size(2),
        ]
    }

    #[test]
    fn test_unsupported_architecture() {
        let image = SegmentedImage::new(Architecture::Wasm);
        let err = AnalysisSession::new(Arc::new(image), AnalysisConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, IsilError::UnsupportedArchitecture(_)));
    }

    #[test]
    fn test_analysis_requires_resolution() {
        let s = session(false);
        let err = s.analyze_methods(&methods()).unwrap_err();
        assert!(matches!(err, IsilError::RegistryNotResolved));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_resolution_happens_once() {
        let s = session(false);
        s.resolve_key_functions(&[&SymbolTableResolver::new()]).unwrap();
        assert!(s.key_functions().is_published());
        assert!(matches!(
            s.resolve_key_functions(&[]),
            Err(IsilError::RegistryAlreadyResolved)
        ));
    }

    #[test]
    fn test_failures_are_isolated() {
        for parallel in [false, true] {
            let s = session(parallel);
            s.resolve_key_functions(&[]).unwrap();
            let report = s.analyze_methods(&methods()).unwrap();
            assert_eq!(report.analyses.len(), 2);
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].id, MethodId(2));
            assert!(report.failures[0].error.contains("0x9000"));

            let dispatch = report.get(MethodId(3)).unwrap();
            assert_eq!(dispatch.graph.unknown_edge_count(), 1);
            assert_eq!(report.analyses[0].id, MethodId(1));
        }
    }

    #[test]
    fn test_report_serializes() {
        let s = session(false);
        s.resolve_key_functions(&[]).unwrap();
        let report = s.analyze_methods(&methods()[..1]).unwrap();
        let json = report.to_json_string().unwrap();
        assert!(json.contains("\"Zero\""));
        assert_eq!(report.degraded_count(), 0);
    }
}
