//! Batch analysis: ordering, failure isolation and serialization.

mod common;

use std::sync::Arc;

use isil::{
    AnalysisConfig, AnalysisReport, AnalysisSession, Architecture, IsilError, IsilOpcode,
    MethodAnalysisContext, MethodFlags, MethodId,
};

use common::{image, method};

/// Eight tiny x86-64 methods, 16 bytes apart, plus one that loops forever.
fn code() -> Vec<u8> {
    let mut code = Vec::new();
    for i in 0..8u8 {
        // mov eax, i; ret; padding
        let mut f = vec![0xb8, i, 0x00, 0x00, 0x00, 0xc3];
        f.resize(16, 0xcc);
        code.extend(f);
    }
    // 0x1080: jmp 0x1080
    code.extend([0xeb, 0xfe]);
    code
}

fn methods() -> Vec<MethodAnalysisContext> {
    let mut methods: Vec<_> = (0..8u32)
        .map(|i| {
            method(i + 1, &format!("Get{}", i), 0x1000 + 16 * i as u64, 6)
                .with_flags(MethodFlags::HAS_RETURN_VALUE)
                .with_declaring_type("Constants")
        })
        .collect();
    methods.push(method(9, "Spin", 0x1080, 2));
    methods.push(method(10, "Elsewhere", 0x7000, 4));
    // No body size: discovered by scanning
    methods.push(MethodAnalysisContext::new(MethodId(11), "Scanned", 0x1010));
    methods
}

fn run(parallel: bool) -> AnalysisReport {
    common::init_logging();
    let config = AnalysisConfig {
        parallel,
        ..AnalysisConfig::default()
    };
    let session =
        AnalysisSession::new(Arc::new(image(Architecture::X86_64, code())), config).unwrap();
    session.resolve_key_functions(&[]).unwrap();
    session.analyze_methods(&methods()).unwrap()
}

#[test]
fn parallel_and_sequential_agree() {
    let sequential = run(false);
    let parallel = run(true);

    assert_eq!(sequential.analyses.len(), parallel.analyses.len());
    for (a, b) in sequential.analyses.iter().zip(&parallel.analyses) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.graph, b.graph);
        assert_eq!(a.isil, b.isil);
    }
    assert_eq!(sequential.failures, parallel.failures);
}

#[test]
fn report_preserves_input_order() {
    let report = run(true);
    let ids: Vec<u32> = report.analyses.iter().map(|a| a.id.0).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 11]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, MethodId(10));
    assert_eq!(report.failures[0].name, "Elsewhere");
}

#[test]
fn each_method_lowers_its_own_constant() {
    let report = run(true);
    for i in 0..8u32 {
        let analysis = report.get(MethodId(i + 1)).unwrap();
        assert_eq!(analysis.name, format!("Constants::Get{}", i));
        assert_eq!(analysis.isil.len(), 2);
        assert_eq!(analysis.isil[0].opcode, IsilOpcode::Move);
        assert_eq!(analysis.isil[0].operands[1].as_immediate(), Some(i as i64));
        assert_eq!(analysis.isil[1].opcode, IsilOpcode::Return);
    }
}

#[test]
fn self_loop_and_scanned_body() {
    let report = run(false);
    let spin = report.get(MethodId(9)).unwrap();
    assert!(spin.graph.has_cycles());
    assert_eq!(spin.isil.len(), 1);
    assert_eq!(spin.isil[0].opcode, IsilOpcode::Goto);
    assert_eq!(spin.isil[0].branch_target(), Some(0x1080));

    let scanned = report.get(MethodId(11)).unwrap();
    assert_eq!(scanned.graph.body.start, 0x1010);
    assert_eq!(scanned.graph.block_count(), 1);
    assert_eq!(scanned.isil.last().map(|n| n.opcode), Some(IsilOpcode::Return));
}

#[test]
fn report_round_trips_through_json() {
    let report = run(false);
    let json = report.to_json_string().unwrap();
    let back: AnalysisReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.analyses.len(), report.analyses.len());
    assert_eq!(back.failures, report.failures);
    assert_eq!(back.analyses[0].isil, report.analyses[0].isil);
}

#[test]
fn invalid_configuration_rejected_at_session_creation() {
    let mut config = AnalysisConfig::default();
    config.cfg.max_instructions = 0;
    let result = AnalysisSession::new(Arc::new(image(Architecture::X86_64, code())), config);
    assert!(matches!(result, Err(IsilError::InvalidConfig(_))));
}

#[test]
fn undecodable_bytes_degrade_sized_and_scanned_methods() {
    common::init_logging();
    let x86 = vec![0x90, 0x90, 0x06, 0xc3];
    let arm64 = common::words(&[0xd503_201f, 0xd280_0020, 0x0200_0000, 0xd65f_03c0]);

    for (arch, code, valid_end) in [
        (Architecture::X86_64, x86, 0x1002),
        (Architecture::ARM64, arm64, 0x1008),
    ] {
        let size = code.len() as u64;
        let session =
            AnalysisSession::new(Arc::new(image(arch, code)), AnalysisConfig::default()).unwrap();
        session.resolve_key_functions(&[]).unwrap();

        let sized = method(1, "Sized", 0x1000, size);
        let scanned = MethodAnalysisContext::new(MethodId(2), "Scanned", 0x1000);
        for ctx in [sized, scanned] {
            let analysis = session.analyze_method(&ctx).unwrap();
            assert!(analysis.degraded, "{} on {}", ctx.name, arch);
            assert_eq!(analysis.graph.truncated_blocks(), vec![0x1000]);
            assert_eq!(analysis.graph.entry_block().unwrap().end, valid_end);
        }
    }
}
