//! ARM64 and ARM32/Thumb methods analysed through a session.

mod common;

use std::sync::Arc;

use isil::core::image::RegionPerms;
use isil::isil::IsilCondition;
use isil::keyfunctions::KeyFunctionAddress;
use isil::{
    AnalysisConfig, AnalysisSession, Architecture, IsilOpcode, IsilOperand, KeyFunctionRole,
    MethodFlags, MethodId, SegmentedImage, SymbolTableResolver,
};

use common::{method, words, CODE_BASE};

const RET_A64: u32 = 0xd65f_03c0;

fn halfwords(hs: &[u16]) -> Vec<u8> {
    hs.iter().flat_map(|h| h.to_le_bytes()).collect()
}

fn arm64_session() -> AnalysisSession {
    common::init_logging();
    let mut code = words(&[
        0xa9bf_7bfd, // 0x1000: stp x29, x30, [sp, #-0x10]!
        0x9100_03fd, // 0x1004: mov x29, sp
        0x9400_0bfe, // 0x1008: bl 0x4000
        0xa8c1_7bfd, // 0x100c: ldp x29, x30, [sp], #0x10
        RET_A64,     // 0x1010: ret
    ]);
    code.resize(0x100, 0);
    code.extend(words(&[
        0x7100_001f, // 0x1100: cmp w0, #0
        0x5400_0041, // 0x1104: b.ne 0x110c
        0x9400_0bc2, // 0x1108: bl 0x4010
        RET_A64,     // 0x110c: ret
    ]));

    let mut img = SegmentedImage::new(Architecture::ARM64).with_code(CODE_BASE, code);
    let mut helpers = words(&[RET_A64; 4]);
    helpers.extend(words(&[0x1400_01fc])); // 0x4010: b 0x4800
    img.add_region(
        ".text.runtime",
        0x4000,
        RegionPerms::READ | RegionPerms::EXECUTE,
        helpers,
    );
    img.add_region(
        ".text.impl",
        0x4800,
        RegionPerms::READ | RegionPerms::EXECUTE,
        words(&[RET_A64]),
    );
    img.add_symbol("il2cpp_object_new", 0x4000);
    img.add_symbol("il2cpp_raise_exception", 0x4010);

    let session = AnalysisSession::new(Arc::new(img), AnalysisConfig::default()).unwrap();
    session
        .resolve_key_functions(&[&SymbolTableResolver::new()])
        .unwrap();
    session
}

#[test]
fn arm64_exports_resolve() {
    let s = arm64_session();
    let kfa = s.key_functions().get().unwrap();
    assert_eq!(
        kfa.address_of(KeyFunctionRole::ObjectAllocator).unwrap(),
        KeyFunctionAddress::Known(0x4000)
    );
    assert_eq!(
        kfa.address_of(KeyFunctionRole::ExceptionThrower).unwrap(),
        KeyFunctionAddress::Known(0x4800)
    );
    assert_eq!(
        kfa.role_at(0x4010).unwrap(),
        Some(KeyFunctionRole::ExceptionThrower)
    );
}

#[test]
fn arm64_frame_and_allocation() {
    let s = arm64_session();
    let ctx = method(1, "Create", 0x1000, 20).with_flags(MethodFlags::HAS_RETURN_VALUE);
    let analysis = s.analyze_method(&ctx).unwrap();

    assert_eq!(analysis.graph.block_count(), 1);
    let opcodes: Vec<_> = analysis.isil.iter().map(|n| n.opcode).collect();
    assert_eq!(
        opcodes,
        vec![
            IsilOpcode::ShiftStack,
            IsilOpcode::Move,
            IsilOpcode::Move,
            IsilOpcode::Move,
            IsilOpcode::Call,
            IsilOpcode::Move,
            IsilOpcode::Move,
            IsilOpcode::ShiftStack,
            IsilOpcode::Return,
        ]
    );
    assert_eq!(
        analysis.isil[4].key_function,
        Some(KeyFunctionRole::ObjectAllocator)
    );
    assert_eq!(analysis.isil[8].operands, vec![IsilOperand::reg("x0")]);
    assert!(analysis.isil.iter().all(|n| n.address >= 0x1000 && n.address < 0x1014));
}

#[test]
fn arm64_guarded_throw() {
    let s = arm64_session();
    let analysis = s.analyze_method(&method(2, "Guard", 0x1100, 16)).unwrap();

    assert_eq!(analysis.graph.block_starts(), vec![0x1100, 0x1108, 0x110c]);
    let throw_block = analysis.graph.block(0x1108).unwrap();
    assert!(throw_block.successors.is_empty());

    let opcodes: Vec<_> = analysis.isil.iter().map(|n| n.opcode).collect();
    assert_eq!(
        opcodes,
        vec![
            IsilOpcode::Compare,
            IsilOpcode::JumpIf(IsilCondition::NotEqual),
            IsilOpcode::CallNoReturn,
            IsilOpcode::Return,
        ]
    );
    assert_eq!(
        analysis.isil[0].operands,
        vec![IsilOperand::reg("x0"), IsilOperand::imm(0)]
    );
    assert_eq!(analysis.isil[1].branch_target(), Some(0x110c));
}

#[test]
fn arm64_batch_report() {
    let s = arm64_session();
    let report = s
        .analyze_methods(&[
            method(1, "Create", 0x1000, 20),
            method(2, "Guard", 0x1100, 16),
            method(3, "Missing", 0x9000, 8),
        ])
        .unwrap();
    assert_eq!(report.analyses.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, MethodId(3));
    assert_eq!(report.degraded_count(), 0);
}

#[test]
fn thumb_method_through_session() {
    common::init_logging();
    let code = halfwords(&[
        0xb580, // 0x1000: push {r7, lr}
        0x2000, // 0x1002: movs r0, #0
        0xbd80, // 0x1004: pop {r7, pc}
    ]);
    let img = SegmentedImage::new(Architecture::ARM).with_code(CODE_BASE, code);
    let s = AnalysisSession::new(Arc::new(img), AnalysisConfig::default()).unwrap();
    s.resolve_key_functions(&[]).unwrap();

    let ctx = method(1, "Zero", 0x1001, 6).with_flags(MethodFlags::HAS_RETURN_VALUE);
    let analysis = s.analyze_method(&ctx).unwrap();
    assert_eq!(analysis.pointer, 0x1000);
    assert_eq!(analysis.graph.entry, 0x1000);

    let opcodes: Vec<_> = analysis.isil.iter().map(|n| n.opcode).collect();
    assert_eq!(
        opcodes,
        vec![
            IsilOpcode::Push,
            IsilOpcode::Push,
            IsilOpcode::Move,
            IsilOpcode::Pop,
            IsilOpcode::Return,
        ]
    );
    assert_eq!(
        analysis.isil[2].operands,
        vec![IsilOperand::reg("r0"), IsilOperand::imm(0)]
    );
    assert_eq!(analysis.isil[4].operands, vec![IsilOperand::reg("r0")]);
    assert_eq!(analysis.isil[4].address, 0x1004);
}
