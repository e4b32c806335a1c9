//! A method goes from raw bytes to a tagged ISIL sequence through the
//! public adapter API.

mod common;

use std::sync::Arc;

use isil::core::basic_block::Terminator;
use isil::core::control_flow_graph::{CallTarget, ControlFlowEdgeKind, EdgeTarget};
use isil::isil::IsilCondition;
use isil::{
    for_arch, AnalysisConfig, Architecture, IsilError, IsilOpcode, IsilOperand, KeyFunctionRole,
    MethodFlags,
};

use common::{image_with_helpers, method, registry, CODE_BASE, HELPER_BASE};

/// cmp al, 0; je 0x1009; call 0x4000; ret
const ALLOCATING_METHOD: [u8; 10] = [
    0x3c, 0x00, // 0x1000
    0x74, 0x05, // 0x1002
    0xe8, 0xf7, 0x2f, 0x00, 0x00, // 0x1004
    0xc3, // 0x1009
];

fn adapter(roles: &[(KeyFunctionRole, u64)]) -> Box<dyn isil::InstructionSet> {
    common::init_logging();
    let image = image_with_helpers(Architecture::X86_64, ALLOCATING_METHOD.to_vec());
    for_arch(
        Architecture::X86_64,
        Arc::new(image),
        registry(Architecture::X86_64, roles),
        AnalysisConfig::default(),
    )
    .unwrap()
}

#[test]
fn cfg_splits_at_branch_targets() {
    let isa = adapter(&[(KeyFunctionRole::ObjectAllocator, HELPER_BASE)]);
    let ctx = method(1, "Allocate", CODE_BASE, ALLOCATING_METHOD.len() as u64);
    let graph = isa.build_cfg(&ctx).unwrap();

    assert!(graph.validate().is_ok());
    assert_eq!(graph.block_starts(), vec![0x1000, 0x1004, 0x1009]);

    let entry = graph.block(0x1000).unwrap();
    assert_eq!(entry.end, 0x1004);
    assert_eq!(entry.terminator, Terminator::ConditionalBranch);
    let kinds: Vec<_> = entry.successors.iter().map(|e| (e.kind, e.target)).collect();
    assert!(kinds.contains(&(ControlFlowEdgeKind::ConditionalBranch, EdgeTarget::Block(0x1009))));
    assert!(kinds.contains(&(ControlFlowEdgeKind::Fallthrough, EdgeTarget::Block(0x1004))));

    let call_block = graph.block(0x1004).unwrap();
    assert_eq!(call_block.calls.len(), 1);
    assert_eq!(call_block.calls[0].target, CallTarget::Direct(HELPER_BASE));
    assert_eq!(call_block.calls[0].role, Some(KeyFunctionRole::ObjectAllocator));

    let exit = graph.block(0x1009).unwrap();
    assert_eq!(exit.end, 0x100a);
    assert_eq!(exit.terminator, Terminator::Return);
    assert_eq!(graph.exit_blocks().len(), 1);
}

#[test]
fn isil_is_address_stamped_and_tagged() {
    let isa = adapter(&[(KeyFunctionRole::ObjectAllocator, HELPER_BASE)]);
    let ctx = method(1, "Allocate", CODE_BASE, ALLOCATING_METHOD.len() as u64);
    let graph = isa.build_cfg(&ctx).unwrap();
    let nodes = isa.cfg_to_isil(&graph, &ctx).unwrap();

    let summary: Vec<_> = nodes.iter().map(|n| (n.address, n.opcode)).collect();
    assert_eq!(
        summary,
        vec![
            (0x1000, IsilOpcode::Compare),
            (0x1002, IsilOpcode::JumpIf(IsilCondition::Equal)),
            (0x1004, IsilOpcode::Call),
            (0x1009, IsilOpcode::Return),
        ]
    );
    assert_eq!(
        nodes[0].operands,
        vec![IsilOperand::reg("rax"), IsilOperand::imm(0)]
    );
    assert_eq!(nodes[1].branch_target(), Some(0x1009));
    assert_eq!(nodes[2].key_function, Some(KeyFunctionRole::ObjectAllocator));
    assert!(nodes[3].operands.is_empty());
}

#[test]
fn lowering_is_repeatable() {
    let isa = adapter(&[(KeyFunctionRole::ObjectAllocator, HELPER_BASE)]);
    let ctx = method(1, "Allocate", CODE_BASE, ALLOCATING_METHOD.len() as u64)
        .with_flags(MethodFlags::HAS_RETURN_VALUE);
    let graph = isa.build_cfg(&ctx).unwrap();
    let first = isa.cfg_to_isil(&graph, &ctx).unwrap();
    let second = isa.cfg_to_isil(&graph, &ctx).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.last().map(|n| n.operands.clone()),
        Some(vec![IsilOperand::reg("rax")])
    );
}

#[test]
fn untagged_when_role_unknown() {
    let isa = adapter(&[]);
    let ctx = method(1, "Allocate", CODE_BASE, ALLOCATING_METHOD.len() as u64);
    let graph = isa.build_cfg(&ctx).unwrap();
    let nodes = isa.cfg_to_isil(&graph, &ctx).unwrap();
    assert_eq!(nodes[2].opcode, IsilOpcode::Call);
    assert_eq!(nodes[2].key_function, None);
}

#[test]
fn no_return_helper_lowers_to_call_no_return() {
    let isa = adapter(&[(KeyFunctionRole::ExceptionThrower, HELPER_BASE)]);
    let ctx = method(1, "Throw", CODE_BASE, ALLOCATING_METHOD.len() as u64);
    let graph = isa.build_cfg(&ctx).unwrap();
    let call_block = graph.block(0x1004).unwrap();
    assert_eq!(call_block.terminator, Terminator::NoReturnCall);
    assert!(call_block.successors.is_empty());

    let nodes = isa.cfg_to_isil(&graph, &ctx).unwrap();
    assert!(nodes.iter().any(|n| n.opcode == IsilOpcode::CallNoReturn));
}

#[test]
fn missing_body_is_reported() {
    let isa = adapter(&[]);
    let ctx = method(9, "Ghost", 0xdead_0000, 16);
    match isa.build_cfg(&ctx) {
        Err(IsilError::BodyNotFound { pointer, .. }) => assert_eq!(pointer, 0xdead_0000),
        other => panic!("expected BodyNotFound, got {:?}", other.map(|g| g.block_count())),
    }
}
