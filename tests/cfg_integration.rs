//! CFG construction driven through the decoder registry, independent of
//! any instruction-set adapter.

mod common;

use isil::analysis::build_cfg;
use isil::config::CfgConfig;
use isil::core::basic_block::Terminator;
use isil::core::control_flow_graph::{ControlFlowEdgeKind, ControlFlowGraph};
use isil::disasm::registry::for_arch;
use isil::keyfunctions::KeyFunctionRole;
use isil::Architecture;

use common::{registry, words, CODE_BASE};

fn build(arch: Architecture, code: &[u8], config: &CfgConfig) -> ControlFlowGraph {
    common::init_logging();
    let decoder = for_arch(arch).unwrap();
    let key_functions = registry(arch, &[(KeyFunctionRole::ExceptionThrower, 0x4000)]);
    build_cfg(&decoder, CODE_BASE, code, config, &key_functions)
}

// 0x1000: xor eax, eax
// 0x1002: inc eax
// 0x1004: cmp eax, 10
// 0x1007: jne 0x1002
// 0x1009: ret
const COUNTING_LOOP: [u8; 10] = [0x31, 0xc0, 0xff, 0xc0, 0x83, 0xf8, 0x0a, 0x75, 0xf9, 0xc3];

#[test]
fn loop_header_becomes_its_own_block() {
    let g = build(Architecture::X86_64, &COUNTING_LOOP, &CfgConfig::default());
    assert!(g.validate().is_ok());
    assert_eq!(g.block_starts(), vec![0x1000, 0x1002, 0x1009]);
    assert!(g.has_cycles());
    assert_eq!(g.predecessors(0x1002), vec![0x1000, 0x1002]);
    assert_eq!(g.cyclomatic_complexity(), 2);

    let header = g.block(0x1002).unwrap();
    assert_eq!(header.instruction_count(), 3);
    assert_eq!(header.terminator, Terminator::ConditionalBranch);
}

#[test]
fn blocks_partition_decoded_instructions() {
    let g = build(Architecture::X86_64, &COUNTING_LOOP, &CfgConfig::default());
    let mut addresses: Vec<u64> = g
        .blocks()
        .flat_map(|b| b.instructions.iter().map(|i| i.address))
        .collect();
    let total = addresses.len();
    addresses.sort_unstable();
    addresses.dedup();
    assert_eq!(addresses.len(), total);
    assert_eq!(total, g.instruction_count());
    for block in g.blocks() {
        assert!(block.start < block.end);
        assert!(g.body.contains(block.start));
    }
}

#[test]
fn construction_is_deterministic() {
    let config = CfgConfig::default();
    let a = build(Architecture::X86_64, &COUNTING_LOOP, &config);
    let b = build(Architecture::X86_64, &COUNTING_LOOP, &config);
    assert_eq!(a, b);
}

#[test]
fn block_budget_degrades_instead_of_failing() {
    let config = CfgConfig {
        max_blocks: 2,
        ..CfgConfig::default()
    };
    let g = build(Architecture::X86_64, &COUNTING_LOOP, &config);
    assert!(g.incomplete);
    assert!(g.is_degraded());
    assert!(g.block_count() <= 2);
    assert!(g.validate().is_ok());
}

#[test]
fn trap_closes_block() {
    // nop; ud2; ret
    let g = build(Architecture::X86_64, &[0x90, 0x0f, 0x0b, 0xc3], &CfgConfig::default());
    assert_eq!(g.block_count(), 1);
    let entry = g.entry_block().unwrap();
    assert_eq!(entry.instruction_count(), 2);
    assert_eq!(entry.terminator, Terminator::Trap);
    assert!(entry.successors.is_empty());
    assert!(!g.is_degraded());
}

#[test]
fn truncated_instruction_degrades_graph() {
    // nop; first two bytes of a five-byte call
    let g = build(Architecture::X86_64, &[0x90, 0xe8, 0x00], &CfgConfig::default());
    assert!(g.is_degraded());
    assert_eq!(g.truncated_blocks(), vec![0x1000]);
}

#[test]
fn invalid_opcode_truncates_after_last_valid_instruction() {
    // nop; nop; (invalid in 64-bit mode); ret
    let g = build(Architecture::X86_64, &[0x90, 0x90, 0x06, 0xc3], &CfgConfig::default());
    assert!(g.is_degraded());
    assert_eq!(g.truncated_blocks(), vec![0x1000]);
    let entry = g.entry_block().unwrap();
    assert_eq!(entry.terminator, Terminator::DecodeFailure);
    assert_eq!(entry.instruction_count(), 2);
    assert_eq!(entry.end, 0x1002);
    assert!(g.validate().is_ok());
}

#[test]
fn arm64_unallocated_word_truncates_block() {
    let code = words(&[
        0xd503_201f, // 0x1000: nop
        0xd280_0020, // 0x1004: mov x0, #1
        0x0200_0000, // 0x1008: unallocated
        0xd65f_03c0, // 0x100c: ret
    ]);
    let g = build(Architecture::ARM64, &code, &CfgConfig::default());
    assert_eq!(g.truncated_blocks(), vec![0x1000]);
    let entry = g.entry_block().unwrap();
    assert_eq!(entry.terminator, Terminator::DecodeFailure);
    assert_eq!(entry.end, 0x1008);
}

#[test]
fn no_return_call_closes_block_without_successors() {
    // call 0x4000; nop; ret
    let code = [0xe8, 0xfb, 0x2f, 0x00, 0x00, 0x90, 0xc3];
    let g = build(Architecture::X86_64, &code, &CfgConfig::default());
    assert_eq!(g.block_count(), 1);
    let entry = g.entry_block().unwrap();
    assert_eq!(entry.terminator, Terminator::NoReturnCall);
    assert!(entry.successors.is_empty());
    assert_eq!(entry.calls[0].role, Some(KeyFunctionRole::ExceptionThrower));

    let relaxed = CfgConfig {
        stop_at_no_return_calls: false,
        ..CfgConfig::default()
    };
    let g = build(Architecture::X86_64, &code, &relaxed);
    assert_eq!(g.entry_block().unwrap().terminator, Terminator::Return);
}

#[test]
fn arm64_compare_and_branch_splits() {
    let code = words(&[
        0xb400_0060, // 0x1000: cbz x0, 0x100c
        0xd280_0020, // 0x1004: mov x0, #1
        0xd65f_03c0, // 0x1008: ret
        0xd280_0040, // 0x100c: mov x0, #2
        0xd65f_03c0, // 0x1010: ret
    ]);
    let g = build(Architecture::ARM64, &code, &CfgConfig::default());
    assert!(g.validate().is_ok());
    assert_eq!(g.block_starts(), vec![0x1000, 0x1004, 0x100c]);
    assert_eq!(g.exit_blocks(), vec![0x1004, 0x100c]);

    let entry = g.entry_block().unwrap();
    let kinds: Vec<_> = entry.successors.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&ControlFlowEdgeKind::ConditionalBranch));
    assert!(kinds.contains(&ControlFlowEdgeKind::Fallthrough));
}

#[test]
fn statistics_summarize_the_graph() {
    let g = build(Architecture::X86_64, &COUNTING_LOOP, &CfgConfig::default());
    let stats = g.statistics();
    assert_eq!(stats.block_count, 3);
    assert_eq!(stats.exit_blocks, 1);
    assert!(stats.has_cycles);
    assert_eq!(stats.unknown_edges, 0);
}
