#![no_main]
use libfuzzer_sys::fuzz_target;

use isil::analysis::build_cfg;
use isil::config::CfgConfig;
use isil::disasm::iced::IcedDisassembler;
use isil::{Architecture, KeyFunctionRegistry};

fuzz_target!(|data: &[u8]| {
    let decoder = IcedDisassembler::new(Architecture::X86_64);
    let cfg = CfgConfig {
        max_blocks: 256,
        max_instructions: 4096,
        ..CfgConfig::default()
    };
    let graph = build_cfg(&decoder, 0x1000, data, &cfg, &KeyFunctionRegistry::new());
    assert!(graph.validate().is_ok());
});
