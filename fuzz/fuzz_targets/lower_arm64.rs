#![no_main]
use libfuzzer_sys::fuzz_target;

use std::sync::Arc;

use isil::{
    AnalysisConfig, AnalysisSession, Architecture, MethodAnalysisContext, MethodId,
    SegmentedImage,
};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let image = SegmentedImage::new(Architecture::ARM64).with_code(0x1000, data.to_vec());
    let config = AnalysisConfig {
        parallel: false,
        ..AnalysisConfig::default()
    };
    let Ok(session) = AnalysisSession::new(Arc::new(image), config) else {
        return;
    };
    if session.resolve_key_functions(&[]).is_err() {
        return;
    }
    let ctx =
        MethodAnalysisContext::new(MethodId(0), "fuzz", 0x1000).with_body_size(data.len() as u64);
    let _ = session.analyze_method(&ctx);
});
