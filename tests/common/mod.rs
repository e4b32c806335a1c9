//! Shared helpers for the integration tests: in-memory images and
//! pre-resolved key function registries.

#![allow(dead_code)]

use std::sync::Arc;

use isil::core::image::{RegionPerms, SegmentedImage};
use isil::keyfunctions::{KeyFunctionAddresses, KeyFunctionRegistry, KeyFunctionRole};
use isil::{Architecture, MethodAnalysisContext, MethodId};

pub const CODE_BASE: u64 = 0x1000;
pub const HELPER_BASE: u64 = 0x4000;

/// Install the test subscriber once; honours `RUST_LOG`.
pub fn init_logging() {
    isil::logging::init_tracing();
}

/// An image with `code` mapped executable at `CODE_BASE`.
pub fn image(arch: Architecture, code: Vec<u8>) -> SegmentedImage {
    SegmentedImage::new(arch).with_code(CODE_BASE, code)
}

/// Like [`image`], plus a block of x86 `ret`s standing in for runtime helpers.
pub fn image_with_helpers(arch: Architecture, code: Vec<u8>) -> SegmentedImage {
    let mut img = image(arch, code);
    img.add_region(
        ".text.runtime",
        HELPER_BASE,
        RegionPerms::READ | RegionPerms::EXECUTE,
        vec![0xc3; 0x100],
    );
    img
}

/// A published registry with the given roles.
pub fn registry(arch: Architecture, roles: &[(KeyFunctionRole, u64)]) -> Arc<KeyFunctionRegistry> {
    let mut addresses = KeyFunctionAddresses::new(arch);
    for (role, address) in roles {
        addresses.set(*role, *address).expect("unresolved catalogue accepts writes");
    }
    addresses.mark_resolved();
    let registry = Arc::new(KeyFunctionRegistry::new());
    registry.publish(addresses).expect("first publish succeeds");
    registry
}

pub fn method(id: u32, name: &str, pointer: u64, size: u64) -> MethodAnalysisContext {
    MethodAnalysisContext::new(MethodId(id), name, pointer).with_body_size(size)
}

/// Little-endian encoding of fixed-width ARM instruction words.
pub fn words(ws: &[u32]) -> Vec<u8> {
    ws.iter().flat_map(|w| w.to_le_bytes()).collect()
}
