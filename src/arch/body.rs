//! Method body extraction shared by all instruction sets.
//!
//! Ordinary methods with a loader-supplied size are read verbatim. Methods
//! without a size, and attribute generators (whose recorded size covers
//! trailing metadata thunks), are measured with a linear sweep that stops at
//! the first return or unconditional exit not jumped over by an earlier
//! forward branch. A sweep that hits undecodable bytes keeps the first
//! undecodable unit, so the failure surfaces as a truncated block.

use crate::config::ExtractionConfig;
use crate::core::address::VirtualAddress;
use crate::core::disassembler::Disassembler;
use crate::core::image::BinaryImage;
use crate::core::instruction::FlowControl;
use crate::error::{IsilError, Result};

/// Extract the body bytes at `pointer`.
pub fn extract_body<D: Disassembler + ?Sized>(
    image: &dyn BinaryImage,
    decoder: &D,
    pointer: VirtualAddress,
    body_size: Option<u64>,
    is_attribute_generator: bool,
    limits: &ExtractionConfig,
) -> Result<Vec<u8>> {
    let region = image
        .region_containing(pointer)
        .ok_or_else(|| IsilError::body_not_found(pointer, "address is not mapped"))?;
    if !region.is_executable() {
        return Err(IsilError::body_not_found(
            pointer,
            "address is not in executable memory",
        ));
    }
    let tail = region
        .tail(pointer)
        .ok_or_else(|| IsilError::body_not_found(pointer, "address is not mapped"))?;

    match body_size {
        Some(size) if !is_attribute_generator => {
            let size = usize::try_from(size).unwrap_or(usize::MAX);
            if size == 0 {
                return Err(IsilError::body_not_found(pointer, "method body is empty"));
            }
            if size > limits.max_body_size {
                return Err(IsilError::body_not_found(
                    pointer,
                    format!(
                        "body size {} exceeds the {} byte limit",
                        size, limits.max_body_size
                    ),
                ));
            }
            let bytes = tail.get(..size).ok_or_else(|| {
                IsilError::body_not_found(pointer, "body runs past the end of its region")
            })?;
            Ok(bytes.to_vec())
        }
        _ => {
            let window = &tail[..tail.len().min(limits.scan_limit)];
            let len = scan_body_len(decoder, pointer, window);
            if len == 0 {
                return Err(IsilError::body_not_found(
                    pointer,
                    "no decodable instructions at method start",
                ));
            }
            tracing::debug!(
                pointer = format_args!("{:#x}", pointer),
                len,
                attribute_generator = is_attribute_generator,
                "Measured method body by linear sweep"
            );
            Ok(window[..len].to_vec())
        }
    }
}

/// Length of the function starting at `start` within `window`.
pub fn scan_body_len<D: Disassembler + ?Sized>(
    decoder: &D,
    start: VirtualAddress,
    window: &[u8],
) -> usize {
    let window_end = start.saturating_add(window.len() as u64);
    let mut offset = 0usize;
    // Furthest in-window address some forward branch can reach
    let mut furthest = start;

    while offset < window.len() {
        let addr = start + offset as u64;
        let insn = match decoder.disassemble_instruction(addr, &window[offset..]) {
            Ok(insn) if insn.length > 0 && offset + insn.length as usize <= window.len() => insn,
            _ if offset == 0 => break,
            _ => {
                // The undecodable unit stays in the body so the CFG builder
                // truncates the block there instead of running off the end
                let unit = usize::try_from(decoder.instruction_alignment()).unwrap_or(1);
                offset = (offset + unit.max(1)).min(window.len());
                break;
            }
        };
        offset += insn.length as usize;
        let end = insn.end_address();

        if let Some(target) = insn.branch_target {
            let branch = matches!(insn.flow, FlowControl::Branch | FlowControl::ConditionalBranch);
            if branch && target > addr && target < window_end {
                furthest = furthest.max(target);
            }
        }

        let exits = matches!(
            insn.flow,
            FlowControl::Return
                | FlowControl::Branch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
        );
        if exits && end > furthest {
            break;
        }
    }
    offset
}
