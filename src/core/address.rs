//! Address and address range types.
//!
//! Analysis works on flat virtual addresses. `AddressRange` is the half-open
//! interval used for method bodies, basic blocks and mapped regions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A virtual address in the loaded image.
pub type VirtualAddress = u64;

/// A half-open contiguous address interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressRange {
    /// First address in the range (inclusive)
    pub start: VirtualAddress,
    /// One past the last address in the range (exclusive)
    pub end: VirtualAddress,
}

impl AddressRange {
    /// Create a range from explicit bounds. `end` is clamped to `start` when smaller.
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Create a range from a start address and a length in bytes.
    pub fn with_len(start: VirtualAddress, len: u64) -> Self {
        Self::new(start, start.saturating_add(len))
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Check whether `addr` lies inside the range.
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check whether `[addr, addr + len)` lies entirely inside the range.
    pub fn contains_span(&self, addr: VirtualAddress, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end,
            None => false,
        }
    }

    /// Check whether two ranges share at least one address.
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Offset of `addr` from the start of the range, if inside.
    pub fn offset_of(&self, addr: VirtualAddress) -> Option<usize> {
        if self.contains(addr) {
            usize::try_from(addr - self.start).ok()
        } else {
            None
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}
