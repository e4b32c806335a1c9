//! Per-method analysis context.
//!
//! A `MethodAnalysisContext` is created once per discovered function while
//! the binary is loaded. Its identity and metadata never change afterwards;
//! the only mutable slot is the lazily extracted raw body, which is written
//! at most once.

use bitflags::bitflags;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::address::VirtualAddress;

/// Stable identity of a method within one loaded binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

bitflags! {
    /// Metadata flags supplied by the managed-type model.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MethodFlags: u8 {
        /// Synthetic routine that constructs custom attributes
        const ATTRIBUTE_GENERATOR = 0b001;
        /// The method's signature has a non-void return type
        const HAS_RETURN_VALUE = 0b010;
        /// The method has no `this` parameter
        const STATIC = 0b100;
    }
}

/// Identifies one function under analysis.
#[derive(Debug)]
pub struct MethodAnalysisContext {
    pub id: MethodId,
    pub name: String,
    pub declaring_type: Option<String>,
    /// Pointer recorded by the metadata model (may carry architecture tag bits)
    pub underlying_pointer: VirtualAddress,
    /// Body length in bytes, when the loader knows where the next function starts
    pub body_size: Option<u64>,
    pub flags: MethodFlags,
    raw_body: OnceCell<Arc<[u8]>>,
}

impl MethodAnalysisContext {
    pub fn new(id: MethodId, name: impl Into<String>, underlying_pointer: VirtualAddress) -> Self {
        Self {
            id,
            name: name.into(),
            declaring_type: None,
            underlying_pointer,
            body_size: None,
            flags: MethodFlags::empty(),
            raw_body: OnceCell::new(),
        }
    }

    pub fn with_body_size(mut self, size: u64) -> Self {
        self.body_size = Some(size);
        self
    }

    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_declaring_type(mut self, declaring_type: impl Into<String>) -> Self {
        self.declaring_type = Some(declaring_type.into());
        self
    }

    pub fn is_attribute_generator(&self) -> bool {
        self.flags.contains(MethodFlags::ATTRIBUTE_GENERATOR)
    }

    pub fn has_return_value(&self) -> bool {
        self.flags.contains(MethodFlags::HAS_RETURN_VALUE)
    }

    /// `Type::Method` when the declaring type is known.
    pub fn full_name(&self) -> String {
        match &self.declaring_type {
            Some(t) => format!("{}::{}", t, self.name),
            None => self.name.clone(),
        }
    }

    /// The cached raw body, if it has been extracted already.
    pub fn cached_body(&self) -> Option<Arc<[u8]>> {
        self.raw_body.get().cloned()
    }

    /// Return the cached body or extract it once with `extract`.
    pub(crate) fn body_or_try_init<E>(
        &self,
        extract: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<Arc<[u8]>, E> {
        self.raw_body
            .get_or_try_init(|| extract().map(Arc::from))
            .cloned()
    }
}

impl fmt::Display for MethodAnalysisContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @ {:#x}",
            self.id,
            self.full_name(),
            self.underlying_pointer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_flags() {
        let ctx = MethodAnalysisContext::new(MethodId(7), "Update", 0x1000)
            .with_body_size(32)
            .with_declaring_type("Player")
            .with_flags(MethodFlags::HAS_RETURN_VALUE);
        assert_eq!(ctx.full_name(), "Player::Update");
        assert_eq!(ctx.body_size, Some(32));
        assert!(ctx.has_return_value());
        assert!(!ctx.is_attribute_generator());
        assert_eq!(ctx.to_string(), "m7 Player::Update @ 0x1000");
    }

    #[test]
    fn test_body_extracted_once() {
        let ctx = MethodAnalysisContext::new(MethodId(1), "f", 0x1000);
        assert!(ctx.cached_body().is_none());
        let mut calls = 0;
        let first = ctx
            .body_or_try_init::<()>(|| {
                calls += 1;
                Ok(vec![0xc3])
            })
            .unwrap();
        let second = ctx
            .body_or_try_init::<()>(|| {
                calls += 1;
                Ok(vec![0x90])
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(&*first, &[0xc3]);
        assert_eq!(&*second, &[0xc3]);
    }

    #[test]
    fn test_failed_extraction_is_not_cached() {
        let ctx = MethodAnalysisContext::new(MethodId(1), "f", 0x1000);
        assert!(ctx.body_or_try_init(|| Err("unmapped")).is_err());
        assert!(ctx.cached_body().is_none());
    }
}
