//! One-shot publication barrier for the resolved key function addresses.

use once_cell::sync::OnceCell;

use crate::core::address::VirtualAddress;
use crate::error::{IsilError, Result};
use crate::keyfunctions::addresses::KeyFunctionAddresses;
use crate::keyfunctions::role::KeyFunctionRole;

/// Shared, write-once holder of a resolved `KeyFunctionAddresses`.
///
/// Population happens on an owned value before `publish`; afterwards the
/// catalogue is immutable and readable from any worker without locking.
#[derive(Debug, Default)]
pub struct KeyFunctionRegistry {
    cell: OnceCell<KeyFunctionAddresses>,
}

impl KeyFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the resolved catalogue. Only one publish ever succeeds.
    pub fn publish(&self, addresses: KeyFunctionAddresses) -> Result<()> {
        if !addresses.is_resolved() {
            return Err(IsilError::RegistryNotResolved);
        }
        self.cell
            .set(addresses)
            .map_err(|_| IsilError::RegistryAlreadyResolved)
    }

    pub fn is_published(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get(&self) -> Result<&KeyFunctionAddresses> {
        self.cell.get().ok_or(IsilError::RegistryNotResolved)
    }

    /// Role lookup that treats an unpublished registry as "no role".
    ///
    /// CFG construction consults roles opportunistically; lowering uses
    /// [`KeyFunctionRegistry::get`] and fails instead.
    pub fn role_hint(&self, address: VirtualAddress) -> Option<KeyFunctionRole> {
        self.cell.get().and_then(|k| k.role_at(address).ok().flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::binary::Architecture;

    fn resolved() -> KeyFunctionAddresses {
        let mut kfa = KeyFunctionAddresses::new(Architecture::X86_64);
        kfa.set(KeyFunctionRole::ObjectAllocator, 0x4000).unwrap();
        kfa.mark_resolved();
        kfa
    }

    #[test]
    fn test_publish_once() {
        let reg = KeyFunctionRegistry::new();
        assert!(matches!(reg.get(), Err(IsilError::RegistryNotResolved)));
        assert_eq!(reg.role_hint(0x4000), None);

        reg.publish(resolved()).unwrap();
        assert!(reg.is_published());
        assert_eq!(reg.role_hint(0x4000), Some(KeyFunctionRole::ObjectAllocator));
        assert!(matches!(
            reg.publish(resolved()),
            Err(IsilError::RegistryAlreadyResolved)
        ));
    }

    #[test]
    fn test_publish_requires_resolved_state() {
        let reg = KeyFunctionRegistry::new();
        let err = reg
            .publish(KeyFunctionAddresses::new(Architecture::X86_64))
            .unwrap_err();
        assert!(matches!(err, IsilError::RegistryNotResolved));
        assert!(!reg.is_published());
    }

    #[test]
    fn test_concurrent_readers() {
        let reg = std::sync::Arc::new(KeyFunctionRegistry::new());
        reg.publish(resolved()).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.role_hint(0x4000))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Some(KeyFunctionRole::ObjectAllocator));
        }
    }
}
