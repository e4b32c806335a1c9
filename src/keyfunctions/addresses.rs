//! Role/address catalogue for one loaded binary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::address::VirtualAddress;
use crate::core::binary::Architecture;
use crate::error::{IsilError, Result};
use crate::keyfunctions::role::KeyFunctionRole;

/// Result of a role lookup on a resolved registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyFunctionAddress {
    Known(VirtualAddress),
    /// The resolution pass found no implementation for the role
    Unknown,
}

impl KeyFunctionAddress {
    pub fn known(&self) -> Option<VirtualAddress> {
        match self {
            KeyFunctionAddress::Known(a) => Some(*a),
            KeyFunctionAddress::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, KeyFunctionAddress::Known(_))
    }
}

impl fmt::Display for KeyFunctionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFunctionAddress::Known(a) => write!(f, "{:#x}", a),
            KeyFunctionAddress::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryState {
    /// Being populated; lookups are rejected
    Unresolved,
    /// Read-only; lookups are total over the role set
    Resolved,
}

/// Mapping from helper roles to addresses plus the reverse index.
///
/// Writes are accepted only while `Unresolved`, lookups only once
/// `Resolved`. The transition is one-way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFunctionAddresses {
    architecture: Architecture,
    state: RegistryState,
    by_role: BTreeMap<KeyFunctionRole, VirtualAddress>,
    by_address: BTreeMap<VirtualAddress, KeyFunctionRole>,
}

impl KeyFunctionAddresses {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            state: RegistryState::Unresolved,
            by_role: BTreeMap::new(),
            by_address: BTreeMap::new(),
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    pub fn is_resolved(&self) -> bool {
        self.state == RegistryState::Resolved
    }

    fn ensure_unresolved(&self) -> Result<()> {
        if self.is_resolved() {
            return Err(IsilError::RegistryAlreadyResolved);
        }
        Ok(())
    }

    fn ensure_resolved(&self) -> Result<()> {
        if !self.is_resolved() {
            return Err(IsilError::RegistryNotResolved);
        }
        Ok(())
    }

    /// Record the implementation address of `role`, replacing any earlier one.
    pub fn set(&mut self, role: KeyFunctionRole, address: VirtualAddress) -> Result<()> {
        self.ensure_unresolved()?;
        if let Some(old) = self.by_role.insert(role, address) {
            if old != address {
                self.by_address.retain(|_, r| *r != role);
            }
        }
        if let Some(other) = self.by_address.insert(address, role) {
            if other != role {
                tracing::warn!(
                    address = format_args!("{:#x}", address),
                    %role,
                    replaced = %other,
                    "Two key function roles claim one address"
                );
                self.by_role.remove(&other);
            }
        }
        Ok(())
    }

    /// Add a reverse-only alias, e.g. a thunk that jumps to the implementation.
    pub fn add_alias(&mut self, address: VirtualAddress, role: KeyFunctionRole) -> Result<()> {
        self.ensure_unresolved()?;
        self.by_address.entry(address).or_insert(role);
        Ok(())
    }

    /// Close the population phase.
    pub fn mark_resolved(&mut self) {
        if !self.is_resolved() {
            tracing::debug!(
                known = self.by_role.len(),
                aliases = self.by_address.len().saturating_sub(self.by_role.len()),
                "Key function addresses resolved"
            );
        }
        self.state = RegistryState::Resolved;
    }

    /// Address implementing `role`. Total over the role set once resolved.
    pub fn address_of(&self, role: KeyFunctionRole) -> Result<KeyFunctionAddress> {
        self.ensure_resolved()?;
        Ok(self
            .by_role
            .get(&role)
            .map_or(KeyFunctionAddress::Unknown, |a| KeyFunctionAddress::Known(*a)))
    }

    /// Role of the helper at `address`, including thunk aliases.
    pub fn role_at(&self, address: VirtualAddress) -> Result<Option<KeyFunctionRole>> {
        self.ensure_resolved()?;
        Ok(self.by_address.get(&address).copied())
    }

    /// Every role with its lookup result, in role order.
    pub fn entries(&self) -> Result<Vec<(KeyFunctionRole, KeyFunctionAddress)>> {
        KeyFunctionRole::ALL
            .into_iter()
            .map(|role| self.address_of(role).map(|a| (role, a)))
            .collect()
    }

    pub fn known_count(&self) -> usize {
        self.by_role.len()
    }
}
