//! Runtime helper ("key function") catalogue.
//!
//! Roles are resolved once per binary on an owned [`KeyFunctionAddresses`],
//! closed with `mark_resolved`, then published through the shared
//! [`KeyFunctionRegistry`] barrier. Lowering refuses to run before that.

pub mod addresses;
pub mod registry;
pub mod resolver;
pub mod role;

pub use addresses::{KeyFunctionAddress, KeyFunctionAddresses, RegistryState};
pub use registry::KeyFunctionRegistry;
pub use resolver::{KeyFunctionResolver, SymbolTableResolver};
pub use role::KeyFunctionRole;
