//! The fixed set of runtime helper roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A well-known runtime helper that generated code calls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyFunctionRole {
    ObjectAllocator,
    StringAllocator,
    ArrayAllocator,
    /// Runs a type's static constructor before first use
    StaticConstructorTrampoline,
    ExceptionThrower,
    MetadataInitializer,
    TypeObjectGetter,
    InternalCallResolver,
    ValueBoxer,
    ValueUnboxer,
    PInvokeLookup,
}

impl KeyFunctionRole {
    pub const ALL: [KeyFunctionRole; 11] = [
        KeyFunctionRole::ObjectAllocator,
        KeyFunctionRole::StringAllocator,
        KeyFunctionRole::ArrayAllocator,
        KeyFunctionRole::StaticConstructorTrampoline,
        KeyFunctionRole::ExceptionThrower,
        KeyFunctionRole::MetadataInitializer,
        KeyFunctionRole::TypeObjectGetter,
        KeyFunctionRole::InternalCallResolver,
        KeyFunctionRole::ValueBoxer,
        KeyFunctionRole::ValueUnboxer,
        KeyFunctionRole::PInvokeLookup,
    ];

    /// Calls into this helper never return to the caller.
    pub fn is_no_return(&self) -> bool {
        matches!(self, KeyFunctionRole::ExceptionThrower)
    }

    /// Exported runtime API names that implement this role.
    pub fn export_names(&self) -> &'static [&'static str] {
        match self {
            KeyFunctionRole::ObjectAllocator => &["il2cpp_object_new", "il2cpp_codegen_object_new"],
            KeyFunctionRole::StringAllocator => &["il2cpp_string_new", "il2cpp_string_new_len"],
            KeyFunctionRole::ArrayAllocator => &["il2cpp_array_new_specific", "il2cpp_array_new"],
            KeyFunctionRole::StaticConstructorTrampoline => &["il2cpp_runtime_class_init"],
            KeyFunctionRole::ExceptionThrower => &["il2cpp_raise_exception"],
            KeyFunctionRole::MetadataInitializer => &["il2cpp_codegen_initialize_method"],
            KeyFunctionRole::TypeObjectGetter => &["il2cpp_type_get_object"],
            KeyFunctionRole::InternalCallResolver => &["il2cpp_resolve_icall"],
            KeyFunctionRole::ValueBoxer => &["il2cpp_value_box"],
            KeyFunctionRole::ValueUnboxer => &["il2cpp_object_unbox"],
            KeyFunctionRole::PInvokeLookup => &["il2cpp_codegen_resolve_pinvoke"],
        }
    }

    /// Find the role whose export list contains `name`. A single leading
    /// underscore (Mach-O symbol mangling) is ignored.
    pub fn from_export_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix('_').unwrap_or(name);
        Self::ALL
            .into_iter()
            .find(|r| r.export_names().contains(&name))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFunctionRole::ObjectAllocator => "object-allocator",
            KeyFunctionRole::StringAllocator => "string-allocator",
            KeyFunctionRole::ArrayAllocator => "array-allocator",
            KeyFunctionRole::StaticConstructorTrampoline => "static-constructor-trampoline",
            KeyFunctionRole::ExceptionThrower => "exception-thrower",
            KeyFunctionRole::MetadataInitializer => "metadata-initializer",
            KeyFunctionRole::TypeObjectGetter => "type-object-getter",
            KeyFunctionRole::InternalCallResolver => "internal-call-resolver",
            KeyFunctionRole::ValueBoxer => "value-boxer",
            KeyFunctionRole::ValueUnboxer => "value-unboxer",
            KeyFunctionRole::PInvokeLookup => "pinvoke-lookup",
        }
    }
}

impl fmt::Display for KeyFunctionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyFunctionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("Unknown key function role: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_thrower_is_no_return() {
        let no_return: Vec<_> = KeyFunctionRole::ALL
            .iter()
            .filter(|r| r.is_no_return())
            .collect();
        assert_eq!(no_return, vec![&KeyFunctionRole::ExceptionThrower]);
    }

    #[test]
    fn test_export_name_lookup() {
        assert_eq!(
            KeyFunctionRole::from_export_name("il2cpp_object_new"),
            Some(KeyFunctionRole::ObjectAllocator)
        );
        assert_eq!(
            KeyFunctionRole::from_export_name("_il2cpp_raise_exception"),
            Some(KeyFunctionRole::ExceptionThrower)
        );
        assert_eq!(KeyFunctionRole::from_export_name("memcpy"), None);
    }

    #[test]
    fn test_names_round_trip() {
        for role in KeyFunctionRole::ALL {
            assert_eq!(role.to_string().parse::<KeyFunctionRole>(), Ok(role));
        }
        assert!("allocator".parse::<KeyFunctionRole>().is_err());
    }

    #[test]
    fn test_export_names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for role in KeyFunctionRole::ALL {
            for name in role.export_names() {
                assert!(seen.insert(*name), "{} listed twice", name);
            }
        }
    }
}
