//! Error types for the ISIL analysis core.
//!
//! Per-method failures (`BodyNotFound`) are surfaced to the caller and
//! isolated by the session driver. Sequencing violations around the key
//! function registry are reported as distinct variants so the driver can
//! abort the whole run instead of skipping a single method.

use thiserror::Error;

use crate::core::disassembler::DisassemblerError;
use crate::isil::opcode::IsilOpcode;

/// Main error type for analysis operations.
#[derive(Debug, Error)]
pub enum IsilError {
    /// The method pointer does not resolve to mapped, executable bytes
    #[error("Method body not found at {pointer:#x}: {reason}")]
    BodyNotFound { pointer: u64, reason: String },

    /// No instruction-set adapter exists for the architecture
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Role lookups were attempted before key function resolution finished
    #[error("Key function registry has not been resolved")]
    RegistryNotResolved,

    /// A second resolution pass was attempted on an already resolved registry
    #[error("Key function registry is already resolved")]
    RegistryAlreadyResolved,

    /// An ISIL node was built with operands its opcode does not accept
    #[error("Invalid {opcode} node: {reason}")]
    InvalidNode { opcode: IsilOpcode, reason: String },

    /// A decoder backend could not be constructed
    #[error("Decoder error: {0}")]
    Decoder(#[from] DisassemblerError),

    /// Configuration values out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Container parsing errors from the image loader
    #[error("Image error: {0}")]
    Image(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IsilError {
    /// True for errors that must stop a whole-binary run rather than a single method.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IsilError::RegistryNotResolved | IsilError::RegistryAlreadyResolved
        )
    }

    pub(crate) fn body_not_found(pointer: u64, reason: impl Into<String>) -> Self {
        IsilError::BodyNotFound {
            pointer,
            reason: reason.into(),
        }
    }
}

/// Result type alias for analysis operations
pub type Result<T> = std::result::Result<T, IsilError>;
