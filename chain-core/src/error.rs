//! Error types for the core crate

use thiserror::Error;

/// Core blockchain errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Non-canonical variable-length integer {0}")]
    NonCanonicalVarInt(u64),

    #[error("Length {len} exceeds maximum {max}")]
    LengthExceeded { len: u64, max: u64 },

    #[error("{0} trailing bytes after decoding")]
    TrailingBytes(usize),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Witness error: {0}")]
    Witness(String),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Bincode error: {0}")]
    Bincode(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
