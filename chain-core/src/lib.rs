//! Core blockchain data structures and primitives
//!
//! This crate provides the building blocks shared by the consensus layer:
//! - Basic types (Hash, Address, BlockIndex, etc.)
//! - Little-endian binary reader/writer with variable-length integers
//! - Ed25519 key pairs, public keys and signatures
//! - Block header, block and multi-signature witness structures

pub mod block;
pub mod crypto;
pub mod error;
pub mod io;
pub mod types;
pub mod witness;

// Re-export commonly used types
pub use block::*;
pub use crypto::*;
pub use error::*;
pub use io::{BinaryReader, BinaryWriter};
pub use types::*;
pub use witness::*;
