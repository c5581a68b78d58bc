//! Consensus error types

use crate::evidence::ViolationKind;
use chain_core::{BlockIndex, CoreError};
use thiserror::Error;

/// Failure to decode a consensus message from the wire
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Type byte does not name a known message
    #[error("Unknown message type: {0:#04x}")]
    UnknownType(u8),

    /// ChangeView carries an undefined reason byte
    #[error("Invalid change view reason: {0:#04x}")]
    InvalidReason(u8),

    /// Structurally invalid content
    #[error("Malformed message: {0}")]
    Format(String),

    /// Low-level read failure (truncation, oversized length, trailing bytes)
    #[error(transparent)]
    Io(#[from] CoreError),
}

/// How a consensus error should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Undecodable or structurally invalid input; dropped
    Structural,
    /// Well-formed input that breaks protocol rules; dropped and recorded
    ProtocolViolation,
    /// A bounded buffer had to shed entries
    ResourceExhaustion,
    /// A collaborator failed in a way the round can recover from
    Transient,
    /// Local failure; the round cannot continue
    Fatal,
}

/// Consensus error type
#[derive(Error, Debug, Clone)]
pub enum ConsensusError {
    /// Wire decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Message failed structural verification
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message broke a protocol rule
    #[error("Protocol violation by validator {validator_index} ({kind:?}): {detail}")]
    Violation {
        validator_index: u8,
        kind: ViolationKind,
        detail: String,
    },

    /// A bounded buffer is full
    #[error("Buffer full: capacity {capacity}")]
    BufferFull { capacity: usize },

    /// Candidate production failed
    #[error("Candidate production failed: {0}")]
    Production(String),

    /// Actor channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Signer could not produce a signature
    #[error("Signer unavailable: {0}")]
    SignerUnavailable(String),

    /// No committee for the height
    #[error("Empty committee at height {height}")]
    EmptyCommittee { height: BlockIndex },

    /// Committee cannot be used (duplicates, too large)
    #[error("Invalid committee: {0}")]
    InvalidCommittee(String),

    /// Ledger rejected a finalized block
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Core data structure error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl ConsensusError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::Decode(_) | ConsensusError::InvalidMessage(_) => ErrorKind::Structural,
            ConsensusError::Violation { .. } => ErrorKind::ProtocolViolation,
            ConsensusError::BufferFull { .. } => ErrorKind::ResourceExhaustion,
            ConsensusError::Production(_) | ConsensusError::ChannelClosed(_) => {
                ErrorKind::Transient
            }
            ConsensusError::SignerUnavailable(_)
            | ConsensusError::EmptyCommittee { .. }
            | ConsensusError::InvalidCommittee(_)
            | ConsensusError::Ledger(_)
            | ConsensusError::Config(_)
            | ConsensusError::Serialization(_)
            | ConsensusError::Core(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub(crate) fn violation(validator_index: u8, kind: ViolationKind, detail: impl Into<String>) -> Self {
        ConsensusError::Violation {
            validator_index,
            kind,
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            ConsensusError::from(DecodeError::UnknownType(0x99)).kind(),
            ErrorKind::Structural
        );
        assert_eq!(
            ConsensusError::violation(3, ViolationKind::Equivocation, "two proposals").kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(
            ConsensusError::BufferFull { capacity: 7 }.kind(),
            ErrorKind::ResourceExhaustion
        );
        assert!(ConsensusError::SignerUnavailable("hsm offline".to_string()).is_fatal());
        assert!(ConsensusError::EmptyCommittee { height: 5 }.is_fatal());
        assert!(!ConsensusError::Production("mempool busy".to_string()).is_fatal());
    }

    #[test]
    fn test_core_errors_wrap_as_decode_io() {
        let err: DecodeError = CoreError::TrailingBytes(2).into();
        assert_eq!(err, DecodeError::Io(CoreError::TrailingBytes(2)));
        assert!(err.to_string().contains("2"));
    }
}
