//! Delegated Byzantine Fault Tolerance consensus
//!
//! A committee of `N` validators agrees on one block per height and tolerates
//! `f = (N - 1) / 3` faulty members. Each height runs in views; the primary of
//! a view proposes, backups endorse, and `M = N - f` commit signatures finalize
//! the block. A stalled view is abandoned through change-view votes, and
//! recovery messages let lagging validators catch up.
//!
//! [`DbftEngine`] is the synchronous state machine; [`ConsensusService`] hosts
//! it on tokio against the collaborator traits in [`traits`].

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod messages;
pub mod payload;
pub mod recovery;
pub mod round;
pub mod service;
pub mod traits;
pub mod validators;

pub use config::{DbftConfig, DEFAULT_NETWORK};
pub use engine::{Action, DbftEngine, EngineStats, RoundStart};
pub use error::{ConsensusError, ConsensusResult, DecodeError, ErrorKind};
pub use evidence::{DoubleSignEvidence, DoubleSignKind, ViolationKind, ViolationTracker};
pub use messages::{ChangeViewReason, ConsensusMessage, MessageBody, MessageHeader, MessageType};
pub use payload::ConsensusPayload;
pub use round::{RoundPhase, RoundState};
pub use service::{Collaborators, ConsensusService, ServiceCommand, ServiceHandle};
pub use traits::{
    BlockProducer, Candidate, CandidateVerdict, KeyPairSigner, Ledger, Signer, Transport,
    ValidatorProvider,
};
pub use validators::{max_faulty, quorum_size, ValidatorSet};
