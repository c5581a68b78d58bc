//! Collaborator traits the consensus engine is driven through
//!
//! The engine never talks to the network, the ledger or the mempool
//! directly; a host supplies these implementations.

use crate::messages::ChangeViewReason;
use crate::ConsensusResult;
use bytes::Bytes;
use chain_core::{Block, BlockIndex, Hash, KeyPair, PublicKey, SealedBlock, Signature, Timestamp};
use futures::future::BoxFuture;

/// Contents the primary proposes for a height
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Ordered transaction hashes
    pub transaction_hashes: Vec<Hash>,
    /// Proposed block timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Random nonce
    pub nonce: u64,
}

impl Candidate {
    pub fn new(transaction_hashes: Vec<Hash>, timestamp: Timestamp) -> Self {
        Self {
            transaction_hashes,
            timestamp,
            nonce: rand::random(),
        }
    }
}

/// Outcome of checking a proposed block against local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateVerdict {
    /// The block may be endorsed
    Accept,
    /// Some referenced transactions are unknown locally
    MissingTransactions,
    /// Some referenced transactions fail validation
    InvalidTransactions,
    /// The block is unacceptable for another reason
    Rejected,
}

impl CandidateVerdict {
    /// Reason to request a view change with, or `None` for an accepted block
    pub fn change_view_reason(self) -> Option<ChangeViewReason> {
        match self {
            CandidateVerdict::Accept => None,
            CandidateVerdict::MissingTransactions => Some(ChangeViewReason::TransactionNotFound),
            CandidateVerdict::InvalidTransactions => Some(ChangeViewReason::TransactionInvalid),
            CandidateVerdict::Rejected => Some(ChangeViewReason::BlockRejected),
        }
    }
}

/// Supplies the ordered committee for a height
pub trait ValidatorProvider: Send + Sync {
    fn committee_for(&self, height: BlockIndex) -> ConsensusResult<Vec<PublicKey>>;
}

/// Builds and checks block contents
pub trait BlockProducer: Send + Sync {
    /// Assemble a candidate for `height` in `view`
    ///
    /// May complete later than the call; the engine is notified when it does.
    fn produce_candidate(
        &self,
        height: BlockIndex,
        view: u8,
    ) -> BoxFuture<'static, ConsensusResult<Candidate>>;

    /// Check a block proposed by another primary
    fn verify_candidate(&self, block: &Block) -> CandidateVerdict;
}

/// Persists finalized blocks and reports the chain tip
pub trait Ledger: Send + Sync {
    fn submit_finalized_block(&self, block: SealedBlock) -> ConsensusResult<()>;

    fn current_height(&self) -> BlockIndex;

    fn current_hash(&self) -> Hash;

    fn current_timestamp(&self) -> Timestamp;
}

/// Holds the node's validator key
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, message: &[u8]) -> ConsensusResult<Signature>;

    fn verify(&self, message: &[u8], signature: &Signature, key: &PublicKey) -> bool {
        key.verify(message, signature)
    }
}

/// Outbound side of the consensus network
pub trait Transport: Send + Sync {
    /// Send an encoded payload to every other committee member
    fn broadcast(&self, payload: Bytes);
}

/// [`Signer`] backed by an in-memory key pair
#[derive(Debug, Clone)]
pub struct KeyPairSigner {
    keypair: KeyPair,
}

impl KeyPairSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }
}

impl Signer for KeyPairSigner {
    fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn sign(&self, message: &[u8]) -> ConsensusResult<Signature> {
        Ok(self.keypair.sign(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_reasons() {
        assert_eq!(CandidateVerdict::Accept.change_view_reason(), None);
        assert_eq!(
            CandidateVerdict::MissingTransactions.change_view_reason(),
            Some(ChangeViewReason::TransactionNotFound)
        );
        assert_eq!(
            CandidateVerdict::InvalidTransactions.change_view_reason(),
            Some(ChangeViewReason::TransactionInvalid)
        );
        assert_eq!(
            CandidateVerdict::Rejected.change_view_reason(),
            Some(ChangeViewReason::BlockRejected)
        );
    }

    #[test]
    fn test_keypair_signer() {
        let signer = KeyPairSigner::new(KeyPair::from_seed(&[4u8; 32]));
        let signature = signer.sign(b"payload").unwrap();
        assert!(signer.verify(b"payload", &signature, &signer.public_key()));
        assert!(!signer.verify(b"tampered", &signature, &signer.public_key()));
    }
}
