//! Block data structures and operations

use crate::{Address, BlockIndex, CoreError, CoreResult, Hash, Timestamp, Witness};
use serde::{Deserialize, Serialize};

/// Block format version produced by this node
pub const BLOCK_VERSION: u32 = 0;

/// Block header agreed on by the committee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode)]
pub struct BlockHeader {
    /// Block format version
    pub version: u32,
    /// Hash of the previous block
    pub prev_hash: Hash,
    /// Merkle root of the transaction hashes
    pub merkle_root: Hash,
    /// Block timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Random nonce chosen by the primary
    pub nonce: u64,
    /// Block index (height)
    pub index: BlockIndex,
    /// Committee position of the primary that proposed this block
    pub primary_index: u8,
    /// Multi-signature address of the committee for the next block
    pub next_consensus: Address,
}

impl BlockHeader {
    /// Calculate the hash of this header
    pub fn hash(&self) -> CoreResult<Hash> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CoreError::Bincode(e.to_string()))?;
        Ok(Hash::keccak(&encoded))
    }

    /// Bytes committee members sign to approve this header on `network`
    pub fn sign_data(&self, network: u32) -> CoreResult<Vec<u8>> {
        let hash = self.hash()?;
        let mut data = Vec::with_capacity(4 + Hash::LEN);
        data.extend_from_slice(&network.to_le_bytes());
        data.extend_from_slice(hash.as_bytes());
        Ok(data)
    }

    /// Get the genesis block header
    pub fn genesis() -> Self {
        Self {
            version: BLOCK_VERSION,
            prev_hash: Hash::zero(),
            merkle_root: Hash::zero(),
            timestamp: 0,
            nonce: 0,
            index: 0,
            primary_index: 0,
            next_consensus: Address::zero(),
        }
    }
}

/// Block with the hashes of its transactions
///
/// Transaction bodies are owned by the mempool and ledger; consensus only
/// agrees on their ordered hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Ordered transaction hashes
    pub transaction_hashes: Vec<Hash>,
}

impl Block {
    /// Create a new block
    pub fn new(header: BlockHeader, transaction_hashes: Vec<Hash>) -> Self {
        Self {
            header,
            transaction_hashes,
        }
    }

    /// Create genesis block
    pub fn genesis() -> Self {
        Self::new(BlockHeader::genesis(), Vec::new())
    }

    /// Get the block hash (same as header hash)
    pub fn hash(&self) -> CoreResult<Hash> {
        self.header.hash()
    }

    pub fn index(&self) -> BlockIndex {
        self.header.index
    }

    /// Check that the header commits to the listed transactions
    pub fn validate(&self) -> bool {
        merkle_root(&self.transaction_hashes) == self.header.merkle_root
    }

    /// Check if block is genesis
    pub fn is_genesis(&self) -> bool {
        self.header.index == 0 && self.header.prev_hash == Hash::zero()
    }
}

/// Block approved by the committee together with its multi-signature witness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlock {
    pub block: Block,
    pub witness: Witness,
}

impl SealedBlock {
    /// Verify the witness against the header sign data for `network`
    pub fn verify(&self, network: u32) -> CoreResult<bool> {
        let data = self.block.header.sign_data(network)?;
        self.witness.verify_multisig(&data)
    }
}

/// Merkle root over `hashes`
///
/// Odd levels duplicate their last node; an empty list has the zero root.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::zero();
    }

    let mut level = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(left.as_bytes());
                joined[32..].copy_from_slice(right.as_bytes());
                Hash::keccak(&joined)
            })
            .collect();
    }
    level[0]
}
