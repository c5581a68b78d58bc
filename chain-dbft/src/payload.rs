//! Signed envelope carrying a consensus message between validators
//!
//! Encoded as `[message: var bytes][invocation: var bytes]`. The invocation
//! is the sender's signature over `network || keccak(signing bytes)`.

use crate::codec::MAX_INVOCATION_SIZE;
use crate::messages::ConsensusMessage;
use crate::traits::Signer;
use crate::{ConsensusResult, DecodeError};
use bytes::Bytes;
use chain_core::{BinaryReader, BinaryWriter, Hash, PublicKey, Signature};

/// Largest encoded message accepted inside a payload
pub const MAX_MESSAGE_SIZE: usize = 0x0100_0000;

/// A consensus message with its sender's signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusPayload {
    pub message: ConsensusMessage,
    pub invocation: Vec<u8>,
}

impl ConsensusPayload {
    /// Sign `message` for `network`
    pub fn sign(message: ConsensusMessage, network: u32, signer: &dyn Signer) -> ConsensusResult<Self> {
        let signature = signer.sign(&sign_data(&message, network))?;
        Ok(Self {
            message,
            invocation: signature.as_bytes().to_vec(),
        })
    }

    /// Rebuild a payload from a message and a previously captured invocation
    pub fn with_invocation(message: ConsensusMessage, invocation: Vec<u8>) -> Self {
        Self { message, invocation }
    }

    /// Check the invocation against `key` with the node's verifier
    pub fn verify_witness(&self, network: u32, key: &PublicKey, verifier: &dyn Signer) -> bool {
        let Ok(signature) = Signature::from_slice(&self.invocation) else {
            return false;
        };
        verifier.verify(&sign_data(&self.message, network), &signature, key)
    }

    pub fn encode(&self) -> Bytes {
        let message = self.message.encode();
        let mut writer = BinaryWriter::with_capacity(message.len() + self.invocation.len() + 8);
        writer.write_var_bytes(&message);
        writer.write_var_bytes(&self.invocation);
        writer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = BinaryReader::new(data);
        let message_bytes = reader.read_var_bytes(MAX_MESSAGE_SIZE)?;
        let invocation = reader.read_var_bytes(MAX_INVOCATION_SIZE)?;
        reader.finish()?;
        Ok(Self {
            message: ConsensusMessage::decode(&message_bytes)?,
            invocation,
        })
    }

    /// Identity of this exact payload, used to recognize replays
    pub fn hash(&self) -> Hash {
        Hash::keccak(&self.encode())
    }

    pub fn validator_index(&self) -> u8 {
        self.message.validator_index()
    }
}

/// Data a validator signs for `message` on `network`
pub fn sign_data(message: &ConsensusMessage, network: u32) -> Vec<u8> {
    let digest = Hash::keccak(&message.signing_bytes());
    let mut data = Vec::with_capacity(4 + Hash::LEN);
    data.extend_from_slice(&network.to_le_bytes());
    data.extend_from_slice(digest.as_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;
    use crate::traits::KeyPairSigner;
    use chain_core::KeyPair;

    fn change_view(reason: ChangeViewReason) -> ConsensusMessage {
        ConsensusMessage::new(
            MessageHeader::new(10, 1, 0),
            MessageBody::ChangeView(ChangeView {
                timestamp: 1234,
                reason,
            }),
        )
    }

    #[test]
    fn test_signed_payload_verifies() {
        let signer = KeyPairSigner::new(KeyPair::from_seed(&[1u8; 32]));
        let payload = ConsensusPayload::sign(change_view(ChangeViewReason::Timeout), 7, &signer).unwrap();

        assert!(payload.verify_witness(7, &signer.public_key(), &signer));
        // other network
        assert!(!payload.verify_witness(8, &signer.public_key(), &signer));

        let stranger = KeyPair::from_seed(&[2u8; 32]).public_key();
        assert!(!payload.verify_witness(7, &stranger, &signer));
    }

    #[test]
    fn test_change_view_signature_survives_reason_loss() {
        let signer = KeyPairSigner::new(KeyPair::from_seed(&[1u8; 32]));
        let payload =
            ConsensusPayload::sign(change_view(ChangeViewReason::BlockRejected), 7, &signer).unwrap();

        let rebuilt = ConsensusPayload::with_invocation(
            change_view(ChangeViewReason::Timeout),
            payload.invocation.clone(),
        );
        assert!(rebuilt.verify_witness(7, &signer.public_key(), &signer));
        assert_ne!(rebuilt.hash(), payload.hash());
    }

    #[test]
    fn test_payload_wire_format() {
        let signer = KeyPairSigner::new(KeyPair::from_seed(&[3u8; 32]));
        let payload = ConsensusPayload::sign(change_view(ChangeViewReason::Timeout), 1, &signer).unwrap();
        let bytes = payload.encode();

        // var-bytes message of 16 bytes, then a 64-byte invocation
        assert_eq!(bytes[0], 16);
        assert_eq!(bytes[17], 64);
        assert_eq!(bytes.len(), 1 + 16 + 1 + 64);
        assert_eq!(ConsensusPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn test_malformed_invocation_does_not_verify() {
        let signer = KeyPairSigner::new(KeyPair::from_seed(&[3u8; 32]));
        let payload = ConsensusPayload::with_invocation(change_view(ChangeViewReason::Timeout), vec![1, 2, 3]);
        assert!(!payload.verify_witness(1, &signer.public_key(), &signer));
    }

    #[test]
    fn test_oversized_invocation_rejected() {
        let mut writer = BinaryWriter::new();
        writer.write_var_bytes(&change_view(ChangeViewReason::Timeout).encode());
        writer.write_var_bytes(&vec![0u8; MAX_INVOCATION_SIZE + 1]);
        assert!(ConsensusPayload::decode(&writer.into_vec()).is_err());
    }
}
