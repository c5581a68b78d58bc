//! Consensus message types
//!
//! Every message shares a header naming the height, the sender's committee
//! index and the view it was produced in. Bodies are described per type; the
//! byte layout lives in [`crate::codec`].

use crate::DecodeError;
use chain_core::{BlockIndex, Hash, Signature, Timestamp};

/// Message type tag, the first byte of every encoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ChangeView = 0x00,
    PrepareRequest = 0x20,
    PrepareResponse = 0x21,
    Commit = 0x30,
    RecoveryRequest = 0x40,
    RecoveryMessage = 0x41,
}

impl MessageType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::ChangeView),
            0x20 => Ok(MessageType::PrepareRequest),
            0x21 => Ok(MessageType::PrepareResponse),
            0x30 => Ok(MessageType::Commit),
            0x40 => Ok(MessageType::RecoveryRequest),
            0x41 => Ok(MessageType::RecoveryMessage),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Why a validator asks to leave the current view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChangeViewReason {
    /// The round timer expired
    Timeout = 0x00,
    /// Enough peers already asked for a higher view
    ViewChanging = 0x01,
    /// The proposal references transactions this node does not have
    TransactionNotFound = 0x02,
    /// The proposal references invalid transactions
    TransactionInvalid = 0x03,
    /// The proposed block was rejected
    BlockRejected = 0x04,
    /// The primary could not produce a candidate in time
    BlockTimeout = 0x05,
}

impl ChangeViewReason {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ChangeViewReason {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ChangeViewReason::Timeout),
            0x01 => Ok(ChangeViewReason::ViewChanging),
            0x02 => Ok(ChangeViewReason::TransactionNotFound),
            0x03 => Ok(ChangeViewReason::TransactionInvalid),
            0x04 => Ok(ChangeViewReason::BlockRejected),
            0x05 => Ok(ChangeViewReason::BlockTimeout),
            other => Err(DecodeError::InvalidReason(other)),
        }
    }
}

/// Fields common to every consensus message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHeader {
    /// Height the message is about
    pub height: BlockIndex,
    /// Sender position in the committee
    pub validator_index: u8,
    /// View the sender was in
    pub view_number: u8,
}

impl MessageHeader {
    pub fn new(height: BlockIndex, validator_index: u8, view_number: u8) -> Self {
        Self {
            height,
            validator_index,
            view_number,
        }
    }
}

/// Request to move to `view_number + 1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeView {
    pub timestamp: Timestamp,
    pub reason: ChangeViewReason,
}

/// Block proposal from the primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest {
    pub version: u32,
    pub prev_hash: Hash,
    pub timestamp: Timestamp,
    pub nonce: u64,
    pub transaction_hashes: Vec<Hash>,
}

/// Backup endorsement of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareResponse {
    pub preparation_hash: Hash,
}

/// Signature over the proposed block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub signature: Signature,
}

/// Ask peers for a RecoveryMessage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub timestamp: Timestamp,
}

/// A ChangeView stripped to what is needed to rebuild and re-verify it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeViewCompact {
    pub validator_index: u8,
    pub original_view_number: u8,
    pub timestamp: Timestamp,
    pub invocation: Vec<u8>,
}

/// The signature of a PrepareRequest or PrepareResponse in the message view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparationCompact {
    pub validator_index: u8,
    pub invocation: Vec<u8>,
}

/// A Commit together with the view it was made in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCompact {
    pub view_number: u8,
    pub validator_index: u8,
    pub signature: Signature,
    pub invocation: Vec<u8>,
}

/// What a RecoveryMessage knows about the proposal of its view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    /// The full PrepareRequest, with the header it was signed under
    Request {
        header: MessageHeader,
        request: PrepareRequest,
    },
    /// Only the hash the sender's PrepareResponses endorse
    Hash(Hash),
    /// Nothing known about the proposal
    Absent,
}

/// Snapshot of a validator's round state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryMessage {
    pub change_views: Vec<ChangeViewCompact>,
    pub preparation: Preparation,
    pub preparations: Vec<PreparationCompact>,
    pub commits: Vec<CommitCompact>,
}

impl RecoveryMessage {
    /// Hash the recorded preparations endorse, if any
    pub fn preparation_hash(&self) -> Option<Hash> {
        match &self.preparation {
            Preparation::Request { header, request } => {
                Some(crate::codec::prepare_request_hash(header, request))
            }
            Preparation::Hash(hash) => Some(*hash),
            Preparation::Absent => None,
        }
    }
}

/// Message body by type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    ChangeView(ChangeView),
    PrepareRequest(PrepareRequest),
    PrepareResponse(PrepareResponse),
    Commit(Commit),
    RecoveryRequest(RecoveryRequest),
    RecoveryMessage(RecoveryMessage),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::ChangeView(_) => MessageType::ChangeView,
            MessageBody::PrepareRequest(_) => MessageType::PrepareRequest,
            MessageBody::PrepareResponse(_) => MessageType::PrepareResponse,
            MessageBody::Commit(_) => MessageType::Commit,
            MessageBody::RecoveryRequest(_) => MessageType::RecoveryRequest,
            MessageBody::RecoveryMessage(_) => MessageType::RecoveryMessage,
        }
    }
}

/// A consensus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl ConsensusMessage {
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn height(&self) -> BlockIndex {
        self.header.height
    }

    pub fn validator_index(&self) -> u8 {
        self.header.validator_index
    }

    pub fn view_number(&self) -> u8 {
        self.header.view_number
    }

    /// View a ChangeView asks for; `None` for other messages or at the last view
    pub fn new_view_number(&self) -> Option<u8> {
        match self.body {
            MessageBody::ChangeView(_) => self.header.view_number.checked_add(1),
            _ => None,
        }
    }
}
