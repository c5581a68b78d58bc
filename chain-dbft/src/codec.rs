//! Wire format for consensus messages
//!
//! Integers are little-endian and counts use the variable-length encoding
//! from [`chain_core::io`]. A message is `[type:1][height:4][index:1][view:1]`
//! followed by its body:
//!
//! | type             | body                                                         |
//! |------------------|--------------------------------------------------------------|
//! | ChangeView       | `[timestamp:8][reason:1]`                                    |
//! | PrepareRequest   | `[version:4][prev_hash:32][timestamp:8][nonce:8][hashes]`    |
//! | PrepareResponse  | `[preparation_hash:32]`                                      |
//! | Commit           | `[signature:64]`                                             |
//! | RecoveryRequest  | `[timestamp:8]`                                              |
//! | RecoveryMessage  | change views, preparation, preparation and commit compacts   |
//!
//! A RecoveryMessage preparation is either `[1][full PrepareRequest message]`
//! or `[0][var bytes: empty or a 32-byte hash]`.

use crate::messages::*;
use crate::DecodeError;
use bytes::Bytes;
use chain_core::{BinaryReader, BinaryWriter, Hash, Signature, SIGNATURE_SIZE};
use std::collections::HashSet;

/// Largest invocation script accepted on the wire
pub const MAX_INVOCATION_SIZE: usize = 1024;

const MAX_WIRE_TRANSACTIONS: u64 = u16::MAX as u64;
const MAX_COMPACT_RECORDS: u64 = u8::MAX as u64;

/// Encode a message
pub fn encode(message: &ConsensusMessage) -> Bytes {
    let mut writer = BinaryWriter::new();
    write_message(&mut writer, message, true);
    writer.into_bytes()
}

/// Bytes covered by the sender's signature
///
/// Identical to [`encode`] except that a ChangeView omits its reason, so the
/// signature still verifies after a RecoveryMessage drops it.
pub fn signing_bytes(message: &ConsensusMessage) -> Bytes {
    let mut writer = BinaryWriter::new();
    write_message(&mut writer, message, false);
    writer.into_bytes()
}

/// Decode a message, rejecting trailing bytes
pub fn decode(data: &[u8]) -> Result<ConsensusMessage, DecodeError> {
    let mut reader = BinaryReader::new(data);
    let message = read_message(&mut reader)?;
    reader.finish()?;
    Ok(message)
}

/// Structural checks that need the committee size and block limits
pub fn verify(message: &ConsensusMessage, committee_size: usize, max_transactions: usize) -> bool {
    let in_committee = |index: u8| (index as usize) < committee_size;
    if !in_committee(message.header.validator_index) {
        return false;
    }

    match &message.body {
        MessageBody::ChangeView(_) => message.header.view_number < u8::MAX,
        MessageBody::PrepareRequest(request) => {
            transactions_valid(&request.transaction_hashes, max_transactions)
        }
        MessageBody::PrepareResponse(_)
        | MessageBody::Commit(_)
        | MessageBody::RecoveryRequest(_) => true,
        MessageBody::RecoveryMessage(recovery) => {
            let embedded_ok = match &recovery.preparation {
                Preparation::Request { header, request } => {
                    header.height == message.header.height
                        && header.view_number == message.header.view_number
                        && in_committee(header.validator_index)
                        && transactions_valid(&request.transaction_hashes, max_transactions)
                }
                Preparation::Hash(_) | Preparation::Absent => true,
            };
            embedded_ok
                && recovery
                    .change_views
                    .iter()
                    .all(|cv| in_committee(cv.validator_index) && cv.original_view_number < u8::MAX)
                && recovery
                    .preparations
                    .iter()
                    .all(|p| in_committee(p.validator_index))
                && recovery
                    .commits
                    .iter()
                    .all(|c| in_committee(c.validator_index))
        }
    }
}

/// Hash identifying a proposal: Keccak-256 of the encoded PrepareRequest
pub fn prepare_request_hash(header: &MessageHeader, request: &PrepareRequest) -> Hash {
    let mut writer = BinaryWriter::new();
    write_header(&mut writer, MessageType::PrepareRequest, header);
    write_prepare_request(&mut writer, request);
    Hash::keccak(&writer.into_vec())
}

impl ConsensusMessage {
    pub fn encode(&self) -> Bytes {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        decode(data)
    }

    pub fn verify(&self, committee_size: usize, max_transactions: usize) -> bool {
        verify(self, committee_size, max_transactions)
    }

    pub fn signing_bytes(&self) -> Bytes {
        signing_bytes(self)
    }

    /// Preparation hash if this is a PrepareRequest
    pub fn preparation_hash(&self) -> Option<Hash> {
        match &self.body {
            MessageBody::PrepareRequest(request) => {
                Some(prepare_request_hash(&self.header, request))
            }
            _ => None,
        }
    }
}

fn transactions_valid(hashes: &[Hash], max_transactions: usize) -> bool {
    if hashes.len() > max_transactions {
        return false;
    }
    let unique: HashSet<_> = hashes.iter().collect();
    unique.len() == hashes.len()
}

fn write_message(writer: &mut BinaryWriter, message: &ConsensusMessage, include_reason: bool) {
    write_header(writer, message.message_type(), &message.header);
    match &message.body {
        MessageBody::ChangeView(change_view) => {
            writer.write_u64(change_view.timestamp);
            if include_reason {
                writer.write_u8(change_view.reason.as_byte());
            }
        }
        MessageBody::PrepareRequest(request) => write_prepare_request(writer, request),
        MessageBody::PrepareResponse(response) => writer.write_hash(&response.preparation_hash),
        MessageBody::Commit(commit) => writer.write_bytes(commit.signature.as_bytes()),
        MessageBody::RecoveryRequest(request) => writer.write_u64(request.timestamp),
        MessageBody::RecoveryMessage(recovery) => write_recovery(writer, recovery),
    }
}

fn write_header(writer: &mut BinaryWriter, message_type: MessageType, header: &MessageHeader) {
    writer.write_u8(message_type.as_byte());
    writer.write_u32(header.height);
    writer.write_u8(header.validator_index);
    writer.write_u8(header.view_number);
}

fn write_prepare_request(writer: &mut BinaryWriter, request: &PrepareRequest) {
    writer.write_u32(request.version);
    writer.write_hash(&request.prev_hash);
    writer.write_u64(request.timestamp);
    writer.write_u64(request.nonce);
    writer.write_var_int(request.transaction_hashes.len() as u64);
    for hash in &request.transaction_hashes {
        writer.write_hash(hash);
    }
}

fn write_recovery(writer: &mut BinaryWriter, recovery: &RecoveryMessage) {
    writer.write_var_int(recovery.change_views.len() as u64);
    for cv in &recovery.change_views {
        writer.write_u8(cv.validator_index);
        writer.write_u8(cv.original_view_number);
        writer.write_u64(cv.timestamp);
        writer.write_var_bytes(&cv.invocation);
    }

    match &recovery.preparation {
        Preparation::Request { header, request } => {
            writer.write_bool(true);
            write_header(writer, MessageType::PrepareRequest, header);
            write_prepare_request(writer, request);
        }
        Preparation::Hash(hash) => {
            writer.write_bool(false);
            writer.write_var_bytes(hash.as_bytes());
        }
        Preparation::Absent => {
            writer.write_bool(false);
            writer.write_var_int(0);
        }
    }

    writer.write_var_int(recovery.preparations.len() as u64);
    for p in &recovery.preparations {
        writer.write_u8(p.validator_index);
        writer.write_var_bytes(&p.invocation);
    }

    writer.write_var_int(recovery.commits.len() as u64);
    for c in &recovery.commits {
        writer.write_u8(c.view_number);
        writer.write_u8(c.validator_index);
        writer.write_bytes(c.signature.as_bytes());
        writer.write_var_bytes(&c.invocation);
    }
}

fn read_message(reader: &mut BinaryReader<'_>) -> Result<ConsensusMessage, DecodeError> {
    let (message_type, header) = read_header(reader)?;
    let body = match message_type {
        MessageType::ChangeView => {
            let timestamp = reader.read_u64()?;
            let reason = ChangeViewReason::try_from(reader.read_u8()?)?;
            MessageBody::ChangeView(ChangeView { timestamp, reason })
        }
        MessageType::PrepareRequest => MessageBody::PrepareRequest(read_prepare_request(reader)?),
        MessageType::PrepareResponse => MessageBody::PrepareResponse(PrepareResponse {
            preparation_hash: reader.read_hash()?,
        }),
        MessageType::Commit => MessageBody::Commit(Commit {
            signature: read_signature(reader)?,
        }),
        MessageType::RecoveryRequest => MessageBody::RecoveryRequest(RecoveryRequest {
            timestamp: reader.read_u64()?,
        }),
        MessageType::RecoveryMessage => MessageBody::RecoveryMessage(read_recovery(reader)?),
    };
    Ok(ConsensusMessage { header, body })
}

fn read_header(reader: &mut BinaryReader<'_>) -> Result<(MessageType, MessageHeader), DecodeError> {
    let message_type = MessageType::try_from(reader.read_u8()?)?;
    let height = reader.read_u32()?;
    let validator_index = reader.read_u8()?;
    let view_number = reader.read_u8()?;
    Ok((
        message_type,
        MessageHeader {
            height,
            validator_index,
            view_number,
        },
    ))
}

fn read_signature(reader: &mut BinaryReader<'_>) -> Result<Signature, DecodeError> {
    Ok(Signature::new(reader.read_array::<SIGNATURE_SIZE>()?))
}

fn read_prepare_request(reader: &mut BinaryReader<'_>) -> Result<PrepareRequest, DecodeError> {
    let version = reader.read_u32()?;
    let prev_hash = reader.read_hash()?;
    let timestamp = reader.read_u64()?;
    let nonce = reader.read_u64()?;

    let count = reader.read_var_int(MAX_WIRE_TRANSACTIONS)? as usize;
    let mut transaction_hashes = Vec::with_capacity(count.min(reader.remaining() / Hash::LEN));
    let mut seen = HashSet::with_capacity(transaction_hashes.capacity());
    for _ in 0..count {
        let hash = reader.read_hash()?;
        if !seen.insert(hash) {
            return Err(DecodeError::Format(format!(
                "duplicate transaction hash {}",
                hash
            )));
        }
        transaction_hashes.push(hash);
    }

    Ok(PrepareRequest {
        version,
        prev_hash,
        timestamp,
        nonce,
        transaction_hashes,
    })
}

fn read_recovery(reader: &mut BinaryReader<'_>) -> Result<RecoveryMessage, DecodeError> {
    let count = reader.read_var_int(MAX_COMPACT_RECORDS)?;
    let mut change_views = Vec::with_capacity(count as usize);
    for _ in 0..count {
        change_views.push(ChangeViewCompact {
            validator_index: reader.read_u8()?,
            original_view_number: reader.read_u8()?,
            timestamp: reader.read_u64()?,
            invocation: reader.read_var_bytes(MAX_INVOCATION_SIZE)?,
        });
    }
    ensure_unique("change view", change_views.iter().map(|cv| cv.validator_index))?;

    let preparation = if reader.read_bool()? {
        let (message_type, header) = read_header(reader)?;
        if message_type != MessageType::PrepareRequest {
            return Err(DecodeError::Format(format!(
                "embedded {:?} where a PrepareRequest was expected",
                message_type
            )));
        }
        let request = read_prepare_request(reader)?;
        Preparation::Request { header, request }
    } else {
        let bytes = reader.read_var_bytes(Hash::LEN)?;
        match bytes.len() {
            0 => Preparation::Absent,
            Hash::LEN => Preparation::Hash(Hash::from_slice(&bytes).ok_or_else(|| {
                DecodeError::Format("preparation hash length".to_string())
            })?),
            n => {
                return Err(DecodeError::Format(format!(
                    "preparation hash must be 32 bytes, got {}",
                    n
                )))
            }
        }
    };

    let count = reader.read_var_int(MAX_COMPACT_RECORDS)?;
    let mut preparations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        preparations.push(PreparationCompact {
            validator_index: reader.read_u8()?,
            invocation: reader.read_var_bytes(MAX_INVOCATION_SIZE)?,
        });
    }
    ensure_unique("preparation", preparations.iter().map(|p| p.validator_index))?;

    let count = reader.read_var_int(MAX_COMPACT_RECORDS)?;
    let mut commits = Vec::with_capacity(count as usize);
    for _ in 0..count {
        commits.push(CommitCompact {
            view_number: reader.read_u8()?,
            validator_index: reader.read_u8()?,
            signature: read_signature(reader)?,
            invocation: reader.read_var_bytes(MAX_INVOCATION_SIZE)?,
        });
    }
    ensure_unique("commit", commits.iter().map(|c| c.validator_index))?;

    Ok(RecoveryMessage {
        change_views,
        preparation,
        preparations,
        commits,
    })
}

fn ensure_unique(what: &str, indexes: impl Iterator<Item = u8>) -> Result<(), DecodeError> {
    let mut seen = [false; 256];
    for index in indexes {
        if std::mem::replace(&mut seen[index as usize], true) {
            return Err(DecodeError::Format(format!(
                "duplicate {} record for validator {}",
                what, index
            )));
        }
    }
    Ok(())
}
