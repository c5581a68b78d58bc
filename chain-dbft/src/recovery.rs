//! Recovery messages: packing round state and rebuilding the signed payloads
//!
//! A RecoveryMessage carries each record in compact form together with the
//! original signature. The receiver rebuilds the exact payloads and feeds them
//! through the live handlers, so signatures are checked again and duplicate
//! votes are ignored the same way.

use crate::messages::*;
use crate::payload::ConsensusPayload;
use crate::round::{ChangeViewRecord, RoundState};
use chain_core::Hash;
use std::collections::BTreeMap;

/// Build a RecoveryMessage describing `round`, sent by `my_index`
pub fn build_recovery_message(round: &RoundState, my_index: u8) -> ConsensusMessage {
    let change_views = (0..round.validators().len() as u8)
        .filter_map(|index| {
            round
                .change_view(index)
                .or_else(|| round.last_change_views().get(&index))
                .map(|record| change_view_compact(index, record))
        })
        .collect();

    let (preparation, preparations) = match current_request(round) {
        Some((header, request)) => {
            let preparations = round
                .preparations()
                .iter()
                .map(|(index, payload)| PreparationCompact {
                    validator_index: *index,
                    invocation: payload.invocation.clone(),
                })
                .collect();
            (Preparation::Request { header, request }, preparations)
        }
        None => match most_endorsed_hash(round) {
            Some(hash) => {
                let preparations = round
                    .early_responses()
                    .filter(|p| response_hash(p) == Some(hash))
                    .map(|p| PreparationCompact {
                        validator_index: p.validator_index(),
                        invocation: p.invocation.clone(),
                    })
                    .collect();
                (Preparation::Hash(hash), preparations)
            }
            None => (Preparation::Absent, Vec::new()),
        },
    };

    let commits = round
        .commits()
        .iter()
        .map(|(index, record)| CommitCompact {
            view_number: record.view,
            validator_index: *index,
            signature: record.signature,
            invocation: record.payload.invocation.clone(),
        })
        .collect();

    ConsensusMessage::new(
        MessageHeader::new(round.height(), my_index, round.view()),
        MessageBody::RecoveryMessage(RecoveryMessage {
            change_views,
            preparation,
            preparations,
            commits,
        }),
    )
}

/// ChangeView payloads carried by a recovery message
///
/// The reason is not part of the compact form; rebuilt messages say
/// `Timeout`, which the signature does not cover.
pub fn change_view_payloads(header: &MessageHeader, recovery: &RecoveryMessage) -> Vec<ConsensusPayload> {
    recovery
        .change_views
        .iter()
        .map(|cv| {
            let message = ConsensusMessage::new(
                MessageHeader::new(header.height, cv.validator_index, cv.original_view_number),
                MessageBody::ChangeView(ChangeView {
                    timestamp: cv.timestamp,
                    reason: ChangeViewReason::Timeout,
                }),
            );
            ConsensusPayload::with_invocation(message, cv.invocation.clone())
        })
        .collect()
}

/// The primary's PrepareRequest payload, if the message embeds the request
/// and the primary's preparation signature
pub fn prepare_request_payload(recovery: &RecoveryMessage) -> Option<ConsensusPayload> {
    let Preparation::Request { header, request } = &recovery.preparation else {
        return None;
    };
    let compact = recovery
        .preparations
        .iter()
        .find(|p| p.validator_index == header.validator_index)?;
    Some(ConsensusPayload::with_invocation(
        ConsensusMessage::new(*header, MessageBody::PrepareRequest(request.clone())),
        compact.invocation.clone(),
    ))
}

/// PrepareResponse payloads endorsing `preparation_hash`, skipping the primary
pub fn prepare_response_payloads(
    header: &MessageHeader,
    recovery: &RecoveryMessage,
    preparation_hash: Hash,
    primary_index: u8,
) -> Vec<ConsensusPayload> {
    recovery
        .preparations
        .iter()
        .filter(|p| p.validator_index != primary_index)
        .map(|p| {
            let message = ConsensusMessage::new(
                MessageHeader::new(header.height, p.validator_index, header.view_number),
                MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
            );
            ConsensusPayload::with_invocation(message, p.invocation.clone())
        })
        .collect()
}

/// Commit payloads, each in the view it was cast
pub fn commit_payloads(header: &MessageHeader, recovery: &RecoveryMessage) -> Vec<ConsensusPayload> {
    recovery
        .commits
        .iter()
        .map(|c| {
            let message = ConsensusMessage::new(
                MessageHeader::new(header.height, c.validator_index, c.view_number),
                MessageBody::Commit(Commit {
                    signature: c.signature,
                }),
            );
            ConsensusPayload::with_invocation(message, c.invocation.clone())
        })
        .collect()
}

fn change_view_compact(index: u8, record: &ChangeViewRecord) -> ChangeViewCompact {
    ChangeViewCompact {
        validator_index: index,
        original_view_number: record.original_view,
        timestamp: record.timestamp,
        invocation: record.payload.invocation.clone(),
    }
}

fn current_request(round: &RoundState) -> Option<(MessageHeader, PrepareRequest)> {
    let proposal = round.current_proposal()?;
    match &proposal.payload.message.body {
        MessageBody::PrepareRequest(request) => {
            Some((proposal.payload.message.header, request.clone()))
        }
        _ => None,
    }
}

fn response_hash(payload: &ConsensusPayload) -> Option<Hash> {
    match &payload.message.body {
        MessageBody::PrepareResponse(response) => Some(response.preparation_hash),
        _ => None,
    }
}

/// Hash endorsed by the most buffered responses; ties go to the smallest hash
fn most_endorsed_hash(round: &RoundState) -> Option<Hash> {
    let mut counts: BTreeMap<Hash, usize> = BTreeMap::new();
    for hash in round.early_responses().filter_map(response_hash) {
        *counts.entry(hash).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(Hash, usize)>, (hash, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((hash, count)),
        })
        .map(|(hash, _)| hash)
}
