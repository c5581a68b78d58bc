//! dBFT consensus state machine
//!
//! [`DbftEngine`] is synchronous: every entry point takes the current time,
//! mutates the round and returns the [`Action`]s the host must carry out.
//! Timers, candidate production and networking live in the host (see
//! [`crate::service`]).

use crate::config::DbftConfig;
use crate::error::ErrorKind;
use crate::evidence::{DoubleSignEvidence, DoubleSignKind, ViolationKind, ViolationTracker};
use crate::messages::*;
use crate::payload::ConsensusPayload;
use crate::recovery;
use crate::round::{BufferOutcome, ChangeViewRecord, CommitRecord, Proposal, RoundState};
use crate::traits::{BlockProducer, Candidate, Signer};
use crate::validators::ValidatorSet;
use crate::{ConsensusError, ConsensusResult};
use bytes::Bytes;
use chain_core::{
    merkle_root, Block, BlockHeader, BlockIndex, Hash, PublicKey, SealedBlock, Signature,
    Timestamp, Witness, BLOCK_VERSION,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Heights of double-sign evidence kept behind the current height
const EVIDENCE_RETENTION_HEIGHTS: u32 = 1_000;

/// Effect the host must perform on behalf of the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send an encoded payload to the committee
    Broadcast(Bytes),
    /// Replace the round timer; fire `on_timeout(height, view)` after `after`
    ScheduleTimeout {
        height: BlockIndex,
        view: u8,
        after: Duration,
    },
    /// Cancel the round timer
    CancelTimeout,
    /// Ask the block producer for a candidate, then call `on_candidate`
    ProduceCandidate { height: BlockIndex, view: u8 },
    /// Hand a finalized block to the ledger
    SubmitBlock(SealedBlock),
}

/// Parameters of a new height
#[derive(Debug, Clone)]
pub struct RoundStart {
    pub height: BlockIndex,
    pub prev_hash: Hash,
    pub prev_timestamp: Timestamp,
    /// Ordered committee for `height`
    pub committee: Vec<PublicKey>,
}

/// Counters for operational metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub payloads_received: u64,
    /// Undecodable or structurally invalid payloads
    pub malformed_payloads: u64,
    /// Payloads for another height
    pub stale_payloads: u64,
    /// Exact repeats of messages already recorded
    pub duplicate_payloads: u64,
    /// Dropped by a protocol rule; details in the violation tracker
    pub rejected_payloads: u64,
    pub evicted_responses: u64,
    pub view_changes: u64,
    pub recovery_messages_sent: u64,
    pub blocks_finalized: u64,
}

/// dBFT consensus engine for one node
pub struct DbftEngine {
    config: Arc<DbftConfig>,
    signer: Arc<dyn Signer>,
    producer: Arc<dyn BlockProducer>,
    round: Option<RoundState>,
    violations: ViolationTracker,
    stats: EngineStats,
    recovering: bool,
}

impl DbftEngine {
    /// Create an engine; call [`DbftEngine::start_round`] to begin a height
    pub fn new(
        config: Arc<DbftConfig>,
        signer: Arc<dyn Signer>,
        producer: Arc<dyn BlockProducer>,
    ) -> Self {
        Self {
            config,
            signer,
            producer,
            round: None,
            violations: ViolationTracker::default(),
            stats: EngineStats::default(),
            recovering: false,
        }
    }

    pub fn config(&self) -> &DbftConfig {
        &self.config
    }

    /// Round for the current height, if one was started
    pub fn round(&self) -> Option<&RoundState> {
        self.round.as_ref()
    }

    pub fn violations(&self) -> &ViolationTracker {
        &self.violations
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Enter a new height at view 0
    pub fn start_round(&mut self, start: RoundStart) -> ConsensusResult<Vec<Action>> {
        let validators = ValidatorSet::new(start.height, start.committee)?;
        let my_index = validators.index_of(&self.signer.public_key());
        let capacity = self.config.response_buffer_capacity(validators.len());

        match my_index {
            Some(index) => info!(
                "Starting height {} as validator #{} of {}",
                start.height,
                index,
                validators.len()
            ),
            None => info!("Starting height {} as observer", start.height),
        }

        self.violations
            .cleanup_old_records(start.height, EVIDENCE_RETENTION_HEIGHTS);
        self.round = Some(RoundState::new(
            validators,
            my_index,
            start.prev_hash,
            start.prev_timestamp,
            capacity,
        ));

        let mut actions = Vec::new();
        self.initialize_view(&mut actions);
        Ok(actions)
    }

    /// Broadcast a RecoveryRequest, e.g. after a restart
    pub fn request_recovery(&mut self, now: Timestamp) -> ConsensusResult<Vec<Action>> {
        let mut actions = Vec::new();
        let Some(round) = self.round.as_mut() else {
            return Ok(actions);
        };
        let Some(my_index) = round.my_index() else {
            return Ok(actions);
        };

        let message = ConsensusMessage::new(
            MessageHeader::new(round.height(), my_index, round.view()),
            MessageBody::RecoveryRequest(RecoveryRequest { timestamp: now }),
        );
        let payload = ConsensusPayload::sign(message, self.config.network, self.signer.as_ref())?;
        round.mark_known(payload.hash());
        info!("Requesting recovery at height {} view {}", round.height(), round.view());
        actions.push(Action::Broadcast(payload.encode()));
        Ok(actions)
    }

    /// Handle an encoded payload from the network
    ///
    /// Only fatal errors are returned; everything else is logged, counted and
    /// dropped.
    pub fn on_payload(&mut self, data: &[u8], now: Timestamp) -> ConsensusResult<Vec<Action>> {
        self.stats.payloads_received += 1;
        let mut actions = Vec::new();
        match ConsensusPayload::decode(data) {
            Ok(payload) => self.process_payload(payload, now, &mut actions)?,
            Err(e) => self.note_dropped(e.into()),
        }
        Ok(actions)
    }

    /// Handle the round timer for `(height, view)`
    pub fn on_timeout(
        &mut self,
        height: BlockIndex,
        view: u8,
        now: Timestamp,
    ) -> ConsensusResult<Vec<Action>> {
        let mut actions = Vec::new();
        let Some(round) = self.round.as_ref() else {
            return Ok(actions);
        };
        if round.height() != height || round.view() != view {
            trace!("Ignoring stale timer for height {} view {}", height, view);
            return Ok(actions);
        }
        let Some(my_index) = round.my_index() else {
            return Ok(actions);
        };
        if round.is_finalized() {
            return Ok(actions);
        }

        if round.commit_sent() {
            debug!(
                "Timeout at height {} view {} after commit, broadcasting recovery",
                height, view
            );
            actions.push(Action::ScheduleTimeout {
                height,
                view,
                after: self.config.timeout_for_view(view),
            });
            self.broadcast_recovery(&mut actions)?;
            return Ok(actions);
        }

        // repeat the pending request instead of signing a new one
        if let Some(record) = round.change_view(my_index) {
            if record.original_view == view {
                debug!(
                    "Timeout at height {} view {}, repeating change view to {}",
                    height, view, record.new_view
                );
                actions.push(Action::ScheduleTimeout {
                    height,
                    view,
                    after: self.config.timeout_for_view(record.new_view),
                });
                actions.push(Action::Broadcast(record.payload.encode()));
                return Ok(actions);
            }
        }

        info!("Timeout at height {} view {}", height, view);
        self.request_change_view(ChangeViewReason::Timeout, now, &mut actions)?;
        Ok(actions)
    }

    /// Handle the block producer's answer to [`Action::ProduceCandidate`]
    pub fn on_candidate(
        &mut self,
        height: BlockIndex,
        view: u8,
        result: ConsensusResult<Candidate>,
        now: Timestamp,
    ) -> ConsensusResult<Vec<Action>> {
        let mut actions = Vec::new();
        let Some(round) = self.round.as_mut() else {
            return Ok(actions);
        };
        if round.height() != height
            || round.view() != view
            || !round.is_primary()
            || round.current_proposal().is_some()
            || round.is_finalized()
            || round.commit_sent()
            || round.rejects_preparations()
        {
            debug!("Ignoring candidate for height {} view {}", height, view);
            return Ok(actions);
        }
        let Some(my_index) = round.my_index() else {
            return Ok(actions);
        };

        let candidate = match result {
            Ok(candidate) => candidate,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    "Candidate production failed at height {} view {}: {}",
                    height, view, e
                );
                self.request_change_view(ChangeViewReason::BlockTimeout, now, &mut actions)?;
                return Ok(actions);
            }
        };

        let mut transaction_hashes = candidate.transaction_hashes;
        let mut seen = HashSet::new();
        transaction_hashes.retain(|hash| seen.insert(*hash));
        transaction_hashes.truncate(self.config.max_transactions_per_block);

        let request = PrepareRequest {
            version: BLOCK_VERSION,
            prev_hash: round.prev_hash(),
            timestamp: candidate
                .timestamp
                .max(round.prev_timestamp().saturating_add(1)),
            nonce: candidate.nonce,
            transaction_hashes,
        };
        let message = ConsensusMessage::new(
            MessageHeader::new(height, my_index, view),
            MessageBody::PrepareRequest(request),
        );
        let payload = ConsensusPayload::sign(message, self.config.network, self.signer.as_ref())?;
        let proposal = build_proposal(round.validators(), &payload, self.config.network)?;

        info!(
            "Sending PrepareRequest at height {} view {} with {} transactions",
            height,
            view,
            proposal.block.transaction_hashes.len()
        );
        actions.push(Action::Broadcast(payload.encode()));
        round.insert_proposal(view, proposal);
        round.add_preparation(my_index, payload);

        self.after_proposal_accepted(&mut actions)?;
        Ok(actions)
    }

    fn initialize_view(&mut self, actions: &mut Vec<Action>) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if round.is_watch_only() {
            return;
        }
        let (height, view) = (round.height(), round.view());
        if round.is_primary() {
            debug!("Primary at height {} view {}, requesting candidate", height, view);
            round.set_candidate_requested();
            actions.push(Action::ProduceCandidate { height, view });
        } else {
            debug!(
                "Backup at height {} view {}, primary is #{}",
                height,
                view,
                round.primary_index()
            );
        }
        actions.push(Action::ScheduleTimeout {
            height,
            view,
            after: self.config.timeout_for_view(view),
        });
    }

    fn process_payload(
        &mut self,
        payload: ConsensusPayload,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        match self.handle_payload(payload, now, actions) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.note_dropped(e);
                Ok(())
            }
        }
    }

    fn handle_payload(
        &mut self,
        payload: ConsensusPayload,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let Some(round) = self.round.as_ref() else {
            trace!("No active round, dropping payload");
            return Ok(());
        };
        let message = &payload.message;
        let index = message.validator_index();

        if message.height() != round.height() {
            debug!(
                "Dropping {:?} for height {} at height {}",
                message.message_type(),
                message.height(),
                round.height()
            );
            self.stats.stale_payloads += 1;
            return Ok(());
        }
        let Some(key) = round.validators().get(index) else {
            return Err(ConsensusError::violation(
                index,
                ViolationKind::UnknownValidator,
                format!("committee has {} members", round.validators().len()),
            ));
        };
        if !message.verify(round.validators().len(), self.config.max_transactions_per_block) {
            return Err(ConsensusError::InvalidMessage(format!(
                "{:?} from validator {} failed verification",
                message.message_type(),
                index
            )));
        }
        if !payload.verify_witness(self.config.network, key, self.signer.as_ref()) {
            return Err(ConsensusError::violation(
                index,
                ViolationKind::InvalidWitness,
                format!("bad signature on {:?}", message.message_type()),
            ));
        }

        match message.message_type() {
            MessageType::ChangeView => self.on_change_view(payload, now, actions),
            MessageType::PrepareRequest => self.on_prepare_request(payload, now, actions),
            MessageType::PrepareResponse => self.on_prepare_response(payload, actions),
            MessageType::Commit => self.on_commit(payload, now, actions),
            MessageType::RecoveryRequest => self.on_recovery_request(payload, actions),
            MessageType::RecoveryMessage => self.on_recovery_message(payload, now, actions),
        }
    }

    fn on_change_view(
        &mut self,
        payload: ConsensusPayload,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let MessageBody::ChangeView(change_view) = payload.message.body else {
            return Ok(());
        };
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        let index = payload.validator_index();
        let original_view = payload.message.view_number();
        let Some(new_view) = payload.message.new_view_number() else {
            return Err(ConsensusError::InvalidMessage(
                "change view beyond the last view".to_string(),
            ));
        };

        if new_view <= round.view() {
            // the sender lags behind and needs our state
            if self.recovering {
                return Ok(());
            }
            return self.on_recovery_request(payload, actions);
        }
        if round.commit_sent() || round.is_finalized() {
            debug!("Ignoring change view from #{} after commit", index);
            return Ok(());
        }
        if let Some(existing) = round.change_view(index) {
            if existing.payload.invocation == payload.invocation {
                self.stats.duplicate_payloads += 1;
                return Ok(());
            }
            if existing.new_view >= new_view {
                return Err(ConsensusError::violation(
                    index,
                    ViolationKind::ReplayedChangeView,
                    format!(
                        "already asked for view {}, now view {}",
                        existing.new_view, new_view
                    ),
                ));
            }
        }

        debug!(
            "Change view from #{} at height {}: view {} -> {} ({:?})",
            index,
            round.height(),
            original_view,
            new_view,
            change_view.reason
        );
        round.insert_change_view(
            index,
            ChangeViewRecord {
                original_view,
                new_view,
                timestamp: change_view.timestamp,
                payload,
            },
        );
        self.check_expected_view(new_view, now, actions)
    }

    fn on_prepare_request(
        &mut self,
        payload: ConsensusPayload,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let Some(round) = self.round.as_ref() else {
            return Ok(());
        };
        let MessageBody::PrepareRequest(request) = &payload.message.body else {
            return Ok(());
        };
        let index = payload.validator_index();
        let view = payload.message.view_number();

        if view != round.view() {
            debug!(
                "Ignoring PrepareRequest for view {} in view {}",
                view,
                round.view()
            );
            return Ok(());
        }
        if !round.validators().is_primary(index, view) {
            return Err(ConsensusError::violation(
                index,
                ViolationKind::UnexpectedSender,
                format!("PrepareRequest from a backup in view {}", view),
            ));
        }
        if let Some(existing) = round.current_proposal() {
            let hash = payload.message.preparation_hash().unwrap_or_default();
            if existing.preparation_hash == hash {
                self.stats.duplicate_payloads += 1;
            } else {
                warn!(
                    "Primary #{} sent two PrepareRequests at height {} view {}",
                    index,
                    round.height(),
                    view
                );
                self.violations.record_double_sign(DoubleSignEvidence {
                    validator_index: index,
                    kind: DoubleSignKind::PrepareRequest,
                    height: round.height(),
                    view,
                    first: existing.preparation_hash,
                    second: hash,
                    detected_at: now,
                });
                self.stats.rejected_payloads += 1;
            }
            return Ok(());
        }
        if round.rejects_preparations() {
            debug!("Ignoring PrepareRequest while changing view");
            return Ok(());
        }

        if request.version != BLOCK_VERSION {
            return Err(ConsensusError::violation(
                index,
                ViolationKind::InvalidProposal,
                format!("block version {}", request.version),
            ));
        }
        if request.prev_hash != round.prev_hash() {
            return Err(ConsensusError::violation(
                index,
                ViolationKind::InvalidProposal,
                format!("previous hash {}", request.prev_hash),
            ));
        }
        if request.timestamp <= round.prev_timestamp()
            || request.timestamp > self.config.max_proposal_timestamp(now)
        {
            return Err(ConsensusError::violation(
                index,
                ViolationKind::InvalidProposal,
                format!("timestamp {} out of range", request.timestamp),
            ));
        }

        let proposal = build_proposal(round.validators(), &payload, self.config.network)?;
        let verdict = self.producer.verify_candidate(&proposal.block);
        if let Some(reason) = verdict.change_view_reason() {
            warn!(
                "Rejecting proposal at height {} view {}: {:?}",
                round.height(),
                view,
                verdict
            );
            return self.request_change_view(reason, now, actions);
        }

        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        info!(
            "Accepted PrepareRequest from #{} at height {} view {} with {} transactions",
            index,
            round.height(),
            view,
            proposal.block.transaction_hashes.len()
        );
        let preparation_hash = proposal.preparation_hash;
        round.insert_proposal(view, proposal);
        round.add_preparation(index, payload);

        if let Some(my_index) = round.my_index() {
            if !round.is_primary() && !round.response_sent() && !round.has_preparation(my_index) {
                let message = ConsensusMessage::new(
                    MessageHeader::new(round.height(), my_index, view),
                    MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
                );
                let response =
                    ConsensusPayload::sign(message, self.config.network, self.signer.as_ref())?;
                debug!("Sending PrepareResponse at height {} view {}", round.height(), view);
                actions.push(Action::Broadcast(response.encode()));
                actions.push(Action::ScheduleTimeout {
                    height: round.height(),
                    view,
                    after: self.config.timeout_for_view(view),
                });
                round.add_preparation(my_index, response);
                round.set_response_sent();
            }
        }

        self.after_proposal_accepted(actions)
    }

    fn on_prepare_response(
        &mut self,
        payload: ConsensusPayload,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let MessageBody::PrepareResponse(response) = payload.message.body else {
            return Ok(());
        };
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        let index = payload.validator_index();
        let view = payload.message.view_number();

        if view != round.view() {
            debug!(
                "Ignoring PrepareResponse for view {} in view {}",
                view,
                round.view()
            );
            return Ok(());
        }
        if round.validators().is_primary(index, view) {
            return Err(ConsensusError::violation(
                index,
                ViolationKind::UnexpectedSender,
                "PrepareResponse from the primary",
            ));
        }
        if round.rejects_preparations() {
            debug!("Ignoring PrepareResponse while changing view");
            return Ok(());
        }
        if round.has_preparation(index) {
            self.stats.duplicate_payloads += 1;
            return Ok(());
        }

        let Some(expected) = round.current_proposal().map(|p| p.preparation_hash) else {
            match round.buffer_response(payload) {
                BufferOutcome::Buffered => {
                    debug!("Buffered PrepareResponse from #{} awaiting the request", index)
                }
                BufferOutcome::Duplicate => self.stats.duplicate_payloads += 1,
                BufferOutcome::Evicted(old) => {
                    debug!("Evicted buffered PrepareResponse from #{}", old.validator_index());
                    return Err(ConsensusError::BufferFull {
                        capacity: round.buffer_capacity(),
                    });
                }
            }
            return Ok(());
        };

        if expected != response.preparation_hash {
            debug!(
                "PrepareResponse from #{} endorses {} instead of {}",
                index, response.preparation_hash, expected
            );
            return Ok(());
        }

        round.add_preparation(index, payload);
        debug!(
            "PrepareResponse from #{} ({}/{})",
            index,
            round.preparations().len(),
            round.quorum()
        );
        self.check_preparations(actions)
    }

    fn on_commit(
        &mut self,
        payload: ConsensusPayload,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let MessageBody::Commit(commit) = payload.message.body else {
            return Ok(());
        };
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        let index = payload.validator_index();
        let view = payload.message.view_number();

        if round.is_finalized() {
            trace!("Commit from #{} after finalization", index);
            return Ok(());
        }
        if let Some(existing) = round.commit(index) {
            if existing.view == view && existing.signature == commit.signature {
                self.stats.duplicate_payloads += 1;
            } else {
                warn!(
                    "Validator #{} sent conflicting commits at height {}",
                    index,
                    round.height()
                );
                self.violations.record_double_sign(DoubleSignEvidence {
                    validator_index: index,
                    kind: DoubleSignKind::Commit,
                    height: round.height(),
                    view,
                    first: existing.payload.hash(),
                    second: payload.hash(),
                    detected_at: now,
                });
                self.stats.rejected_payloads += 1;
            }
            return Ok(());
        }

        let verified = match (round.proposal(view), round.validators().get(index)) {
            (Some(proposal), Some(key)) => {
                if !self.signer.verify(&proposal.sign_data, &commit.signature, key) {
                    return Err(ConsensusError::violation(
                        index,
                        ViolationKind::InvalidCommitSignature,
                        format!("commit does not sign the view {} block", view),
                    ));
                }
                true
            }
            _ => false,
        };

        debug!(
            "Commit from #{} at height {} view {}{}",
            index,
            round.height(),
            view,
            if verified { "" } else { " (pending proposal)" }
        );
        round.insert_commit(
            index,
            CommitRecord {
                view,
                signature: commit.signature,
                payload,
                verified,
            },
        );
        // our own commit came back through recovery
        if round.my_index() == Some(index) {
            round.set_commit_sent();
        }

        if verified {
            self.check_commits(view, actions)
        } else {
            Ok(())
        }
    }

    fn on_recovery_request(
        &mut self,
        payload: ConsensusPayload,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        if !round.mark_known(payload.hash()) {
            self.stats.duplicate_payloads += 1;
            return Ok(());
        }
        let Some(my_index) = round.my_index() else {
            return Ok(());
        };

        // without a commit only the f + 1 validators after the requester answer
        if !round.commit_sent() {
            let n = round.validators().len();
            let requester = payload.validator_index() as usize;
            let chosen = (1..=round.validators().max_faulty() + 1)
                .any(|offset| (requester + offset) % n == my_index as usize);
            if !chosen {
                trace!("Not answering recovery request from #{}", requester);
                return Ok(());
            }
        }
        if !round.has_recovery_content() {
            debug!("Nothing to recover for #{}", payload.validator_index());
            return Ok(());
        }

        debug!(
            "Answering {:?} from #{} with recovery",
            payload.message.message_type(),
            payload.validator_index()
        );
        self.broadcast_recovery(actions)
    }

    fn on_recovery_message(
        &mut self,
        payload: ConsensusPayload,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let ConsensusMessage { header, body } = payload.message;
        let MessageBody::RecoveryMessage(recovery) = body else {
            return Ok(());
        };

        self.recovering = true;
        let result = self.apply_recovery(&header, &recovery, now, actions);
        self.recovering = false;
        result
    }

    /// Replay the records of a RecoveryMessage through the live handlers
    fn apply_recovery(
        &mut self,
        header: &MessageHeader,
        recovery: &RecoveryMessage,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let Some(round) = self.round.as_ref() else {
            return Ok(());
        };
        debug!(
            "Recovery from #{} at height {} view {}: {} change views, {} preparations, {} commits",
            header.validator_index,
            header.height,
            header.view_number,
            recovery.change_views.len(),
            recovery.preparations.len(),
            recovery.commits.len()
        );

        if header.view_number > round.view() && !round.commit_sent() {
            for payload in recovery::change_view_payloads(header, recovery) {
                self.process_payload(payload, now, actions)?;
            }
        }

        let Some(round) = self.round.as_ref() else {
            return Ok(());
        };
        if header.view_number == round.view()
            && !round.rejects_preparations()
            && !round.commit_sent()
        {
            if round.current_proposal().is_none() {
                if let Some(payload) = recovery::prepare_request_payload(recovery) {
                    self.process_payload(payload, now, actions)?;
                }
            }

            let Some(round) = self.round.as_ref() else {
                return Ok(());
            };
            let preparation_hash = recovery
                .preparation_hash()
                .or_else(|| round.current_proposal().map(|p| p.preparation_hash));
            if let Some(hash) = preparation_hash {
                let primary = round.validators().primary_index(header.view_number);
                for payload in recovery::prepare_response_payloads(header, recovery, hash, primary) {
                    self.process_payload(payload, now, actions)?;
                }
            }
        }

        let Some(round) = self.round.as_ref() else {
            return Ok(());
        };
        if header.view_number <= round.view() {
            for payload in recovery::commit_payloads(header, recovery) {
                self.process_payload(payload, now, actions)?;
            }
        }
        Ok(())
    }

    /// Replay buffered responses and pending commits once a proposal is known
    fn after_proposal_accepted(&mut self, actions: &mut Vec<Action>) -> ConsensusResult<()> {
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        let view = round.view();
        let Some(expected) = round.current_proposal().map(|p| p.preparation_hash) else {
            return Ok(());
        };

        for response in round.take_early_responses() {
            let index = response.validator_index();
            let endorses = matches!(
                &response.message.body,
                MessageBody::PrepareResponse(r) if r.preparation_hash == expected
            );
            if endorses {
                round.add_preparation(index, response);
            } else {
                debug!("Dropping buffered PrepareResponse from #{} for another proposal", index);
            }
        }

        self.verify_pending_commits(view);
        self.check_preparations(actions)?;
        self.check_commits(view, actions)
    }

    /// Check commits that arrived before the proposal of `view`
    fn verify_pending_commits(&mut self, view: u8) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        let Some(sign_data) = round.proposal(view).map(|p| p.sign_data.clone()) else {
            return;
        };

        for index in round.unverified_commits(view) {
            let valid = match (round.commit(index), round.validators().get(index)) {
                (Some(record), Some(key)) => {
                    self.signer.verify(&sign_data, &record.signature, key)
                }
                _ => false,
            };
            if valid {
                round.set_commit_verified(index);
            } else {
                warn!("Dropping commit from #{} that does not sign the view {} block", index, view);
                round.remove_commit(index);
                self.violations
                    .record(index, ViolationKind::InvalidCommitSignature);
            }
        }
    }

    /// Send our Commit once the current proposal has a quorum of preparations
    fn check_preparations(&mut self, actions: &mut Vec<Action>) -> ConsensusResult<()> {
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        if round.commit_sent() || round.is_finalized() {
            return Ok(());
        }
        let Some(my_index) = round.my_index() else {
            return Ok(());
        };
        if round.preparations().len() < round.quorum() {
            return Ok(());
        }
        let Some(sign_data) = round.current_proposal().map(|p| p.sign_data.clone()) else {
            return Ok(());
        };

        let (height, view) = (round.height(), round.view());
        let signature: Signature = self.signer.sign(&sign_data)?;
        let message = ConsensusMessage::new(
            MessageHeader::new(height, my_index, view),
            MessageBody::Commit(Commit { signature }),
        );
        let payload = ConsensusPayload::sign(message, self.config.network, self.signer.as_ref())?;

        info!(
            "Sending Commit at height {} view {} with {} preparations",
            height,
            view,
            round.preparations().len()
        );
        actions.push(Action::Broadcast(payload.encode()));
        actions.push(Action::ScheduleTimeout {
            height,
            view,
            after: self.config.timeout_for_view(view),
        });
        round.insert_commit(
            my_index,
            CommitRecord {
                view,
                signature,
                payload,
                verified: true,
            },
        );
        round.set_commit_sent();

        self.check_commits(view, actions)
    }

    /// Finalize once `M` verified commits share `view`
    fn check_commits(&mut self, view: u8, actions: &mut Vec<Action>) -> ConsensusResult<()> {
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        if round.is_finalized() {
            return Ok(());
        }
        let quorum = round.quorum();
        if round.verified_commit_count(view) < quorum {
            return Ok(());
        }
        let Some(block) = round.proposal(view).map(|p| p.block.clone()) else {
            return Ok(());
        };

        let signatures: Vec<Signature> = round
            .verified_commits(view)
            .take(quorum)
            .map(|(_, record)| record.signature)
            .collect();
        let witness = Witness::multisig(quorum, round.validators().keys(), &signatures)?;
        let block_hash = block.hash()?;

        round.set_finalized(block_hash);
        self.stats.blocks_finalized += 1;
        info!(
            "Block {} finalized at height {} view {} with {} transactions",
            block_hash,
            round.height(),
            view,
            block.transaction_hashes.len()
        );
        actions.push(Action::CancelTimeout);
        actions.push(Action::SubmitBlock(SealedBlock { block, witness }));
        Ok(())
    }

    /// Ask to move to the next view and arm the timer for it
    fn request_change_view(
        &mut self,
        reason: ChangeViewReason,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let Some(round) = self.round.as_ref() else {
            return Ok(());
        };
        if round.is_watch_only() || round.is_finalized() || round.commit_sent() {
            return Ok(());
        }
        let (height, view) = (round.height(), round.view());
        let Some(new_view) = view.checked_add(1) else {
            warn!("Cannot leave view {} at height {}", view, height);
            return Ok(());
        };

        info!(
            "Requesting change view at height {} from view {} to {} ({:?})",
            height, view, new_view, reason
        );
        actions.push(Action::ScheduleTimeout {
            height,
            view,
            after: self.config.timeout_for_view(new_view),
        });
        self.send_change_view(reason, now, actions)?;
        self.check_expected_view(new_view, now, actions)
    }

    /// Sign, record and broadcast a ChangeView for the current view
    fn send_change_view(
        &mut self,
        reason: ChangeViewReason,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        let Some(my_index) = round.my_index() else {
            return Ok(());
        };
        let view = round.view();
        let Some(new_view) = view.checked_add(1) else {
            return Ok(());
        };

        let message = ConsensusMessage::new(
            MessageHeader::new(round.height(), my_index, view),
            MessageBody::ChangeView(ChangeView {
                timestamp: now,
                reason,
            }),
        );
        let payload = ConsensusPayload::sign(message, self.config.network, self.signer.as_ref())?;
        actions.push(Action::Broadcast(payload.encode()));
        round.insert_change_view(
            my_index,
            ChangeViewRecord {
                original_view: view,
                new_view,
                timestamp: now,
                payload,
            },
        );
        Ok(())
    }

    /// Move to `target` once `M` validators ask for it or a later view
    fn check_expected_view(
        &mut self,
        target: u8,
        now: Timestamp,
        actions: &mut Vec<Action>,
    ) -> ConsensusResult<()> {
        let Some(round) = self.round.as_ref() else {
            return Ok(());
        };
        if round.view() >= target || round.is_finalized() || round.commit_sent() {
            return Ok(());
        }
        if round.change_views_reaching(target) < round.quorum() {
            return Ok(());
        }

        let needs_own = !round.is_watch_only()
            && round
                .my_change_view_target()
                .map_or(true, |own| own < target);
        if needs_own {
            self.send_change_view(ChangeViewReason::ViewChanging, now, actions)?;
        }

        let Some(round) = self.round.as_mut() else {
            return Ok(());
        };
        let from = round.view();
        round.advance_view(target);
        self.stats.view_changes += 1;
        info!(
            "View changed at height {} from {} to {}, primary is #{}",
            round.height(),
            from,
            target,
            round.primary_index()
        );

        self.initialize_view(actions);
        Ok(())
    }

    fn broadcast_recovery(&mut self, actions: &mut Vec<Action>) -> ConsensusResult<()> {
        let Some(round) = self.round.as_ref() else {
            return Ok(());
        };
        let Some(my_index) = round.my_index() else {
            return Ok(());
        };
        let message = recovery::build_recovery_message(round, my_index);
        let payload = ConsensusPayload::sign(message, self.config.network, self.signer.as_ref())?;
        self.stats.recovery_messages_sent += 1;
        actions.push(Action::Broadcast(payload.encode()));
        Ok(())
    }

    fn note_dropped(&mut self, error: ConsensusError) {
        if let ConsensusError::Violation {
            validator_index,
            kind,
            ..
        } = &error
        {
            self.violations.record(*validator_index, *kind);
        }
        match error.kind() {
            ErrorKind::Structural => {
                self.stats.malformed_payloads += 1;
                debug!("Dropping malformed payload: {}", error);
            }
            ErrorKind::ProtocolViolation => {
                self.stats.rejected_payloads += 1;
                warn!("Dropping payload: {}", error);
            }
            ErrorKind::ResourceExhaustion => {
                self.stats.evicted_responses += 1;
                warn!("Shedding load: {}", error);
            }
            _ => debug!("Dropping payload: {}", error),
        }
    }
}

/// Candidate block and commit sign data for a PrepareRequest payload
fn build_proposal(
    validators: &ValidatorSet,
    payload: &ConsensusPayload,
    network: u32,
) -> ConsensusResult<Proposal> {
    let MessageBody::PrepareRequest(request) = &payload.message.body else {
        return Err(ConsensusError::InvalidMessage(
            "proposal from a non-PrepareRequest payload".to_string(),
        ));
    };
    let header = BlockHeader {
        version: request.version,
        prev_hash: request.prev_hash,
        merkle_root: merkle_root(&request.transaction_hashes),
        timestamp: request.timestamp,
        nonce: request.nonce,
        index: payload.message.height(),
        primary_index: payload.message.validator_index(),
        next_consensus: validators.next_consensus()?,
    };
    let block = Block::new(header, request.transaction_hashes.clone());
    let sign_data = block.header.sign_data(network)?;
    let preparation_hash = payload.message.preparation_hash().unwrap_or_default();

    Ok(Proposal {
        payload: payload.clone(),
        preparation_hash,
        block,
        sign_data,
    })
}
