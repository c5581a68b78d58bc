//! Per-height round state
//!
//! One `RoundState` lives for a single height. Preparations and the early
//! response buffer belong to the current view and are reset on a view change;
//! commits, accepted proposals and change-view proofs span the whole height.

use crate::payload::ConsensusPayload;
use crate::validators::ValidatorSet;
use chain_core::{Block, BlockIndex, Hash, Signature, Timestamp};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Payload hashes remembered per height before the oldest are forgotten
pub const MAX_KNOWN_HASHES: usize = 1_024;

/// Where the round stands, derived from the recorded messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Nothing sent or accepted in this view
    Initial,
    /// This node is primary and waits for its block producer
    PrimaryPending,
    /// This node proposed the current view's block
    RequestSent,
    /// A proposal from the primary was accepted
    RequestReceived,
    /// Enough preparations are held but no commit was sent
    ResponseQuorumReached,
    /// This node signed the block
    CommitSent,
    /// The height is final
    BlockFinalized,
    /// This node asked to leave the current view
    ViewChanging,
}

/// A proposal accepted for one view
#[derive(Debug, Clone)]
pub struct Proposal {
    /// The primary's signed PrepareRequest
    pub payload: ConsensusPayload,
    pub preparation_hash: Hash,
    /// Candidate block built from the request
    pub block: Block,
    /// Data commits for this view sign
    pub sign_data: Vec<u8>,
}

/// A Commit held for the height
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub view: u8,
    pub signature: Signature,
    pub payload: ConsensusPayload,
    /// Signature checked against the proposal of `view`
    pub verified: bool,
}

/// A ChangeView held for the height
#[derive(Debug, Clone)]
pub struct ChangeViewRecord {
    pub original_view: u8,
    pub new_view: u8,
    pub timestamp: Timestamp,
    pub payload: ConsensusPayload,
}

/// Outcome of buffering a PrepareResponse that arrived before its request
#[derive(Debug)]
pub enum BufferOutcome {
    Buffered,
    /// The sender already has a buffered response
    Duplicate,
    /// Buffered after dropping the oldest entry
    Evicted(ConsensusPayload),
}

/// State of the consensus round for one height
#[derive(Debug)]
pub struct RoundState {
    validators: ValidatorSet,
    my_index: Option<u8>,
    view: u8,
    prev_hash: Hash,
    prev_timestamp: Timestamp,

    proposals: BTreeMap<u8, Proposal>,
    preparations: BTreeMap<u8, ConsensusPayload>,
    early_responses: VecDeque<ConsensusPayload>,
    buffer_capacity: usize,
    commits: BTreeMap<u8, CommitRecord>,
    change_views: BTreeMap<u8, ChangeViewRecord>,
    last_change_views: BTreeMap<u8, ChangeViewRecord>,
    known_hashes: HashSet<Hash>,
    known_order: VecDeque<Hash>,

    candidate_requested: bool,
    response_sent: bool,
    commit_sent: bool,
    finalized: Option<Hash>,
}

impl RoundState {
    /// Start a round at view 0
    pub fn new(
        validators: ValidatorSet,
        my_index: Option<u8>,
        prev_hash: Hash,
        prev_timestamp: Timestamp,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            validators,
            my_index,
            view: 0,
            prev_hash,
            prev_timestamp,
            proposals: BTreeMap::new(),
            preparations: BTreeMap::new(),
            early_responses: VecDeque::new(),
            buffer_capacity: buffer_capacity.max(1),
            commits: BTreeMap::new(),
            change_views: BTreeMap::new(),
            last_change_views: BTreeMap::new(),
            known_hashes: HashSet::new(),
            known_order: VecDeque::new(),
            candidate_requested: false,
            response_sent: false,
            commit_sent: false,
            finalized: None,
        }
    }

    pub fn height(&self) -> BlockIndex {
        self.validators.height()
    }

    pub fn view(&self) -> u8 {
        self.view
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn my_index(&self) -> Option<u8> {
        self.my_index
    }

    /// Not a committee member: observes but never signs
    pub fn is_watch_only(&self) -> bool {
        self.my_index.is_none()
    }

    pub fn primary_index(&self) -> u8 {
        self.validators.primary_index(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.my_index == Some(self.primary_index())
    }

    pub fn quorum(&self) -> usize {
        self.validators.quorum()
    }

    pub fn prev_hash(&self) -> Hash {
        self.prev_hash
    }

    pub fn prev_timestamp(&self) -> Timestamp {
        self.prev_timestamp
    }

    pub fn phase(&self) -> RoundPhase {
        if self.finalized.is_some() {
            RoundPhase::BlockFinalized
        } else if self.commit_sent {
            RoundPhase::CommitSent
        } else if self.is_view_changing() {
            RoundPhase::ViewChanging
        } else if self.current_proposal().is_some() {
            if self.preparations.len() >= self.quorum() {
                RoundPhase::ResponseQuorumReached
            } else if self.is_primary() {
                RoundPhase::RequestSent
            } else {
                RoundPhase::RequestReceived
            }
        } else if self.is_primary() && self.candidate_requested {
            RoundPhase::PrimaryPending
        } else {
            RoundPhase::Initial
        }
    }

    /// Move to `new_view`, keeping commits, proposals and change-view proofs
    pub fn advance_view(&mut self, new_view: u8) {
        self.view = new_view;
        self.preparations.clear();
        self.early_responses.clear();
        self.candidate_requested = false;
        self.response_sent = false;

        // records that justified the move become proofs; later targets stay live
        let live = std::mem::take(&mut self.change_views);
        for (index, record) in live {
            if record.new_view > new_view {
                self.change_views.insert(index, record);
            } else {
                self.last_change_views.insert(index, record);
            }
        }
    }

    pub fn proposal(&self, view: u8) -> Option<&Proposal> {
        self.proposals.get(&view)
    }

    pub fn current_proposal(&self) -> Option<&Proposal> {
        self.proposals.get(&self.view)
    }

    pub fn insert_proposal(&mut self, view: u8, proposal: Proposal) {
        self.proposals.insert(view, proposal);
    }

    /// Preparations of the current view, including the primary's request
    pub fn preparations(&self) -> &BTreeMap<u8, ConsensusPayload> {
        &self.preparations
    }

    pub fn has_preparation(&self, index: u8) -> bool {
        self.preparations.contains_key(&index)
    }

    /// Record a preparation; false if the validator already has one
    pub fn add_preparation(&mut self, index: u8, payload: ConsensusPayload) -> bool {
        if self.preparations.contains_key(&index) {
            return false;
        }
        self.preparations.insert(index, payload);
        true
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn early_responses(&self) -> impl Iterator<Item = &ConsensusPayload> {
        self.early_responses.iter()
    }

    /// Hold a PrepareResponse until the matching request arrives
    pub fn buffer_response(&mut self, payload: ConsensusPayload) -> BufferOutcome {
        let index = payload.validator_index();
        if self
            .early_responses
            .iter()
            .any(|p| p.validator_index() == index)
        {
            return BufferOutcome::Duplicate;
        }

        let evicted = if self.early_responses.len() >= self.buffer_capacity {
            self.early_responses.pop_front()
        } else {
            None
        };
        self.early_responses.push_back(payload);
        match evicted {
            Some(old) => BufferOutcome::Evicted(old),
            None => BufferOutcome::Buffered,
        }
    }

    pub fn take_early_responses(&mut self) -> Vec<ConsensusPayload> {
        self.early_responses.drain(..).collect()
    }

    pub fn commits(&self) -> &BTreeMap<u8, CommitRecord> {
        &self.commits
    }

    pub fn commit(&self, index: u8) -> Option<&CommitRecord> {
        self.commits.get(&index)
    }

    pub fn insert_commit(&mut self, index: u8, record: CommitRecord) {
        self.commits.insert(index, record);
    }

    pub fn remove_commit(&mut self, index: u8) -> Option<CommitRecord> {
        self.commits.remove(&index)
    }

    pub fn set_commit_verified(&mut self, index: u8) {
        if let Some(record) = self.commits.get_mut(&index) {
            record.verified = true;
        }
    }

    /// Indexes of commits for `view` not yet checked against its proposal
    pub fn unverified_commits(&self, view: u8) -> Vec<u8> {
        self.commits
            .iter()
            .filter(|(_, r)| r.view == view && !r.verified)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Verified commits for `view` in committee order
    pub fn verified_commits(&self, view: u8) -> impl Iterator<Item = (u8, &CommitRecord)> {
        self.commits
            .iter()
            .filter(move |(_, r)| r.view == view && r.verified)
            .map(|(index, r)| (*index, r))
    }

    pub fn verified_commit_count(&self, view: u8) -> usize {
        self.verified_commits(view).count()
    }

    /// More than `f` validators have committed, so the height cannot be abandoned
    pub fn more_than_f_committed(&self) -> bool {
        self.commits.len() > self.validators.max_faulty()
    }

    pub fn change_views(&self) -> &BTreeMap<u8, ChangeViewRecord> {
        &self.change_views
    }

    pub fn last_change_views(&self) -> &BTreeMap<u8, ChangeViewRecord> {
        &self.last_change_views
    }

    pub fn change_view(&self, index: u8) -> Option<&ChangeViewRecord> {
        self.change_views.get(&index)
    }

    pub fn insert_change_view(&mut self, index: u8, record: ChangeViewRecord) {
        self.change_views.insert(index, record);
    }

    /// Validators asking for `view` or higher
    pub fn change_views_reaching(&self, view: u8) -> usize {
        self.change_views
            .values()
            .filter(|r| r.new_view >= view)
            .count()
    }

    /// View this node asked to move to, if it did in this view
    pub fn my_change_view_target(&self) -> Option<u8> {
        let index = self.my_index?;
        self.change_views.get(&index).map(|r| r.new_view)
    }

    pub fn is_view_changing(&self) -> bool {
        self.my_change_view_target()
            .is_some_and(|target| target > self.view)
    }

    /// Preparations for the current view are ignored while asking to leave it
    pub fn rejects_preparations(&self) -> bool {
        self.is_view_changing() && !self.more_than_f_committed()
    }

    /// Remember a payload hash; false if it was seen before
    ///
    /// Holds at most [`MAX_KNOWN_HASHES`], dropping the oldest first.
    pub fn mark_known(&mut self, hash: Hash) -> bool {
        if !self.known_hashes.insert(hash) {
            return false;
        }
        self.known_order.push_back(hash);
        if self.known_order.len() > MAX_KNOWN_HASHES {
            if let Some(oldest) = self.known_order.pop_front() {
                self.known_hashes.remove(&oldest);
            }
        }
        true
    }

    pub fn candidate_requested(&self) -> bool {
        self.candidate_requested
    }

    pub fn set_candidate_requested(&mut self) {
        self.candidate_requested = true;
    }

    pub fn response_sent(&self) -> bool {
        self.response_sent
    }

    pub fn set_response_sent(&mut self) {
        self.response_sent = true;
    }

    pub fn commit_sent(&self) -> bool {
        self.commit_sent
    }

    pub fn set_commit_sent(&mut self) {
        self.commit_sent = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    pub fn finalized_hash(&self) -> Option<Hash> {
        self.finalized
    }

    pub fn set_finalized(&mut self, block_hash: Hash) {
        self.finalized = Some(block_hash);
    }

    /// Whether a RecoveryMessage from this node would tell a peer anything
    pub fn has_recovery_content(&self) -> bool {
        self.current_proposal().is_some()
            || !self.preparations.is_empty()
            || !self.early_responses.is_empty()
            || !self.commits.is_empty()
            || !self.change_views.is_empty()
            || !self.last_change_views.is_empty()
    }
}
