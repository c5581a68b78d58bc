//! Misbehavior detection
//!
//! Violations are counted per validator and conflicting signed messages are
//! kept as evidence. Nothing here removes a validator from the committee;
//! the records are for operators and higher layers.

use chain_core::{BlockIndex, Hash, Timestamp};
use std::collections::{HashMap, VecDeque};

/// Kinds of protocol violation the engine detects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// Sender index outside the committee
    UnknownValidator,
    /// Payload signature does not match the claimed sender
    InvalidWitness,
    /// Message that only the primary may send came from a backup
    UnexpectedSender,
    /// Proposal breaks block rules (version, parent, timestamp)
    InvalidProposal,
    /// Two different PrepareRequests for the same view
    Equivocation,
    /// Two different Commits at the same height
    ConflictingCommit,
    /// Commit signature does not cover the proposal of its view
    InvalidCommitSignature,
    /// ChangeView repeating a view the sender already asked to leave
    ReplayedChangeView,
}

/// Which kind of message was signed twice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleSignKind {
    PrepareRequest,
    Commit,
}

/// Evidence of a validator signing two conflicting messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoubleSignEvidence {
    /// Validator index who double signed
    pub validator_index: u8,
    pub kind: DoubleSignKind,
    pub height: BlockIndex,
    pub view: u8,
    /// Hash of the payload seen first
    pub first: Hash,
    /// Hash of the conflicting payload
    pub second: Hash,
    /// Local time the conflict was noticed
    pub detected_at: Timestamp,
}

/// Tracks validator misbehavior across heights
#[derive(Debug)]
pub struct ViolationTracker {
    counts: HashMap<(u8, ViolationKind), u64>,
    evidence: VecDeque<DoubleSignEvidence>,
    max_evidence: usize,
}

impl Default for ViolationTracker {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ViolationTracker {
    /// Create a tracker retaining at most `max_evidence` double-sign records
    pub fn new(max_evidence: usize) -> Self {
        Self {
            counts: HashMap::new(),
            evidence: VecDeque::new(),
            max_evidence,
        }
    }

    /// Count one violation; returns the validator's total for that kind
    pub fn record(&mut self, validator_index: u8, kind: ViolationKind) -> u64 {
        let count = self.counts.entry((validator_index, kind)).or_insert(0);
        *count += 1;
        *count
    }

    /// Store double-sign evidence, evicting the oldest when full
    pub fn record_double_sign(&mut self, evidence: DoubleSignEvidence) {
        let kind = match evidence.kind {
            DoubleSignKind::PrepareRequest => ViolationKind::Equivocation,
            DoubleSignKind::Commit => ViolationKind::ConflictingCommit,
        };
        self.record(evidence.validator_index, kind);

        if self.max_evidence == 0 {
            return;
        }
        if self.evidence.len() == self.max_evidence {
            self.evidence.pop_front();
        }
        self.evidence.push_back(evidence);
    }

    pub fn count(&self, validator_index: u8, kind: ViolationKind) -> u64 {
        self.counts
            .get(&(validator_index, kind))
            .copied()
            .unwrap_or(0)
    }

    /// All violations recorded against a validator
    pub fn total_for(&self, validator_index: u8) -> u64 {
        self.counts
            .iter()
            .filter(|((index, _), _)| *index == validator_index)
            .map(|(_, count)| count)
            .sum()
    }

    /// All violations of a kind across validators
    pub fn total_of(&self, kind: ViolationKind) -> u64 {
        self.counts
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn evidence(&self) -> impl Iterator<Item = &DoubleSignEvidence> {
        self.evidence.iter()
    }

    /// Drop evidence for heights more than `keep_heights` below `current_height`
    pub fn cleanup_old_records(&mut self, current_height: BlockIndex, keep_heights: u32) {
        let cutoff = current_height.saturating_sub(keep_heights);
        self.evidence.retain(|e| e.height >= cutoff);
    }
}
