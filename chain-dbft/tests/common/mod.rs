//! In-memory committee used by the integration tests
//!
//! Every node runs a [`DbftEngine`]; broadcasts are queued and delivered to
//! the other nodes in order. Timers never fire on their own: a test calls
//! [`Cluster::fire_timeout`]. Candidate requests are answered immediately once
//! the network is quiet.

#![allow(dead_code)]

use bytes::Bytes;
use chain_core::{Block, BlockIndex, Hash, KeyPair, SealedBlock, Timestamp};
use chain_dbft::*;
use futures::future::BoxFuture;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

pub const NETWORK: u32 = 0x7E57_0001;
pub const GENESIS_TIMESTAMP: Timestamp = 1_000;
pub const START_TIME: Timestamp = 10_000;

/// Route engine logs to the test output; `RUST_LOG=chain_dbft=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn keypairs(n: usize) -> Vec<KeyPair> {
    (0..n)
        .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
        .collect()
}

pub fn genesis_hash() -> Hash {
    Hash::new([0xAB; 32])
}

pub fn config() -> DbftConfig {
    DbftConfig::new(NETWORK, 1_000)
}

/// Block producer whose verdict on proposals can be changed by the test
pub struct TestProducer {
    verdict: Mutex<CandidateVerdict>,
}

impl TestProducer {
    pub fn new() -> Self {
        Self {
            verdict: Mutex::new(CandidateVerdict::Accept),
        }
    }

    pub fn set_verdict(&self, verdict: CandidateVerdict) {
        *self.verdict.lock().unwrap() = verdict;
    }
}

impl BlockProducer for TestProducer {
    fn produce_candidate(
        &self,
        _height: BlockIndex,
        _view: u8,
    ) -> BoxFuture<'static, ConsensusResult<Candidate>> {
        Box::pin(async { Ok(Candidate::new(vec![], START_TIME)) })
    }

    fn verify_candidate(&self, _block: &Block) -> CandidateVerdict {
        *self.verdict.lock().unwrap()
    }
}

pub fn engine_with(keypair: &KeyPair, config: DbftConfig, producer: Arc<TestProducer>) -> DbftEngine {
    DbftEngine::new(
        Arc::new(config),
        Arc::new(KeyPairSigner::new(keypair.clone())),
        producer,
    )
}

pub fn engine(keypair: &KeyPair) -> DbftEngine {
    engine_with(keypair, config(), Arc::new(TestProducer::new()))
}

pub fn round_start(height: BlockIndex, keys: &[KeyPair]) -> RoundStart {
    RoundStart {
        height,
        prev_hash: genesis_hash(),
        prev_timestamp: GENESIS_TIMESTAMP,
        committee: keys.iter().map(KeyPair::public_key).collect(),
    }
}

/// Sign `message` as `keypair` on the test network
pub fn sign(keypair: &KeyPair, message: ConsensusMessage) -> ConsensusPayload {
    ConsensusPayload::sign(message, NETWORK, &KeyPairSigner::new(keypair.clone())).unwrap()
}

pub fn broadcasts(actions: &[Action]) -> Vec<ConsensusPayload> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Broadcast(bytes) => Some(ConsensusPayload::decode(bytes).unwrap()),
            _ => None,
        })
        .collect()
}

pub fn submitted(actions: &[Action]) -> Vec<SealedBlock> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::SubmitBlock(sealed) => Some(sealed.clone()),
            _ => None,
        })
        .collect()
}

pub fn of_type(payloads: &[ConsensusPayload], kind: MessageType) -> Vec<ConsensusPayload> {
    payloads
        .iter()
        .filter(|p| p.message.message_type() == kind)
        .cloned()
        .collect()
}

type Filter = Box<dyn Fn(usize, usize, &ConsensusPayload) -> bool>;

pub struct Node {
    pub engine: DbftEngine,
    pub producer: Arc<TestProducer>,
    pub timer: Option<(BlockIndex, u8)>,
    pub sent: Vec<ConsensusPayload>,
    pub received: Vec<ConsensusPayload>,
    pub blocks: Vec<SealedBlock>,
    pending_candidate: Option<(BlockIndex, u8)>,
}

pub struct Cluster {
    pub keys: Vec<KeyPair>,
    pub nodes: Vec<Node>,
    pub now: Timestamp,
    pub transactions: Vec<Hash>,
    queue: VecDeque<(usize, Bytes)>,
    isolated: HashSet<usize>,
    filter: Option<Filter>,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        init_tracing();
        let keys = keypairs(n);
        let nodes = keys
            .iter()
            .map(|keypair| {
                let producer = Arc::new(TestProducer::new());
                Node {
                    engine: engine_with(keypair, config(), producer.clone()),
                    producer,
                    timer: None,
                    sent: Vec::new(),
                    received: Vec::new(),
                    blocks: Vec::new(),
                    pending_candidate: None,
                }
            })
            .collect();
        Self {
            keys,
            nodes,
            now: START_TIME,
            transactions: vec![Hash::new([0x11; 32]), Hash::new([0x22; 32])],
            queue: VecDeque::new(),
            isolated: HashSet::new(),
            filter: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn engine(&self, index: usize) -> &DbftEngine {
        &self.nodes[index].engine
    }

    pub fn round(&self, index: usize) -> &RoundState {
        self.nodes[index].engine.round().unwrap()
    }

    /// Start `height` on every node without delivering anything
    pub fn start(&mut self, height: BlockIndex) {
        for i in 0..self.len() {
            let actions = self.nodes[i]
                .engine
                .start_round(round_start(height, &self.keys))
                .unwrap();
            self.apply(i, actions);
        }
    }

    /// Cut a node off: nothing is delivered to or from it
    pub fn isolate(&mut self, index: usize) {
        self.isolated.insert(index);
    }

    pub fn reconnect(&mut self, index: usize) {
        self.isolated.remove(&index);
    }

    /// Deliver a payload from `from` to `to` only when `filter` says so
    pub fn set_filter(&mut self, filter: impl Fn(usize, usize, &ConsensusPayload) -> bool + 'static) {
        self.filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    pub fn apply(&mut self, index: usize, actions: Vec<Action>) {
        let node = &mut self.nodes[index];
        for action in actions {
            match action {
                Action::Broadcast(bytes) => {
                    node.sent.push(ConsensusPayload::decode(&bytes).unwrap());
                    self.queue.push_back((index, bytes));
                }
                Action::ScheduleTimeout { height, view, .. } => node.timer = Some((height, view)),
                Action::CancelTimeout => node.timer = None,
                Action::ProduceCandidate { height, view } => {
                    node.pending_candidate = Some((height, view))
                }
                Action::SubmitBlock(sealed) => node.blocks.push(sealed),
            }
        }
    }

    /// Deliver queued payloads and answer candidate requests until quiet
    pub fn run(&mut self) {
        loop {
            if let Some((from, bytes)) = self.queue.pop_front() {
                self.deliver(from, bytes);
                continue;
            }

            let pending = (0..self.len()).find(|i| {
                !self.isolated.contains(i) && self.nodes[*i].pending_candidate.is_some()
            });
            let Some(index) = pending else {
                break;
            };
            let Some((height, view)) = self.nodes[index].pending_candidate.take() else {
                break;
            };
            let candidate = Candidate {
                transaction_hashes: self.transactions.clone(),
                timestamp: self.now,
                nonce: 42,
            };
            let actions = self.nodes[index]
                .engine
                .on_candidate(height, view, Ok(candidate), self.now)
                .unwrap();
            self.apply(index, actions);
        }
    }

    fn deliver(&mut self, from: usize, bytes: Bytes) {
        if self.isolated.contains(&from) {
            return;
        }
        let payload = ConsensusPayload::decode(&bytes).unwrap();
        for to in 0..self.len() {
            if to == from || self.isolated.contains(&to) {
                continue;
            }
            let allowed = self.filter.as_ref().map_or(true, |f| f(from, to, &payload));
            if !allowed {
                continue;
            }
            self.nodes[to].received.push(payload.clone());
            let actions = self.nodes[to].engine.on_payload(&bytes, self.now).unwrap();
            self.apply(to, actions);
        }
    }

    /// Hand raw bytes to one node as if `from` had sent them
    pub fn inject(&mut self, to: usize, payload: &ConsensusPayload) {
        let actions = self.nodes[to]
            .engine
            .on_payload(&payload.encode(), self.now)
            .unwrap();
        self.apply(to, actions);
    }

    /// Fire the node's armed timer and run the network; false if none was armed
    pub fn fire_timeout(&mut self, index: usize) -> bool {
        let Some((height, view)) = self.nodes[index].timer else {
            return false;
        };
        self.now += 1_000;
        let actions = self.nodes[index]
            .engine
            .on_timeout(height, view, self.now)
            .unwrap();
        self.apply(index, actions);
        self.run();
        true
    }

    pub fn request_recovery(&mut self, index: usize) {
        let actions = self.nodes[index].engine.request_recovery(self.now).unwrap();
        self.apply(index, actions);
        self.run();
    }

    pub fn sent_of_type(&self, index: usize, kind: MessageType) -> Vec<ConsensusPayload> {
        of_type(&self.nodes[index].sent, kind)
    }
}
