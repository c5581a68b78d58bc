//! Async host for the consensus engine
//!
//! [`ConsensusService`] owns a [`DbftEngine`] and serializes every event
//! through one command channel: network payloads, timer expiries and
//! candidates from the block producer. The engine's actions are carried out
//! against the collaborator traits.

use crate::config::DbftConfig;
use crate::engine::{Action, DbftEngine, RoundStart};
use crate::traits::{BlockProducer, Candidate, Ledger, Signer, Transport, ValidatorProvider};
use crate::{ConsensusError, ConsensusResult};
use bytes::Bytes;
use chain_core::{BlockIndex, SealedBlock, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Events processed by the service loop
#[derive(Debug)]
pub enum ServiceCommand {
    /// Encoded payload received from a peer
    Payload { sender: String, data: Bytes },
    /// Round timer expired
    Timeout { height: BlockIndex, view: u8 },
    /// Block producer finished a candidate
    CandidateReady {
        height: BlockIndex,
        view: u8,
        result: ConsensusResult<Candidate>,
    },
    /// Shut the service down
    Stop,
}

/// Cloneable handle for feeding a running service
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<ServiceCommand>,
}

impl ServiceHandle {
    /// Deliver a payload received from `sender`
    pub fn deliver(&self, sender: impl Into<String>, data: Bytes) -> ConsensusResult<()> {
        self.send(ServiceCommand::Payload {
            sender: sender.into(),
            data,
        })
    }

    pub fn stop(&self) -> ConsensusResult<()> {
        self.send(ServiceCommand::Stop)
    }

    fn send(&self, command: ServiceCommand) -> ConsensusResult<()> {
        self.tx
            .send(command)
            .map_err(|_| ConsensusError::ChannelClosed("Consensus service stopped".to_string()))
    }
}

/// External components the service drives
#[derive(Clone)]
pub struct Collaborators {
    pub validators: Arc<dyn ValidatorProvider>,
    pub producer: Arc<dyn BlockProducer>,
    pub ledger: Arc<dyn Ledger>,
    pub signer: Arc<dyn Signer>,
    pub transport: Arc<dyn Transport>,
}

/// Runs one node's consensus until stopped or a fatal error occurs
pub struct ConsensusService {
    engine: DbftEngine,
    collaborators: Collaborators,
    tx: mpsc::UnboundedSender<ServiceCommand>,
    rx: mpsc::UnboundedReceiver<ServiceCommand>,
    timer: Option<JoinHandle<()>>,
}

impl ConsensusService {
    /// Create a service and the handle used to feed it
    pub fn new(config: DbftConfig, collaborators: Collaborators) -> (Self, ServiceHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = DbftEngine::new(
            Arc::new(config),
            collaborators.signer.clone(),
            collaborators.producer.clone(),
        );
        let handle = ServiceHandle { tx: tx.clone() };
        let service = Self {
            engine,
            collaborators,
            tx,
            rx,
            timer: None,
        };
        (service, handle)
    }

    pub fn engine(&self) -> &DbftEngine {
        &self.engine
    }

    /// Process commands until [`ServiceHandle::stop`] or a fatal error
    pub async fn run(mut self) -> ConsensusResult<()> {
        let result = self.run_loop().await;
        self.cancel_timer();
        if let Err(e) = &result {
            error!("Consensus service stopped: {}", e);
        }
        result
    }

    async fn run_loop(&mut self) -> ConsensusResult<()> {
        self.engine.config().validate()?;

        let ledger = &self.collaborators.ledger;
        let height = ledger.current_height().saturating_add(1);
        let start = RoundStart {
            height,
            prev_hash: ledger.current_hash(),
            prev_timestamp: ledger.current_timestamp(),
            committee: self.collaborators.validators.committee_for(height)?,
        };
        let actions = self.engine.start_round(start)?;
        self.execute(actions)?;

        if self.engine.config().recovery_on_start {
            let actions = self.engine.request_recovery(now_millis())?;
            self.execute(actions)?;
        }

        while let Some(command) = self.rx.recv().await {
            let now = now_millis();
            let actions = match command {
                ServiceCommand::Payload { sender, data } => {
                    trace!("Payload of {} bytes from {}", data.len(), sender);
                    self.engine.on_payload(&data, now)?
                }
                ServiceCommand::Timeout { height, view } => {
                    self.engine.on_timeout(height, view, now)?
                }
                ServiceCommand::CandidateReady {
                    height,
                    view,
                    result,
                } => self.engine.on_candidate(height, view, result, now)?,
                ServiceCommand::Stop => {
                    info!("Consensus service stopping");
                    break;
                }
            };
            self.execute(actions)?;
        }
        Ok(())
    }

    fn execute(&mut self, actions: Vec<Action>) -> ConsensusResult<()> {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Broadcast(payload) => self.collaborators.transport.broadcast(payload),
                Action::ScheduleTimeout {
                    height,
                    view,
                    after,
                } => self.schedule_timeout(height, view, after),
                Action::CancelTimeout => self.cancel_timer(),
                Action::ProduceCandidate { height, view } => self.produce_candidate(height, view),
                Action::SubmitBlock(sealed) => queue.extend(self.submit_block(sealed)?),
            }
        }
        Ok(())
    }

    fn schedule_timeout(&mut self, height: BlockIndex, view: u8, after: Duration) {
        self.cancel_timer();
        trace!("Timer for height {} view {} in {:?}", height, view, after);
        let tx = self.tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(ServiceCommand::Timeout { height, view });
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn produce_candidate(&self, height: BlockIndex, view: u8) {
        let candidate = self.collaborators.producer.produce_candidate(height, view);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = candidate.await;
            let _ = tx.send(ServiceCommand::CandidateReady {
                height,
                view,
                result,
            });
        });
    }

    /// Persist a finalized block and enter the next height
    fn submit_block(&mut self, sealed: SealedBlock) -> ConsensusResult<Vec<Action>> {
        let height = sealed.block.index();
        let start = RoundStart {
            height: height.saturating_add(1),
            prev_hash: sealed.block.hash()?,
            prev_timestamp: sealed.block.header.timestamp,
            committee: self.collaborators.validators.committee_for(height.saturating_add(1))?,
        };

        debug!("Submitting block {} to the ledger", height);
        self.collaborators.ledger.submit_finalized_block(sealed)?;
        self.engine.start_round(start)
    }
}

fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
