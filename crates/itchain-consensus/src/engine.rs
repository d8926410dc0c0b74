use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use itchain_core::{Block, PeerId, RoundId, ViewId};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::ConsensusError;
use crate::events::{BlockEventSink, RoundCompletion, RoundOutcome};
use crate::message::{VoteMessage, VotePhase};
use crate::net::{leader_for, Broadcaster};
use crate::registry::RoundRegistry;
use crate::round::{ConsensusRound, RoundConfig, RoundStage, VoteOutcome};

/// Configuration for the consensus engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Every peer of the cluster, in leader-rotation order
    pub peers: Vec<PeerId>,
    /// Time before an unfinished round times out
    pub round_lifetime: Duration,
    /// Votes buffered per round while they wait for the round to advance
    pub max_pending_votes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            peers: Vec::new(),
            round_lifetime: Duration::from_secs(10),
            max_pending_votes: 64,
        }
    }
}

/// Drives rounds for one local peer: routes inbound votes, casts and
/// broadcasts the peer's own votes, and buffers early votes.
pub struct ConsensusEngine {
    config: EngineConfig,
    local_peer: PeerId,
    registry: RoundRegistry,
    broadcaster: Arc<dyn Broadcaster>,
    current_view: RwLock<ViewId>,
    /// Votes rejected with `WrongPhase`, replayed once their round advances
    pending: Mutex<HashMap<RoundId, Vec<VoteMessage>>>,
}

impl ConsensusEngine {
    pub fn new(
        config: EngineConfig,
        local_peer: PeerId,
        initial_view: ViewId,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RoundCompletion>), ConsensusError> {
        if config.peers.is_empty() {
            return Err(ConsensusError::InvalidConfig("peer list is empty".to_string()));
        }
        if !config.peers.contains(&local_peer) {
            return Err(ConsensusError::InvalidConfig(format!(
                "local peer {} is not a cluster member",
                local_peer
            )));
        }

        let (registry, completions) = RoundRegistry::new(RoundConfig {
            cluster_size: config.peers.len(),
            lifetime: config.round_lifetime,
        });

        let engine = ConsensusEngine {
            config,
            local_peer,
            registry,
            broadcaster,
            current_view: RwLock::new(initial_view),
            pending: Mutex::new(HashMap::new()),
        };

        Ok((Arc::new(engine), completions))
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn registry(&self) -> &RoundRegistry {
        &self.registry
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.config.peers
    }

    /// Check if we are the leader for a given sequence
    pub fn is_leader(&self, sequence: u64) -> bool {
        leader_for(sequence, &self.config.peers) == Some(&self.local_peer)
    }

    pub async fn current_view(&self) -> ViewId {
        self.current_view.read().await.clone()
    }

    /// Number of buffered votes waiting on a round
    pub async fn pending_votes(&self, round_id: &RoundId) -> usize {
        self.pending.lock().await.get(round_id).map_or(0, Vec::len)
    }

    /// Propose `block` for `sequence` as the local leader.
    ///
    /// The round is created and bound locally before the pre-prepare goes
    /// out, so peers' prepares can never arrive ahead of it here.
    pub async fn propose(
        &self,
        round_id: RoundId,
        sequence: u64,
        block: Block,
    ) -> Result<Arc<ConsensusRound>, ConsensusError> {
        if !self.is_leader(sequence) {
            return Err(ConsensusError::NotLeader);
        }

        let view_id = self.current_view().await;
        let msg = VoteMessage::pre_prepare(
            round_id.clone(),
            view_id.clone(),
            sequence,
            self.local_peer.clone(),
            block,
        );

        let round = self.registry.get_or_create(&round_id, &view_id, None).await?;
        let outcome = round.handle_vote(&msg).await?;

        info!(
            "Proposing round {} (seq {}) in view {}",
            round_id, sequence, view_id
        );
        self.broadcaster.broadcast(&msg);

        let mut queue = VecDeque::new();
        self.follow_ups(&round, &outcome, &mut queue).await;
        self.drive(&round, queue).await;

        Ok(round)
    }

    /// Route one inbound vote.
    ///
    /// A pre-prepare creates its round; any other vote needs a live round and
    /// fails with `RoundNotFound` otherwise. A `WrongPhase` error means the
    /// vote was buffered and will be replayed when the round advances.
    /// Votes from senders outside the cluster are refused before routing.
    pub async fn on_message(&self, msg: VoteMessage) -> Result<VoteOutcome, ConsensusError> {
        msg.validate()?;
        if !self.config.peers.contains(msg.sender()) {
            warn!("Peer {} refused vote from non-member: {}", self.local_peer, msg);
            return Err(ConsensusError::UnknownPeer(msg.sender().clone()));
        }

        let round = match msg.phase() {
            VotePhase::PrePrepare => {
                let current = self.current_view().await;
                if msg.view_id() != &current {
                    return Err(ConsensusError::ViewMismatch {
                        current,
                        got: msg.view_id().clone(),
                    });
                }
                self.registry
                    .get_or_create(msg.round_id(), msg.view_id(), None)
                    .await?
            }
            VotePhase::Prepare | VotePhase::Commit => self.registry.get(msg.round_id()).await?,
        };

        let result = round.handle_vote(&msg).await;

        let mut queue = VecDeque::new();
        match &result {
            Ok(outcome) => self.follow_ups(&round, outcome, &mut queue).await,
            Err(ConsensusError::WrongPhase { .. }) => {
                queue.extend(self.defer(&round, msg).await);
            }
            Err(ConsensusError::ConflictingProposal { .. }) => {
                error!(
                    "Safety alarm on round {}: conflicting proposals observed by {}",
                    round.id(),
                    self.local_peer
                );
            }
            Err(_) => {}
        }
        self.drive(&round, queue).await;

        result
    }

    /// Move to `view_id`, aborting every round of an older view
    pub async fn change_view(&self, view_id: ViewId) -> usize {
        *self.current_view.write().await = view_id.clone();
        info!("Peer {} moved to view {}", self.local_peer, view_id);
        self.registry.terminate_view(&view_id).await
    }

    /// Abort all live rounds
    pub async fn shutdown(&self) -> usize {
        self.registry.terminate_all().await
    }

    /// Consume round completions: drop buffered votes of finished rounds and
    /// hand outcomes to the sink. Runs until the completion stream closes.
    pub async fn run(
        &self,
        mut completions: mpsc::UnboundedReceiver<RoundCompletion>,
        sink: Arc<dyn BlockEventSink>,
    ) {
        while let Some(completion) = completions.recv().await {
            self.pending.lock().await.remove(&completion.round_id);

            match &completion.outcome {
                RoundOutcome::Finalized(block) => {
                    info!(
                        "Peer {} finalized block at height {} in round {}",
                        self.local_peer, block.header.height, completion.round_id
                    );
                    sink.on_block_finalized(&completion.round_id, block);
                }
                outcome => {
                    warn!(
                        "Peer {} gave up round {}: {:?}",
                        self.local_peer, completion.round_id, outcome
                    );
                    sink.on_round_failed(&completion.round_id, outcome);
                }
            }
        }

        debug!("Completion stream for peer {} closed", self.local_peer);
    }

    /// Apply queued votes to `round` until nothing more can progress
    async fn drive(&self, round: &Arc<ConsensusRound>, mut queue: VecDeque<VoteMessage>) {
        while let Some(msg) = queue.pop_front() {
            match round.handle_vote(&msg).await {
                Ok(outcome) => self.follow_ups(round, &outcome, &mut queue).await,
                Err(ConsensusError::WrongPhase { .. }) => {
                    queue.extend(self.defer(round, msg).await);
                }
                Err(ConsensusError::RoundTerminated(_)) => break,
                Err(e) => debug!("Queued vote {} rejected: {}", msg, e),
            }
        }
    }

    /// Cast the local vote a transition calls for, and release buffered
    /// votes the new stage can accept
    async fn follow_ups(
        &self,
        round: &Arc<ConsensusRound>,
        outcome: &VoteOutcome,
        queue: &mut VecDeque<VoteMessage>,
    ) {
        let phase = match outcome {
            VoteOutcome::ProposalAccepted => VotePhase::Prepare,
            VoteOutcome::Prepared => VotePhase::Commit,
            _ => return,
        };

        match self.own_vote(round, phase).await {
            Ok(vote) => {
                self.broadcaster.broadcast(&vote);
                queue.push_back(vote);
            }
            Err(e) => warn!("Could not cast {} for round {}: {}", phase, round.id(), e),
        }

        queue.extend(self.take_pending(round.id()).await);
    }

    async fn own_vote(
        &self,
        round: &ConsensusRound,
        phase: VotePhase,
    ) -> Result<VoteMessage, ConsensusError> {
        let sequence = round.sequence().await.ok_or_else(|| {
            ConsensusError::InvalidRound(format!("round {} has no sequence", round.id()))
        })?;

        VoteMessage::vote(
            round.id().clone(),
            round.view_id().clone(),
            sequence,
            phase,
            self.local_peer.clone(),
        )
    }

    /// Buffer a vote that arrived ahead of its round's stage. Returns the
    /// buffer's contents when the round advanced while the vote was queued.
    async fn defer(&self, round: &ConsensusRound, msg: VoteMessage) -> Vec<VoteMessage> {
        {
            let mut pending = self.pending.lock().await;
            let queued = pending.entry(round.id().clone()).or_default();

            let already = queued
                .iter()
                .any(|q| q.phase() == msg.phase() && q.sender() == msg.sender());
            if !already {
                if queued.len() >= self.config.max_pending_votes {
                    warn!("Vote buffer for round {} full, dropping {}", round.id(), msg);
                    return Vec::new();
                }
                debug!("Buffering early vote {}", msg);
                queued.push(msg.clone());
            }
        }

        // The round may have completed, and its buffer been dropped, while
        // this vote was on its way in
        if round.is_terminated().await {
            self.pending.lock().await.remove(round.id());
            return Vec::new();
        }

        if accepts(round, msg.phase()).await {
            self.take_pending(round.id()).await
        } else {
            Vec::new()
        }
    }

    async fn take_pending(&self, round_id: &RoundId) -> Vec<VoteMessage> {
        self.pending.lock().await.remove(round_id).unwrap_or_default()
    }
}

async fn accepts(round: &ConsensusRound, phase: VotePhase) -> bool {
    match phase {
        VotePhase::PrePrepare => true,
        VotePhase::Prepare => round.block_hash().await.is_some(),
        VotePhase::Commit => round.stage().await >= RoundStage::Prepared,
    }
}
