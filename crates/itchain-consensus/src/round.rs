use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use itchain_core::{Block, Hash, PeerId, RoundId, ViewId};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ConsensusError;
use crate::events::{RoundCompletion, RoundOutcome};
use crate::message::{VoteMessage, VotePhase};
use crate::quorum::QuorumPolicy;

/// Progress of a round. Advances monotonically; `Committed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoundStage {
    PrePrepared,
    Prepared,
    Committed,
}

impl fmt::Display for RoundStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStage::PrePrepared => "pre-prepared",
            RoundStage::Prepared => "prepared",
            RoundStage::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// What a successfully handled vote did to the round.
///
/// `ProposalAccepted` and `Prepared` ask the caller to cast its own
/// `Prepare` and `Commit` vote respectively; the round itself never
/// performs network I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    ProposalAccepted,
    Recorded { votes: usize, threshold: usize },
    Duplicate,
    Prepared,
    Finalized,
}

/// Parameters applied to every round the registry creates
#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Number of peers in the cluster when the round is created
    pub cluster_size: usize,
    /// Time before an unfinished round times out
    pub lifetime: Duration,
}

impl Default for RoundConfig {
    fn default() -> Self {
        RoundConfig {
            cluster_size: 4,
            lifetime: Duration::from_secs(10),
        }
    }
}

struct BoundProposal {
    block: Block,
    hash: Hash,
    sequence: Option<u64>,
}

struct RoundState {
    stage: RoundStage,
    proposal: Option<BoundProposal>,
    prepare_votes: HashMap<PeerId, VoteMessage>,
    commit_votes: HashMap<PeerId, VoteMessage>,
    terminated: bool,
    timer_cancel: Option<oneshot::Sender<()>>,
    completion: Option<oneshot::Sender<RoundCompletion>>,
}

/// Outcome decided under the lock, delivered after it is released
struct PendingCompletion {
    sender: oneshot::Sender<RoundCompletion>,
    completion: RoundCompletion,
}

impl PendingCompletion {
    fn deliver(self) {
        if let Err(completion) = self.sender.send(self.completion) {
            debug!(
                "Completion receiver for round {} is gone, outcome dropped",
                completion.round_id
            );
        }
    }
}

/// State machine for a single agreement round.
///
/// All mutable state sits behind one lock, so tally-then-advance and
/// check-terminated-then-complete are single critical sections. The
/// completion sender is consumed on use, which makes a second delivery
/// impossible.
pub struct ConsensusRound {
    id: RoundId,
    view_id: ViewId,
    quorum: QuorumPolicy,
    lifetime: Duration,
    created_at: Instant,
    state: Mutex<RoundState>,
}

impl ConsensusRound {
    /// Create a round and start its lifetime timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        view_id: ViewId,
        round_id: RoundId,
        initial_block: Option<Block>,
        initial_stage: RoundStage,
        quorum: QuorumPolicy,
        completion: oneshot::Sender<RoundCompletion>,
        lifetime: Duration,
    ) -> Result<Arc<Self>, ConsensusError> {
        if quorum.cluster_size() == 0 {
            return Err(ConsensusError::InvalidRound(format!(
                "round {} created with an empty cluster",
                round_id
            )));
        }
        if initial_stage == RoundStage::Committed {
            return Err(ConsensusError::InvalidRound(format!(
                "round {} cannot start committed",
                round_id
            )));
        }
        if initial_stage == RoundStage::Prepared && initial_block.is_none() {
            return Err(ConsensusError::InvalidRound(format!(
                "round {} cannot be prepared without a block",
                round_id
            )));
        }

        let proposal = match initial_block {
            Some(block) => Some(BoundProposal {
                hash: block.hash()?,
                block,
                sequence: None,
            }),
            None => None,
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();

        let round = Arc::new(ConsensusRound {
            id: round_id,
            view_id,
            quorum,
            lifetime,
            created_at: Instant::now(),
            state: Mutex::new(RoundState {
                stage: initial_stage,
                proposal,
                prepare_votes: HashMap::new(),
                commit_votes: HashMap::new(),
                terminated: false,
                timer_cancel: Some(cancel_tx),
                completion: Some(completion),
            }),
        });

        let timer_round = Arc::clone(&round);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(lifetime) => timer_round.expire().await,
                _ = cancel_rx => {}
            }
        });

        debug!(
            "Started round {} in view {} (threshold {}/{}, lifetime {:?})",
            round.id,
            round.view_id,
            quorum.threshold(),
            quorum.cluster_size(),
            lifetime
        );

        Ok(round)
    }

    pub fn id(&self) -> &RoundId {
        &self.id
    }

    pub fn view_id(&self) -> &ViewId {
        &self.view_id
    }

    pub fn quorum(&self) -> QuorumPolicy {
        self.quorum
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn stage(&self) -> RoundStage {
        self.state.lock().await.stage
    }

    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.terminated
    }

    pub async fn block(&self) -> Option<Block> {
        self.state.lock().await.proposal.as_ref().map(|p| p.block.clone())
    }

    pub async fn block_hash(&self) -> Option<Hash> {
        self.state.lock().await.proposal.as_ref().map(|p| p.hash)
    }

    /// Sequence number of the bound proposal, once a pre-prepare carried one
    pub async fn sequence(&self) -> Option<u64> {
        self.state.lock().await.proposal.as_ref().and_then(|p| p.sequence)
    }

    pub async fn prepare_count(&self) -> usize {
        self.state.lock().await.prepare_votes.len()
    }

    pub async fn commit_count(&self) -> usize {
        self.state.lock().await.commit_votes.len()
    }

    /// Apply one vote to the round
    pub async fn handle_vote(&self, msg: &VoteMessage) -> Result<VoteOutcome, ConsensusError> {
        if msg.round_id() != &self.id || msg.view_id() != &self.view_id {
            warn!("Discarding misrouted vote: {}", msg);
            return Err(ConsensusError::RoundMismatch {
                expected_round: self.id.clone(),
                expected_view: self.view_id.clone(),
                got_round: msg.round_id().clone(),
                got_view: msg.view_id().clone(),
            });
        }
        msg.validate()?;

        let mut state = self.state.lock().await;
        if state.terminated {
            return Err(ConsensusError::RoundTerminated(self.id.clone()));
        }

        match msg.phase() {
            VotePhase::PrePrepare => self.bind_proposal(&mut state, msg),
            VotePhase::Prepare => self.record_prepare(&mut state, msg),
            VotePhase::Commit => {
                let outcome = self.record_commit(&mut state, msg)?;
                if outcome != VoteOutcome::Finalized {
                    return Ok(outcome);
                }

                let block = match state.proposal.as_ref() {
                    Some(proposal) => proposal.block.clone(),
                    None => {
                        return Err(ConsensusError::InvalidRound(format!(
                            "round {} committed without a block",
                            self.id
                        )))
                    }
                };
                let pending = self.finish(&mut state, RoundOutcome::Finalized(block));
                drop(state);

                info!("Round {} finalized", self.id);
                if let Some(pending) = pending {
                    pending.deliver();
                }
                Ok(VoteOutcome::Finalized)
            }
        }
    }

    /// Cancel the round from outside. Delivers `Aborted` only when this call
    /// is what terminated the round; returns whether it did.
    pub async fn terminate(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.terminated {
            return false;
        }

        let pending = self.finish(&mut state, RoundOutcome::Aborted);
        drop(state);

        info!("Round {} aborted", self.id);
        if let Some(pending) = pending {
            pending.deliver();
        }
        true
    }

    async fn expire(&self) {
        let mut state = self.state.lock().await;
        if state.terminated {
            return;
        }

        let pending = self.finish(&mut state, RoundOutcome::TimedOut);
        let stage = state.stage;
        let (prepares, commits) = (state.prepare_votes.len(), state.commit_votes.len());
        drop(state);

        warn!(
            "Round {} timed out after {:?} at stage {} ({} prepares, {} commits, need {})",
            self.id,
            self.lifetime,
            stage,
            prepares,
            commits,
            self.quorum.threshold()
        );
        if let Some(pending) = pending {
            pending.deliver();
        }
    }

    fn bind_proposal(
        &self,
        state: &mut RoundState,
        msg: &VoteMessage,
    ) -> Result<VoteOutcome, ConsensusError> {
        let block = msg.block().ok_or_else(|| {
            ConsensusError::InvalidMessage(format!("pre-prepare without block: {}", msg))
        })?;
        let proposed = block.hash()?;

        if let Some(bound) = state.proposal.as_mut() {
            if bound.hash != proposed {
                error!(
                    "Conflicting proposal for round {} from {}: bound {}, proposed {}",
                    self.id,
                    msg.sender(),
                    bound.hash.short(),
                    proposed.short()
                );
                return Err(ConsensusError::ConflictingProposal {
                    round_id: self.id.clone(),
                    bound: bound.hash,
                    proposed,
                });
            }
            bound.sequence.get_or_insert(msg.sequence());
            return Ok(VoteOutcome::Duplicate);
        }

        state.proposal = Some(BoundProposal {
            block: block.clone(),
            hash: proposed,
            sequence: Some(msg.sequence()),
        });

        debug!(
            "Round {} bound block {} (seq {}) from {}",
            self.id,
            proposed.short(),
            msg.sequence(),
            msg.sender()
        );
        Ok(VoteOutcome::ProposalAccepted)
    }

    fn record_prepare(
        &self,
        state: &mut RoundState,
        msg: &VoteMessage,
    ) -> Result<VoteOutcome, ConsensusError> {
        let Some(proposal) = state.proposal.as_ref() else {
            return Err(ConsensusError::WrongPhase {
                phase: msg.phase(),
                stage: state.stage,
            });
        };
        self.check_sequence(proposal, msg)?;

        if state.prepare_votes.contains_key(msg.sender()) {
            debug!("Duplicate prepare from {} in round {}", msg.sender(), self.id);
            return Ok(VoteOutcome::Duplicate);
        }
        state.prepare_votes.insert(msg.sender().clone(), msg.clone());

        let votes = state.prepare_votes.len();
        if self.quorum.is_reached(votes) && state.stage == RoundStage::PrePrepared {
            state.stage = RoundStage::Prepared;
            info!("Round {} prepared with {} votes", self.id, votes);
            return Ok(VoteOutcome::Prepared);
        }

        Ok(VoteOutcome::Recorded {
            votes,
            threshold: self.quorum.threshold(),
        })
    }

    fn record_commit(
        &self,
        state: &mut RoundState,
        msg: &VoteMessage,
    ) -> Result<VoteOutcome, ConsensusError> {
        if state.stage < RoundStage::Prepared {
            return Err(ConsensusError::WrongPhase {
                phase: msg.phase(),
                stage: state.stage,
            });
        }
        if let Some(proposal) = state.proposal.as_ref() {
            self.check_sequence(proposal, msg)?;
        }

        if state.commit_votes.contains_key(msg.sender()) {
            debug!("Duplicate commit from {} in round {}", msg.sender(), self.id);
            return Ok(VoteOutcome::Duplicate);
        }
        state.commit_votes.insert(msg.sender().clone(), msg.clone());

        let votes = state.commit_votes.len();
        if self.quorum.is_reached(votes) && state.stage == RoundStage::Prepared {
            state.stage = RoundStage::Committed;
            return Ok(VoteOutcome::Finalized);
        }

        Ok(VoteOutcome::Recorded {
            votes,
            threshold: self.quorum.threshold(),
        })
    }

    fn check_sequence(
        &self,
        proposal: &BoundProposal,
        msg: &VoteMessage,
    ) -> Result<(), ConsensusError> {
        match proposal.sequence {
            Some(sequence) if sequence != msg.sequence() => {
                Err(ConsensusError::InvalidMessage(format!(
                    "{} vote for round {} has sequence {}, proposal has {}",
                    msg.phase(),
                    self.id,
                    msg.sequence(),
                    sequence
                )))
            }
            _ => Ok(()),
        }
    }

    /// Mark terminated, cancel the timer and take the completion sender.
    /// Callers check `terminated` first under the same lock.
    fn finish(&self, state: &mut RoundState, outcome: RoundOutcome) -> Option<PendingCompletion> {
        state.terminated = true;

        if let Some(cancel) = state.timer_cancel.take() {
            let _ = cancel.send(());
        }

        match state.completion.take() {
            Some(sender) => Some(PendingCompletion {
                sender,
                completion: RoundCompletion {
                    round_id: self.id.clone(),
                    view_id: self.view_id.clone(),
                    outcome,
                },
            }),
            None => {
                error!(
                    "Round {} tried to deliver a second terminal outcome: {:?}",
                    self.id, outcome
                );
                if cfg!(debug_assertions) {
                    panic!("round {} completed twice", self.id);
                }
                None
            }
        }
    }
}

impl fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusRound")
            .field("id", &self.id)
            .field("view_id", &self.view_id)
            .field("quorum", &self.quorum)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    const VIEW: &str = "view-0";
    const ROUND: &str = "round-1";

    fn test_block(height: u64) -> Block {
        Block::propose(height, Hash::ZERO, 1_000, PeerId::new("peer-0"), Vec::new()).unwrap()
    }

    fn new_round(
        cluster_size: usize,
        lifetime: Duration,
    ) -> (Arc<ConsensusRound>, oneshot::Receiver<RoundCompletion>) {
        let (tx, rx) = oneshot::channel();
        let round = ConsensusRound::new(
            ViewId::new(VIEW),
            RoundId::new(ROUND),
            None,
            RoundStage::PrePrepared,
            QuorumPolicy::new(cluster_size),
            tx,
            lifetime,
        )
        .unwrap();
        (round, rx)
    }

    fn pre_prepare(block: Block) -> VoteMessage {
        VoteMessage::pre_prepare(RoundId::new(ROUND), ViewId::new(VIEW), 1, PeerId::new("peer-0"), block)
    }

    fn vote(phase: VotePhase, sender: usize) -> VoteMessage {
        VoteMessage::vote(
            RoundId::new(ROUND),
            ViewId::new(VIEW),
            1,
            phase,
            PeerId::new(format!("peer-{}", sender)),
        )
        .unwrap()
    }

    async fn prepared_round(
        cluster_size: usize,
    ) -> (Arc<ConsensusRound>, oneshot::Receiver<RoundCompletion>) {
        let (round, rx) = new_round(cluster_size, Duration::from_secs(60));
        round.handle_vote(&pre_prepare(test_block(1))).await.unwrap();
        let threshold = QuorumPolicy::new(cluster_size).threshold();
        for sender in 0..threshold {
            round.handle_vote(&vote(VotePhase::Prepare, sender)).await.unwrap();
        }
        assert_eq!(round.stage().await, RoundStage::Prepared);
        (round, rx)
    }

    #[tokio::test]
    async fn test_new_round_starts_pre_prepared() {
        let (round, _rx) = new_round(4, Duration::from_secs(5));

        assert_eq!(round.id(), &RoundId::new(ROUND));
        assert_eq!(round.view_id(), &ViewId::new(VIEW));
        assert_eq!(round.stage().await, RoundStage::PrePrepared);
        assert!(round.block().await.is_none());
        assert_eq!(round.prepare_count().await, 0);
        assert_eq!(round.commit_count().await, 0);
        assert!(!round.is_terminated().await);
    }

    #[tokio::test]
    async fn test_new_round_rejects_invalid_start() {
        let (tx, _rx) = oneshot::channel();
        let result = ConsensusRound::new(
            ViewId::new(VIEW),
            RoundId::new(ROUND),
            None,
            RoundStage::Prepared,
            QuorumPolicy::new(4),
            tx,
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ConsensusError::InvalidRound(_))));

        let (tx, _rx) = oneshot::channel();
        let result = ConsensusRound::new(
            ViewId::new(VIEW),
            RoundId::new(ROUND),
            Some(test_block(1)),
            RoundStage::Committed,
            QuorumPolicy::new(4),
            tx,
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ConsensusError::InvalidRound(_))));
    }

    #[tokio::test]
    async fn test_prepare_before_proposal_is_wrong_phase() {
        let (round, _rx) = new_round(4, Duration::from_secs(5));

        let result = round.handle_vote(&vote(VotePhase::Prepare, 1)).await;
        assert!(matches!(result, Err(ConsensusError::WrongPhase { .. })));
        assert_eq!(round.prepare_count().await, 0);
    }

    #[tokio::test]
    async fn test_commit_before_prepared_is_wrong_phase() {
        let (round, _rx) = new_round(4, Duration::from_secs(5));
        round.handle_vote(&pre_prepare(test_block(1))).await.unwrap();

        let result = round.handle_vote(&vote(VotePhase::Commit, 1)).await;
        assert!(matches!(
            result,
            Err(ConsensusError::WrongPhase {
                phase: VotePhase::Commit,
                stage: RoundStage::PrePrepared
            })
        ));
        assert_eq!(round.commit_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_prepares_count_once() {
        let (round, _rx) = new_round(4, Duration::from_secs(5));
        round.handle_vote(&pre_prepare(test_block(1))).await.unwrap();

        let first = round.handle_vote(&vote(VotePhase::Prepare, 1)).await.unwrap();
        assert_eq!(first, VoteOutcome::Recorded { votes: 1, threshold: 3 });

        for _ in 0..10 {
            let again = round.handle_vote(&vote(VotePhase::Prepare, 1)).await.unwrap();
            assert_eq!(again, VoteOutcome::Duplicate);
        }

        assert_eq!(round.prepare_count().await, 1);
        assert_eq!(round.stage().await, RoundStage::PrePrepared);
    }

    #[tokio::test]
    async fn test_four_peers_need_three_prepares() {
        let (round, _rx) = new_round(4, Duration::from_secs(5));
        round.handle_vote(&pre_prepare(test_block(1))).await.unwrap();

        round.handle_vote(&vote(VotePhase::Prepare, 1)).await.unwrap();
        round.handle_vote(&vote(VotePhase::Prepare, 2)).await.unwrap();
        assert_eq!(round.stage().await, RoundStage::PrePrepared);

        let outcome = round.handle_vote(&vote(VotePhase::Prepare, 3)).await.unwrap();
        assert_eq!(outcome, VoteOutcome::Prepared);
        assert_eq!(round.stage().await, RoundStage::Prepared);

        // A late fourth prepare is recorded but does not advance again
        let outcome = round.handle_vote(&vote(VotePhase::Prepare, 0)).await.unwrap();
        assert_eq!(outcome, VoteOutcome::Recorded { votes: 4, threshold: 3 });
    }

    #[tokio::test]
    async fn test_seven_peers_need_five_commits() {
        let (round, mut rx) = prepared_round(7).await;

        for sender in 0..4 {
            let outcome = round.handle_vote(&vote(VotePhase::Commit, sender)).await.unwrap();
            assert!(matches!(outcome, VoteOutcome::Recorded { threshold: 5, .. }));
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let outcome = round.handle_vote(&vote(VotePhase::Commit, 4)).await.unwrap();
        assert_eq!(outcome, VoteOutcome::Finalized);
        assert_eq!(round.stage().await, RoundStage::Committed);

        let completion = rx.await.unwrap();
        assert_eq!(completion.round_id, RoundId::new(ROUND));
        assert_eq!(completion.outcome, RoundOutcome::Finalized(test_block(1)));
    }

    #[tokio::test]
    async fn test_conflicting_proposal_keeps_first_block() {
        let (round, _rx) = new_round(4, Duration::from_secs(5));
        let first = test_block(1);
        let second = test_block(2);

        assert_eq!(
            round.handle_vote(&pre_prepare(first.clone())).await.unwrap(),
            VoteOutcome::ProposalAccepted
        );

        let result = round.handle_vote(&pre_prepare(second)).await;
        assert!(matches!(result, Err(ConsensusError::ConflictingProposal { .. })));
        assert_eq!(round.block().await, Some(first.clone()));

        // Re-delivery of the bound proposal is harmless
        assert_eq!(
            round.handle_vote(&pre_prepare(first)).await.unwrap(),
            VoteOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_misrouted_vote_leaves_state_untouched() {
        let (round, _rx) = new_round(4, Duration::from_secs(5));
        round.handle_vote(&pre_prepare(test_block(1))).await.unwrap();

        let other_round = VoteMessage::vote(
            RoundId::new("round-2"),
            ViewId::new(VIEW),
            1,
            VotePhase::Prepare,
            PeerId::new("peer-1"),
        )
        .unwrap();
        let other_view = VoteMessage::vote(
            RoundId::new(ROUND),
            ViewId::new("view-9"),
            1,
            VotePhase::Prepare,
            PeerId::new("peer-1"),
        )
        .unwrap();

        for msg in [other_round, other_view] {
            let result = round.handle_vote(&msg).await;
            assert!(matches!(result, Err(ConsensusError::RoundMismatch { .. })));
        }
        assert_eq!(round.prepare_count().await, 0);
    }

    #[tokio::test]
    async fn test_vote_with_wrong_sequence_is_rejected() {
        let (round, _rx) = new_round(4, Duration::from_secs(5));
        round.handle_vote(&pre_prepare(test_block(1))).await.unwrap();

        let stale = VoteMessage::vote(
            RoundId::new(ROUND),
            ViewId::new(VIEW),
            2,
            VotePhase::Prepare,
            PeerId::new("peer-1"),
        )
        .unwrap();
        let result = round.handle_vote(&stale).await;
        assert!(matches!(result, Err(ConsensusError::InvalidMessage(_))));
        assert_eq!(round.prepare_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_lifetime_and_not_before() {
        let (round, mut rx) = new_round(4, Duration::from_secs(3));
        round.handle_vote(&pre_prepare(test_block(1))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(!round.is_terminated().await);

        let completion = tokio::time::timeout(Duration::from_millis(200), &mut rx)
            .await
            .expect("timeout outcome within margin")
            .unwrap();
        assert_eq!(completion.outcome, RoundOutcome::TimedOut);
        assert!(round.is_terminated().await);

        let result = round.handle_vote(&vote(VotePhase::Prepare, 1)).await;
        assert!(matches!(result, Err(ConsensusError::RoundTerminated(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalized_round_never_times_out() {
        let (round, rx) = prepared_round(4).await;
        for sender in 0..3 {
            round.handle_vote(&vote(VotePhase::Commit, sender)).await.unwrap();
        }

        let completion = rx.await.unwrap();
        assert!(completion.outcome.is_finalized());

        // Well past the lifetime: the timer was cancelled, nothing changes
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(round.stage().await, RoundStage::Committed);
        assert!(!round.terminate().await);
    }

    #[tokio::test]
    async fn test_terminate_aborts_once() {
        let (round, rx) = new_round(4, Duration::from_secs(60));

        assert!(round.terminate().await);
        assert!(!round.terminate().await);

        let completion = rx.await.unwrap();
        assert_eq!(completion.outcome, RoundOutcome::Aborted);

        let result = round.handle_vote(&pre_prepare(test_block(1))).await;
        assert!(matches!(result, Err(ConsensusError::RoundTerminated(_))));
    }

    #[tokio::test]
    async fn test_round_started_with_block_accepts_prepares() {
        let (tx, _rx) = oneshot::channel();
        let block = test_block(3);
        let round = ConsensusRound::new(
            ViewId::new(VIEW),
            RoundId::new(ROUND),
            Some(block.clone()),
            RoundStage::PrePrepared,
            QuorumPolicy::new(4),
            tx,
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(round.block_hash().await, Some(block.hash().unwrap()));
        let outcome = round.handle_vote(&vote(VotePhase::Prepare, 1)).await.unwrap();
        assert!(matches!(outcome, VoteOutcome::Recorded { votes: 1, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_votes_advance_and_complete_once() {
        let cluster_size = 16;
        let (round, rx) = new_round(cluster_size, Duration::from_secs(60));
        round.handle_vote(&pre_prepare(test_block(1))).await.unwrap();

        let prepares = futures_util::future::join_all((0..cluster_size).map(|sender| {
            let round = Arc::clone(&round);
            tokio::spawn(async move { round.handle_vote(&vote(VotePhase::Prepare, sender)).await })
        }))
        .await;
        let advanced = prepares
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(|o| *o == VoteOutcome::Prepared)
            .count();
        assert_eq!(advanced, 1);

        let commits = futures_util::future::join_all((0..cluster_size).map(|sender| {
            let round = Arc::clone(&round);
            tokio::spawn(async move { round.handle_vote(&vote(VotePhase::Commit, sender)).await })
        }))
        .await;

        let mut finalized = 0;
        for result in commits {
            match result.unwrap() {
                Ok(VoteOutcome::Finalized) => finalized += 1,
                Ok(_) | Err(ConsensusError::RoundTerminated(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(finalized, 1);
        assert!(rx.await.unwrap().outcome.is_finalized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_terminate_racing_final_commit_yields_one_outcome() {
        for _ in 0..20 {
            let (round, rx) = prepared_round(4).await;
            round.handle_vote(&vote(VotePhase::Commit, 0)).await.unwrap();
            round.handle_vote(&vote(VotePhase::Commit, 1)).await.unwrap();

            let committer = {
                let round = Arc::clone(&round);
                tokio::spawn(async move { round.handle_vote(&vote(VotePhase::Commit, 2)).await })
            };
            let aborter = {
                let round = Arc::clone(&round);
                tokio::spawn(async move { round.terminate().await })
            };

            let committed = matches!(committer.await.unwrap(), Ok(VoteOutcome::Finalized));
            let aborted = aborter.await.unwrap();
            assert!(committed ^ aborted);

            let completion = rx.await.unwrap();
            assert_eq!(completion.outcome.is_finalized(), committed);
        }
    }
}
