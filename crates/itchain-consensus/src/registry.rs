use std::collections::HashMap;
use std::sync::{Arc, Weak};

use itchain_core::{Block, RoundId, ViewId};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::error::ConsensusError;
use crate::events::RoundCompletion;
use crate::quorum::QuorumPolicy;
use crate::round::{ConsensusRound, RoundConfig, RoundStage};

type RoundMap = HashMap<RoundId, Arc<ConsensusRound>>;

/// Owner of every live round, keyed by round id.
///
/// Rounds are only created through [`RoundRegistry::get_or_create`] and leave
/// the map when their completion arrives. The map lock is never held while
/// a round's own lock is taken, so unrelated rounds never wait on each other.
pub struct RoundRegistry {
    rounds: Arc<RwLock<RoundMap>>,
    config: RwLock<RoundConfig>,
    completions: mpsc::UnboundedSender<RoundCompletion>,
}

impl RoundRegistry {
    /// Create a registry; every round's completion is forwarded to the
    /// returned receiver after the round has been evicted.
    pub fn new(config: RoundConfig) -> (Self, mpsc::UnboundedReceiver<RoundCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = RoundRegistry {
            rounds: Arc::new(RwLock::new(HashMap::new())),
            config: RwLock::new(config),
            completions: tx,
        };
        (registry, rx)
    }

    /// Return the live round for `round_id`, creating it when absent.
    ///
    /// Creation happens under the map's write lock, so concurrent callers
    /// always observe the same round.
    pub async fn get_or_create(
        &self,
        round_id: &RoundId,
        view_id: &ViewId,
        initial_block: Option<Block>,
    ) -> Result<Arc<ConsensusRound>, ConsensusError> {
        let config = self.config.read().await.clone();

        let mut rounds = self.rounds.write().await;
        if let Some(existing) = rounds.get(round_id) {
            debug!("Round {} already live, reusing it", round_id);
            return Ok(Arc::clone(existing));
        }

        let (tx, rx) = oneshot::channel();
        let round = ConsensusRound::new(
            view_id.clone(),
            round_id.clone(),
            initial_block,
            RoundStage::PrePrepared,
            QuorumPolicy::new(config.cluster_size),
            tx,
            config.lifetime,
        )?;
        rounds.insert(round_id.clone(), Arc::clone(&round));
        drop(rounds);

        self.spawn_reaper(&round, rx);
        info!("Created round {} in view {}", round_id, view_id);

        Ok(round)
    }

    /// Look up a live round. Never creates one.
    pub async fn get(&self, round_id: &RoundId) -> Result<Arc<ConsensusRound>, ConsensusError> {
        self.rounds
            .read()
            .await
            .get(round_id)
            .cloned()
            .ok_or_else(|| ConsensusError::RoundNotFound(round_id.clone()))
    }

    /// Drop a round from the map. Normally invoked from the completion path;
    /// a round removed before it terminates still runs to its own outcome.
    pub async fn remove(&self, round_id: &RoundId) -> Option<Arc<ConsensusRound>> {
        self.rounds.write().await.remove(round_id)
    }

    pub async fn contains(&self, round_id: &RoundId) -> bool {
        self.rounds.read().await.contains_key(round_id)
    }

    pub async fn len(&self) -> usize {
        self.rounds.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rounds.read().await.is_empty()
    }

    pub async fn round_ids(&self) -> Vec<RoundId> {
        let mut ids: Vec<_> = self.rounds.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Abort every live round that does not belong to `current`.
    /// Returns how many rounds this call aborted.
    pub async fn terminate_view(&self, current: &ViewId) -> usize {
        let stale: Vec<Arc<ConsensusRound>> = self
            .rounds
            .read()
            .await
            .values()
            .filter(|round| round.view_id() != current)
            .cloned()
            .collect();

        let mut aborted = 0;
        for round in stale {
            if round.terminate().await {
                aborted += 1;
            }
        }

        if aborted > 0 {
            info!("Aborted {} rounds outside view {}", aborted, current);
        }
        aborted
    }

    /// Abort every live round, e.g. on shutdown
    pub async fn terminate_all(&self) -> usize {
        let live: Vec<Arc<ConsensusRound>> = self.rounds.read().await.values().cloned().collect();

        let mut aborted = 0;
        for round in live {
            if round.terminate().await {
                aborted += 1;
            }
        }
        aborted
    }

    /// Cluster size for rounds created from now on. Live rounds keep the
    /// quorum they were created with.
    pub async fn set_cluster_size(&self, cluster_size: usize) {
        self.config.write().await.cluster_size = cluster_size;
    }

    pub async fn config(&self) -> RoundConfig {
        self.config.read().await.clone()
    }

    fn spawn_reaper(&self, round: &Arc<ConsensusRound>, rx: oneshot::Receiver<RoundCompletion>) {
        let rounds = Arc::clone(&self.rounds);
        let completions = self.completions.clone();
        let round_id = round.id().clone();
        let weak = Arc::downgrade(round);

        tokio::spawn(async move {
            let completion = rx.await;
            evict(&rounds, &round_id, &weak).await;

            match completion {
                Ok(completion) => {
                    if completions.send(completion).is_err() {
                        debug!("No completion listener for round {}", round_id);
                    }
                }
                Err(_) => warn!("Round {} dropped without an outcome", round_id),
            }
        });
    }
}

/// Remove `round_id` only if the entry is still the round we watched
async fn evict(rounds: &RwLock<RoundMap>, round_id: &RoundId, watched: &Weak<ConsensusRound>) {
    let mut rounds = rounds.write().await;
    let same = rounds
        .get(round_id)
        .is_some_and(|live| std::ptr::eq(Arc::as_ptr(live), watched.as_ptr()));
    if same {
        rounds.remove(round_id);
        debug!("Evicted round {}", round_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RoundOutcome;
    use crate::message::{VoteMessage, VotePhase};
    use itchain_core::{Hash, PeerId};
    use std::time::Duration;

    fn config(cluster_size: usize) -> RoundConfig {
        RoundConfig {
            cluster_size,
            lifetime: Duration::from_secs(30),
        }
    }

    fn ids(round: &str) -> (RoundId, ViewId) {
        (RoundId::new(round), ViewId::new("view-0"))
    }

    fn block() -> Block {
        Block::propose(1, Hash::ZERO, 10, PeerId::new("peer-0"), Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_round_is_not_found() {
        let (registry, _rx) = RoundRegistry::new(config(4));
        let (round_id, _) = ids("round-1");

        let result = registry.get(&round_id).await;
        assert!(matches!(result, Err(ConsensusError::RoundNotFound(_))));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing_round() {
        let (registry, _rx) = RoundRegistry::new(config(4));
        let (round_id, view_id) = ids("round-1");

        let first = registry.get_or_create(&round_id, &view_id, None).await.unwrap();
        let second = registry.get_or_create(&round_id, &view_id, Some(block())).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
        // The existing round is returned untouched
        assert!(second.block().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_yields_one_round() {
        let registry = Arc::new(RoundRegistry::new(config(4)).0);
        let (round_id, view_id) = ids("round-1");

        let handles = (0..32).map(|_| {
            let registry = Arc::clone(&registry);
            let (round_id, view_id) = (round_id.clone(), view_id.clone());
            tokio::spawn(async move { registry.get_or_create(&round_id, &view_id, None).await })
        });
        let rounds: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert!(rounds.iter().all(|r| Arc::ptr_eq(r, &rounds[0])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_finalized_round_is_evicted_before_completion_is_seen() {
        let (registry, mut rx) = RoundRegistry::new(config(1));
        let (round_id, view_id) = ids("round-1");
        let round = registry.get_or_create(&round_id, &view_id, None).await.unwrap();

        let peer = PeerId::new("peer-0");
        round
            .handle_vote(&VoteMessage::pre_prepare(round_id.clone(), view_id.clone(), 1, peer.clone(), block()))
            .await
            .unwrap();
        for phase in [VotePhase::Prepare, VotePhase::Commit] {
            let vote = VoteMessage::vote(round_id.clone(), view_id.clone(), 1, phase, peer.clone()).unwrap();
            round.handle_vote(&vote).await.unwrap();
        }

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.round_id, round_id);
        assert_eq!(completion.outcome, RoundOutcome::Finalized(block()));
        assert!(matches!(
            registry.get(&round_id).await,
            Err(ConsensusError::RoundNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_round_is_evicted() {
        let (registry, mut rx) = RoundRegistry::new(RoundConfig {
            cluster_size: 4,
            lifetime: Duration::from_secs(3),
        });
        let (round_id, view_id) = ids("round-1");
        registry.get_or_create(&round_id, &view_id, Some(block())).await.unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.outcome, RoundOutcome::TimedOut);
        assert!(!registry.contains(&round_id).await);
    }

    #[tokio::test]
    async fn test_terminate_view_aborts_only_stale_rounds() {
        let (registry, mut rx) = RoundRegistry::new(config(4));
        let old_view = ViewId::new("view-0");
        let new_view = ViewId::new("view-1");

        registry.get_or_create(&RoundId::new("a"), &old_view, None).await.unwrap();
        registry.get_or_create(&RoundId::new("b"), &old_view, None).await.unwrap();
        registry.get_or_create(&RoundId::new("c"), &new_view, None).await.unwrap();

        assert_eq!(registry.terminate_view(&new_view).await, 2);

        for _ in 0..2 {
            let completion = rx.recv().await.unwrap();
            assert_eq!(completion.view_id, old_view);
            assert_eq!(completion.outcome, RoundOutcome::Aborted);
        }
        assert_eq!(registry.round_ids().await, vec![RoundId::new("c")]);
        assert_eq!(registry.terminate_view(&new_view).await, 0);
    }

    #[tokio::test]
    async fn test_cluster_size_change_applies_to_new_rounds_only() {
        let (registry, _rx) = RoundRegistry::new(config(4));
        let view_id = ViewId::new("view-0");

        let before = registry.get_or_create(&RoundId::new("a"), &view_id, None).await.unwrap();
        registry.set_cluster_size(7).await;
        let after = registry.get_or_create(&RoundId::new("b"), &view_id, None).await.unwrap();

        assert_eq!(before.quorum().threshold(), 3);
        assert_eq!(after.quorum().threshold(), 5);
        assert_eq!(registry.config().await.cluster_size, 7);
    }

    #[tokio::test]
    async fn test_terminate_all() {
        let (registry, _rx) = RoundRegistry::new(config(4));
        let view_id = ViewId::new("view-0");
        for id in ["a", "b", "c"] {
            registry.get_or_create(&RoundId::new(id), &view_id, None).await.unwrap();
        }

        assert_eq!(registry.terminate_all().await, 3);
        assert_eq!(registry.terminate_all().await, 0);
    }
}
