use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use itchain_consensus::{leader_for, ConsensusEngine, ConsensusError, VoteMessage};
use itchain_core::{Block, PeerId, RoundId, Transaction, ViewId};
use itchain_txpool::{LeaderRepository, TransferService, TxPool, TxPoolError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{ChainEvent, ChainLog};
use crate::config::NodeConfig;
use crate::network::{Envelope, LocalNetwork};
use crate::txgen;

/// One cluster member: consensus engine, transaction pool and chain
pub struct Peer {
    id: PeerId,
    silent: bool,
    engine: Arc<ConsensusEngine>,
    pool: Arc<TxPool>,
    leader: Arc<LeaderRepository>,
    transfer: TransferService,
    chain: Arc<ChainLog>,
    /// Transactions taken from the pool for proposals still in flight
    in_flight: Mutex<HashMap<RoundId, Vec<Transaction>>>,
    max_block_txs: usize,
}

impl Peer {
    fn start(
        id: PeerId,
        silent: bool,
        config: &NodeConfig,
        network: &Arc<LocalNetwork>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<(Arc<Self>, Vec<JoinHandle<()>>)> {
        let link = network.link(id.clone());
        let (engine, completions) = ConsensusEngine::new(
            config.engine_config()?,
            id.clone(),
            ViewId::parse(&config.view_id)?,
            link.clone(),
        )?;

        let pool = Arc::new(TxPool::new(config.txpool_config()));
        let leader = Arc::new(LeaderRepository::new());
        let transfer = TransferService::new(id.clone(), pool.clone(), leader.clone(), link);
        let (chain, chain_events) = ChainLog::new(id.clone());
        let chain = Arc::new(chain);

        let peer = Arc::new(Peer {
            id,
            silent,
            engine,
            pool,
            leader,
            transfer,
            chain,
            in_flight: Mutex::new(HashMap::new()),
            max_block_txs: config.max_block_txs,
        });

        let tasks = vec![
            {
                let engine = Arc::clone(&peer.engine);
                let sink = Arc::clone(&peer.chain);
                tokio::spawn(async move { engine.run(completions, sink).await })
            },
            tokio::spawn(Arc::clone(&peer).receive(inbox)),
            tokio::spawn(Arc::clone(&peer).track_chain(chain_events)),
        ];

        Ok((peer, tasks))
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn engine(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<TxPool> {
        &self.pool
    }

    pub fn chain(&self) -> &Arc<ChainLog> {
        &self.chain
    }

    /// Forward the local pool to the current leader
    pub async fn forward_transactions(&self) -> Result<usize, TxPoolError> {
        self.transfer.send_transactions_to_leader().await
    }

    /// Build the next block from the pool and propose it for `sequence`
    pub async fn propose(&self, sequence: u64) -> Result<RoundId> {
        let view_id = self.engine.current_view().await;
        let round_id = RoundId::new(format!("{}:{}", view_id, sequence));

        let txs = self.pool.take_batch(self.max_block_txs).await;
        let block = Block::propose(
            self.chain.height() + 1,
            self.chain.head_hash()?,
            txgen::now_ms(),
            self.id.clone(),
            txs.clone(),
        )?;

        self.in_flight.lock().await.insert(round_id.clone(), txs);
        if let Err(e) = self.engine.propose(round_id.clone(), sequence, block).await {
            self.requeue(&round_id).await;
            return Err(e.into());
        }
        Ok(round_id)
    }

    async fn requeue(&self, round_id: &RoundId) {
        let Some(txs) = self.in_flight.lock().await.remove(round_id) else {
            return;
        };
        if !txs.is_empty() {
            let restored = self.pool.add_all(txs).await;
            info!("Peer {} returned {} txs of round {} to its pool", self.id, restored, round_id);
        }
    }

    async fn receive(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            if self.silent {
                continue;
            }

            match envelope {
                Envelope::Vote(bytes) => {
                    let msg = match VoteMessage::from_bytes(&bytes) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Peer {} dropped undecodable vote: {}", self.id, e);
                            continue;
                        }
                    };
                    match self.engine.on_message(msg).await {
                        Ok(_) | Err(ConsensusError::WrongPhase { .. }) => {}
                        Err(e) => debug!("Peer {} ignored vote: {}", self.id, e),
                    }
                }
                Envelope::Transactions(txs) => {
                    let added = self.pool.add_all(txs).await;
                    debug!("Peer {} pooled {} forwarded txs", self.id, added);
                }
            }
        }
    }

    async fn track_chain(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChainEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChainEvent::Appended { round_id, .. } => {
                    self.in_flight.lock().await.remove(&round_id);
                }
                ChainEvent::Failed { round_id } => self.requeue(&round_id).await,
            }
        }
    }
}

/// Every peer of the configured cluster, wired over a [`LocalNetwork`]
pub struct Cluster {
    config: NodeConfig,
    peer_ids: Vec<PeerId>,
    peers: Vec<Arc<Peer>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let peer_ids = config.peer_ids()?;
        let silent = config.silent_peer_ids()?;

        if silent.len() > config.fault_tolerance() {
            warn!(
                "{} silent peers exceed the {} faults a cluster of {} tolerates; rounds will time out",
                silent.len(),
                config.fault_tolerance(),
                peer_ids.len()
            );
        }

        let (network, mut inboxes) = LocalNetwork::new(&peer_ids);
        let mut peers = Vec::with_capacity(peer_ids.len());
        let mut tasks = Vec::new();
        for id in &peer_ids {
            let inbox = inboxes
                .remove(id)
                .ok_or_else(|| anyhow!("no inbox for peer {}", id))?;
            let (peer, peer_tasks) =
                Peer::start(id.clone(), silent.contains(id), &config, &network, inbox)?;
            peers.push(peer);
            tasks.extend(peer_tasks);
        }

        info!("Started cluster of {} peers ({} silent)", peers.len(), silent.len());
        Ok(Cluster {
            config,
            peer_ids,
            peers,
            tasks,
        })
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn peer(&self, id: &PeerId) -> Option<&Arc<Peer>> {
        self.peers.iter().find(|p| p.id() == id)
    }

    /// Run one sequence: publish transactions, forward them to the leader
    /// and let the leader propose.
    pub async fn step(&self, sequence: u64) -> Result<Option<RoundId>> {
        let leader_id = leader_for(sequence, &self.peer_ids)
            .cloned()
            .ok_or_else(|| anyhow!("cluster has no peers"))?;

        for peer in &self.peers {
            peer.leader.set(leader_id.clone()).await;
        }

        let live: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| !p.is_silent())
            .map(|p| p.id().clone())
            .collect();
        let batch = {
            let mut rng = rand::thread_rng();
            txgen::random_batch(&mut rng, &live, self.config.txs_per_round)?
        };
        for (publisher, tx) in batch {
            if let Some(peer) = self.peer(&publisher) {
                if let Err(e) = peer.pool.add(tx).await {
                    warn!("Peer {} rejected generated tx: {}", publisher, e);
                }
            }
        }

        for peer in self.peers.iter().filter(|p| !p.is_silent()) {
            if let Err(e) = peer.forward_transactions().await {
                warn!("Peer {} could not forward txs: {}", peer.id(), e);
            }
        }
        tokio::task::yield_now().await;

        let leader = self
            .peer(&leader_id)
            .ok_or_else(|| anyhow!("leader {} is not a cluster member", leader_id))?;
        if leader.is_silent() {
            warn!("Leader {} is silent; sequence {} gets no proposal", leader_id, sequence);
            return Ok(None);
        }

        let round_id = leader.propose(sequence).await?;
        Ok(Some(round_id))
    }

    /// Run the configured number of sequences, then wait for open rounds
    /// to settle. Returns every peer's final chain height.
    pub async fn run(&self) -> Result<Vec<(PeerId, u64)>> {
        let interval = Duration::from_millis(self.config.round_interval_ms);

        for sequence in 1..=self.config.blocks {
            match self.step(sequence).await {
                Ok(Some(round_id)) => debug!("Sequence {} proposed as {}", sequence, round_id),
                Ok(None) => {}
                Err(e) => warn!("Sequence {} failed to propose: {}", sequence, e),
            }
            tokio::time::sleep(interval).await;
        }

        self.settle().await;
        Ok(self.heights())
    }

    pub fn heights(&self) -> Vec<(PeerId, u64)> {
        self.peers
            .iter()
            .map(|p| (p.id().clone(), p.chain().height()))
            .collect()
    }

    /// Wait until no peer has a live round, or one round lifetime passes
    async fn settle(&self) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.round_lifetime_ms);

        while tokio::time::Instant::now() < deadline {
            let mut open = 0;
            for peer in &self.peers {
                open += peer.engine().registry().len().await;
            }
            if open == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Abort all live rounds and stop every peer task
    pub async fn shutdown(self) {
        for peer in &self.peers {
            let aborted = peer.engine().shutdown().await;
            if aborted > 0 {
                info!("Peer {} aborted {} rounds on shutdown", peer.id(), aborted);
            }
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::generate_sample_config;

    fn test_config(blocks: u64, silent: &[&str]) -> NodeConfig {
        NodeConfig {
            blocks,
            round_interval_ms: 100,
            round_lifetime_ms: 2_000,
            txs_per_round: 3,
            silent_peers: silent.iter().map(|s| s.to_string()).collect(),
            ..generate_sample_config(4)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_builds_one_chain() {
        let cluster = Cluster::start(test_config(3, &[])).unwrap();
        let heights = cluster.run().await.unwrap();

        assert!(heights.iter().all(|(_, h)| *h == 3), "{:?}", heights);

        let reference = cluster.peers()[0].chain().blocks();
        for peer in cluster.peers() {
            assert_eq!(peer.chain().blocks(), reference);
        }

        // Every generated transaction landed in exactly one block
        let included: usize = reference.iter().map(|b| b.txs.len()).sum();
        let mut pooled = 0;
        for peer in cluster.peers() {
            pooled += peer.pool().size().await;
        }
        assert_eq!(included + pooled, 9);

        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_silent_peer_is_tolerated() {
        // peer-0 leads sequence 4 and never proposes it
        let cluster = Cluster::start(test_config(4, &["peer-0"])).unwrap();
        let heights = cluster.run().await.unwrap();

        for (peer, height) in heights {
            let expected = if peer == PeerId::new("peer-0") { 0 } else { 3 };
            assert_eq!(height, expected, "peer {}", peer);
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_propose_requires_leadership() {
        let cluster = Cluster::start(test_config(1, &[])).unwrap();
        // Sequence 1 belongs to peer-1
        let result = cluster.peers()[0].propose(1).await;
        assert!(result.is_err());
        cluster.shutdown().await;
    }
}
