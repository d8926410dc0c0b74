use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use itchain_consensus::{EngineConfig, QuorumPolicy};
use itchain_core::PeerId;
use itchain_txpool::TxPoolConfig;
use serde::{Deserialize, Serialize};

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Peer ids in leader-rotation order
    pub peers: Vec<String>,

    /// Peers that drop every inbound message, simulating crashed nodes
    #[serde(default)]
    pub silent_peers: Vec<String>,

    /// View every peer starts in
    pub view_id: String,

    /// Time before an unfinished round times out
    pub round_lifetime_ms: u64,

    /// Delay between consecutive proposals
    pub round_interval_ms: u64,

    /// Number of sequences to run before stopping
    pub blocks: u64,

    /// Block builder max transactions
    pub max_block_txs: usize,

    /// Transactions generated per sequence
    pub txs_per_round: usize,

    /// Transaction pool max size per peer
    pub txpool_max_size: usize,

    /// Votes buffered per round while waiting for the round to advance
    pub max_pending_votes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            peers: Vec::new(),
            silent_peers: Vec::new(),
            view_id: "view-0".to_string(),
            round_lifetime_ms: 3_000,
            round_interval_ms: 500,
            blocks: 10,
            max_block_txs: 100,
            txs_per_round: 5,
            txpool_max_size: 10_000,
            max_pending_votes: 64,
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let peers = self.peer_ids()?;
        if peers.is_empty() {
            bail!("configuration lists no peers");
        }

        let mut unique = peers.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != peers.len() {
            bail!("peer ids must be unique");
        }

        for silent in self.silent_peer_ids()? {
            if !peers.contains(&silent) {
                bail!("silent peer {} is not a cluster member", silent);
            }
        }

        if self.round_lifetime_ms == 0 {
            bail!("round_lifetime_ms must be positive");
        }
        Ok(())
    }

    pub fn peer_ids(&self) -> Result<Vec<PeerId>> {
        Ok(self
            .peers
            .iter()
            .map(|p| PeerId::parse(p))
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub fn silent_peer_ids(&self) -> Result<Vec<PeerId>> {
        Ok(self
            .silent_peers
            .iter()
            .map(|p| PeerId::parse(p))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// How many crashed peers the configured cluster tolerates
    pub fn fault_tolerance(&self) -> usize {
        QuorumPolicy::new(self.peers.len()).max_faulty()
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            peers: self.peer_ids()?,
            round_lifetime: Duration::from_millis(self.round_lifetime_ms),
            max_pending_votes: self.max_pending_votes,
        })
    }

    pub fn txpool_config(&self) -> TxPoolConfig {
        TxPoolConfig {
            max_size: self.txpool_max_size,
            ..Default::default()
        }
    }
}

/// Generate a sample configuration for a cluster of `peers` nodes
pub fn generate_sample_config(peers: usize) -> NodeConfig {
    NodeConfig {
        peers: (0..peers).map(|i| format!("peer-{}", i)).collect(),
        ..Default::default()
    }
}
