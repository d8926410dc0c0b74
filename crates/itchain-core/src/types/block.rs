use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hash::{hash_blake3, merkle_root, Hash};
use crate::serialize;
use crate::types::ids::PeerId;
use crate::types::transaction::Transaction;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (0 for genesis)
    pub height: u64,
    /// Hash of the previous block (zeros for genesis)
    pub prev_hash: Hash,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Merkle root of transactions
    pub tx_root: Hash,
    /// Peer that proposed the block
    pub proposer: PeerId,
}

impl BlockHeader {
    pub fn hash(&self) -> Result<Hash, CoreError> {
        let bytes = serialize::to_bytes(self)?;
        Ok(hash_blake3(&bytes))
    }
}

/// A complete block. Consensus binds it to a round and hands it back on
/// finalization without looking inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, txs: Vec<Transaction>) -> Self {
        Block { header, txs }
    }

    /// Assemble a block on top of `prev_hash`, computing the tx root
    pub fn propose(
        height: u64,
        prev_hash: Hash,
        timestamp: u64,
        proposer: PeerId,
        txs: Vec<Transaction>,
    ) -> Result<Self, CoreError> {
        let tx_hashes = txs
            .iter()
            .map(Transaction::hash)
            .collect::<Result<Vec<_>, _>>()?;

        let header = BlockHeader {
            height,
            prev_hash,
            timestamp,
            tx_root: merkle_root(&tx_hashes),
            proposer,
        };

        Ok(Block::new(header, txs))
    }

    /// Genesis block shared by every peer of a cluster
    pub fn genesis() -> Self {
        Block::new(
            BlockHeader {
                height: 0,
                prev_hash: Hash::ZERO,
                timestamp: 0,
                tx_root: Hash::ZERO,
                proposer: PeerId::new("genesis"),
            },
            Vec::new(),
        )
    }

    /// Block hash (hash of header)
    pub fn hash(&self) -> Result<Hash, CoreError> {
        self.header.hash()
    }

    pub fn compute_tx_root(&self) -> Result<Hash, CoreError> {
        let tx_hashes: Result<Vec<Hash>, _> = self.txs.iter().map(|tx| tx.hash()).collect();
        Ok(merkle_root(&tx_hashes?))
    }

    pub fn verify_tx_root(&self) -> Result<bool, CoreError> {
        Ok(self.compute_tx_root()? == self.header.tx_root)
    }
}
