use std::sync::{PoisonError, RwLock};

use itchain_consensus::{BlockEventSink, RoundOutcome};
use itchain_core::{Block, CoreError, Hash, PeerId, RoundId};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Round results a peer acts on after its sink has seen them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Appended { round_id: RoundId, height: u64 },
    Failed { round_id: RoundId },
}

/// Append-only log of the blocks one peer has finalized
pub struct ChainLog {
    peer: PeerId,
    blocks: RwLock<Vec<Block>>,
    events: mpsc::UnboundedSender<ChainEvent>,
}

impl ChainLog {
    /// Create a log holding only the genesis block
    pub fn new(peer: PeerId) -> (Self, mpsc::UnboundedReceiver<ChainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = ChainLog {
            peer,
            blocks: RwLock::new(vec![Block::genesis()]),
            events: tx,
        };
        (log, rx)
    }

    pub fn height(&self) -> u64 {
        self.read().last().map_or(0, |b| b.header.height)
    }

    /// Hash of the newest block, the parent of the next proposal
    pub fn head_hash(&self) -> Result<Hash, CoreError> {
        match self.read().last() {
            Some(block) => block.hash(),
            None => Ok(Hash::ZERO),
        }
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.read().clone()
    }

    /// Append `block` if it extends the current head
    fn append(&self, block: &Block) -> Result<bool, CoreError> {
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(head) = blocks.last() {
            if block.header.prev_hash != head.hash()? || block.header.height != head.header.height + 1
            {
                return Ok(false);
            }
        }
        blocks.push(block.clone());
        Ok(true)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Block>> {
        self.blocks.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlockEventSink for ChainLog {
    fn on_block_finalized(&self, round_id: &RoundId, block: &Block) {
        match self.append(block) {
            Ok(true) => {
                info!(
                    "Peer {} appended block {} with {} txs",
                    self.peer,
                    block.header.height,
                    block.txs.len()
                );
                let _ = self.events.send(ChainEvent::Appended {
                    round_id: round_id.clone(),
                    height: block.header.height,
                });
            }
            Ok(false) => {
                warn!(
                    "Peer {} skipped block {} of round {}: does not extend head {}",
                    self.peer,
                    block.header.height,
                    round_id,
                    self.height()
                );
                let _ = self.events.send(ChainEvent::Failed {
                    round_id: round_id.clone(),
                });
            }
            Err(e) => warn!("Peer {} could not hash block: {}", self.peer, e),
        }
    }

    fn on_round_failed(&self, round_id: &RoundId, outcome: &RoundOutcome) {
        warn!("Peer {} round {} failed: {:?}", self.peer, round_id, outcome);
        let _ = self.events.send(ChainEvent::Failed {
            round_id: round_id.clone(),
        });
    }
}
