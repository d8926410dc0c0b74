use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use itchain_core::{Hash, Transaction};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Configuration for the transaction pool
#[derive(Debug, Clone)]
pub struct TxPoolConfig {
    /// Maximum number of transactions in the pool
    pub max_size: usize,
    /// Transaction expiry time in milliseconds
    pub expiry_ms: u64,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        TxPoolConfig {
            max_size: 10_000,
            expiry_ms: 3_600_000, // 1 hour
        }
    }
}

/// A pending transaction in the pool
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub tx: Transaction,
    /// Position in arrival order
    pub seq: u64,
    /// Unix millis at which the pool accepted it
    pub added_at: u64,
}

#[derive(Default)]
struct PoolInner {
    by_id: HashMap<Hash, PendingTransaction>,
    /// Arrival order; block proposals drain from the front
    by_arrival: BTreeMap<u64, Hash>,
    next_seq: u64,
}

impl PoolInner {
    fn remove(&mut self, id: &Hash) -> Option<Transaction> {
        let pending = self.by_id.remove(id)?;
        self.by_arrival.remove(&pending.seq);
        Some(pending.tx)
    }
}

/// First-in first-out pool of transactions keyed by transaction id
pub struct TxPool {
    config: TxPoolConfig,
    inner: RwLock<PoolInner>,
}

impl TxPool {
    pub fn new(config: TxPoolConfig) -> Self {
        TxPool {
            config,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    /// Add a transaction to the pool
    pub async fn add(&self, tx: Transaction) -> Result<Hash, TxPoolError> {
        let id = tx.id;
        let mut inner = self.inner.write().await;

        if inner.by_id.contains_key(&id) {
            return Err(TxPoolError::AlreadyExists);
        }
        if inner.by_id.len() >= self.config.max_size {
            return Err(TxPoolError::PoolFull);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_arrival.insert(seq, id);
        inner.by_id.insert(
            id,
            PendingTransaction {
                tx,
                seq,
                added_at: Self::current_timestamp(),
            },
        );

        debug!("Added transaction {} to pool", id.short());
        Ok(id)
    }

    /// Add a batch forwarded by another peer, skipping ones already present
    pub async fn add_all(&self, txs: Vec<Transaction>) -> usize {
        let mut added = 0;
        for tx in txs {
            match self.add(tx).await {
                Ok(_) => added += 1,
                Err(TxPoolError::AlreadyExists) => {}
                Err(e) => {
                    warn!("Dropping forwarded transaction: {}", e);
                    break;
                }
            }
        }
        added
    }

    pub async fn remove(&self, id: &Hash) -> Option<Transaction> {
        self.inner.write().await.remove(id)
    }

    pub async fn get(&self, id: &Hash) -> Option<Transaction> {
        self.inner.read().await.by_id.get(id).map(|p| p.tx.clone())
    }

    pub async fn contains(&self, id: &Hash) -> bool {
        self.inner.read().await.by_id.contains_key(id)
    }

    /// All transactions in arrival order
    pub async fn all(&self) -> Vec<Transaction> {
        let inner = self.inner.read().await;
        inner
            .by_arrival
            .values()
            .filter_map(|id| inner.by_id.get(id).map(|p| p.tx.clone()))
            .collect()
    }

    /// Remove and return up to `max_count` of the oldest transactions
    pub async fn take_batch(&self, max_count: usize) -> Vec<Transaction> {
        let mut inner = self.inner.write().await;
        let ids: Vec<Hash> = inner.by_arrival.values().take(max_count).copied().collect();
        ids.iter().filter_map(|id| inner.remove(id)).collect()
    }

    /// Remove transactions that have been included in a block
    pub async fn remove_committed(&self, ids: &[Hash]) {
        let mut inner = self.inner.write().await;
        for id in ids {
            inner.remove(id);
        }
    }

    /// Remove expired transactions, returning how many were dropped
    pub async fn remove_expired(&self) -> usize {
        let threshold = Self::current_timestamp().saturating_sub(self.config.expiry_ms);
        let mut inner = self.inner.write().await;

        let expired: Vec<Hash> = inner
            .by_id
            .iter()
            .filter(|(_, p)| p.added_at < threshold)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            inner.remove(id);
            warn!("Removed expired transaction {}", id.short());
        }
        expired.len()
    }

    pub async fn size(&self) -> usize {
        self.inner.read().await.by_id.len()
    }
}

/// Transaction pool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TxPoolError {
    #[error("Transaction already exists in pool")]
    AlreadyExists,

    #[error("Transaction pool is full")]
    PoolFull,

    #[error("No leader known to forward transactions to")]
    NoLeader,

    #[error("Delivery failed: {0}")]
    Dispatch(String),
}
