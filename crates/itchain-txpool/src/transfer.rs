use std::sync::Arc;

use itchain_core::{PeerId, Transaction};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::pool::{TxPool, TxPoolError};

/// Delivery of a transaction batch to one peer
pub trait TxDispatcher: Send + Sync {
    fn deliver(&self, recipient: &PeerId, txs: Vec<Transaction>) -> Result<(), TxPoolError>;
}

/// Who the local peer currently believes the leader is
#[derive(Default)]
pub struct LeaderRepository {
    leader: RwLock<Option<PeerId>>,
}

impl LeaderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, leader: PeerId) {
        *self.leader.write().await = Some(leader);
    }

    pub async fn get(&self) -> Option<PeerId> {
        self.leader.read().await.clone()
    }

    pub async fn clear(&self) {
        *self.leader.write().await = None;
    }
}

/// Forwards the local pool's contents to the leader
pub struct TransferService {
    local_peer: PeerId,
    pool: Arc<TxPool>,
    leader: Arc<LeaderRepository>,
    dispatcher: Arc<dyn TxDispatcher>,
    /// Serializes forwarding so one batch is never delivered twice
    sending: Mutex<()>,
}

impl TransferService {
    pub fn new(
        local_peer: PeerId,
        pool: Arc<TxPool>,
        leader: Arc<LeaderRepository>,
        dispatcher: Arc<dyn TxDispatcher>,
    ) -> Self {
        TransferService {
            local_peer,
            pool,
            leader,
            dispatcher,
            sending: Mutex::new(()),
        }
    }

    /// Send every pooled transaction to the leader and clear them from the
    /// pool once delivered. Returns the number of transactions sent.
    ///
    /// The leader keeps its own pool; calling this on the leader is a no-op.
    pub async fn send_transactions_to_leader(&self) -> Result<usize, TxPoolError> {
        let _sending = self.sending.lock().await;

        let transactions = self.pool.all().await;
        if transactions.is_empty() {
            return Ok(0);
        }

        let leader = self.leader.get().await.ok_or(TxPoolError::NoLeader)?;
        if leader == self.local_peer {
            debug!("Peer {} is the leader, keeping {} transactions", leader, transactions.len());
            return Ok(0);
        }

        let ids: Vec<_> = transactions.iter().map(|tx| tx.id).collect();
        let count = transactions.len();
        self.dispatcher.deliver(&leader, transactions)?;
        self.pool.remove_committed(&ids).await;

        info!("Sent {} transactions to leader {}", count, leader);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TxPoolConfig;
    use itchain_core::TxData;

    #[derive(Default)]
    struct RecordingDispatcher {
        delivered: std::sync::Mutex<Vec<(PeerId, usize)>>,
        fail: bool,
    }

    impl TxDispatcher for RecordingDispatcher {
        fn deliver(&self, recipient: &PeerId, txs: Vec<Transaction>) -> Result<(), TxPoolError> {
            if self.fail {
                return Err(TxPoolError::Dispatch("link down".to_string()));
            }
            self.delivered.lock().unwrap().push((recipient.clone(), txs.len()));
            Ok(())
        }
    }

    async fn setup(
        fail: bool,
    ) -> (TransferService, Arc<TxPool>, Arc<LeaderRepository>, Arc<RecordingDispatcher>) {
        let pool = Arc::new(TxPool::new(TxPoolConfig::default()));
        let leader = Arc::new(LeaderRepository::new());
        let dispatcher = Arc::new(RecordingDispatcher {
            fail,
            ..Default::default()
        });
        let service = TransferService::new(
            PeerId::new("peer-0"),
            pool.clone(),
            leader.clone(),
            dispatcher.clone(),
        );

        for i in 0..3 {
            let tx = Transaction::create(PeerId::new("peer-0"), TxData::default(), i).unwrap();
            pool.add(tx).await.unwrap();
        }
        (service, pool, leader, dispatcher)
    }

    #[tokio::test]
    async fn test_sends_and_clears() {
        let (service, pool, leader, dispatcher) = setup(false).await;
        leader.set(PeerId::new("peer-1")).await;

        assert_eq!(service.send_transactions_to_leader().await.unwrap(), 3);
        assert_eq!(pool.size().await, 0);
        assert_eq!(
            dispatcher.delivered.lock().unwrap().clone(),
            vec![(PeerId::new("peer-1"), 3)]
        );

        // Nothing left to send
        assert_eq!(service.send_transactions_to_leader().await.unwrap(), 0);
        assert_eq!(dispatcher.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_leader_keeps_pool() {
        let (service, pool, leader, _) = setup(false).await;
        leader.clear().await;

        let result = service.send_transactions_to_leader().await;
        assert!(matches!(result, Err(TxPoolError::NoLeader)));
        assert_eq!(pool.size().await, 3);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_pool() {
        let (service, pool, leader, _) = setup(true).await;
        leader.set(PeerId::new("peer-1")).await;

        let result = service.send_transactions_to_leader().await;
        assert!(matches!(result, Err(TxPoolError::Dispatch(_))));
        assert_eq!(pool.size().await, 3);
    }

    #[tokio::test]
    async fn test_leader_keeps_its_own_pool() {
        let (service, pool, leader, dispatcher) = setup(false).await;
        leader.set(PeerId::new("peer-0")).await;

        assert_eq!(service.send_transactions_to_leader().await.unwrap(), 0);
        assert_eq!(pool.size().await, 3);
        assert!(dispatcher.delivered.lock().unwrap().is_empty());
    }
}
