//! itchain Txpool - Pending transactions and leader forwarding
//!
//! Peers collect client transactions here and periodically forward them to
//! the current leader, who packs them into proposed blocks.

pub mod pool;
pub mod transfer;

pub use pool::{PendingTransaction, TxPool, TxPoolConfig, TxPoolError};
pub use transfer::{LeaderRepository, TransferService, TxDispatcher};
