pub mod block;
pub mod ids;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use ids::{PeerId, RoundId, ViewId};
pub use transaction::{Transaction, TxData};
