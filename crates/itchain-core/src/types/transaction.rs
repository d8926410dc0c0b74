use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hash::{hash_blake3, Hash};
use crate::serialize;
use crate::types::ids::PeerId;

/// Client-supplied payload of a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    pub jsonrpc: String,
    /// ID of the icode (smart contract) to invoke
    pub icode_id: String,
    /// Function name inside the icode
    pub function: String,
    pub args: Vec<String>,
    /// Opaque client signature; verified outside consensus
    pub signature: Vec<u8>,
}

/// A transaction waiting in a pool or included in a block.
///
/// The consensus layer never interprets transactions; it only carries
/// them inside blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    pub jsonrpc: String,
    pub icode_id: String,
    pub function: String,
    pub args: Vec<String>,
    pub signature: Vec<u8>,
    /// Peer that accepted the transaction from the client
    pub peer_id: PeerId,
}

#[derive(Serialize)]
struct TxIdPreimage<'a> {
    publisher: &'a PeerId,
    timestamp: u64,
    data: &'a TxData,
    salt: [u8; 16],
}

impl Transaction {
    /// Create a transaction published by `publisher`.
    ///
    /// The id mixes in random salt so identical payloads submitted twice
    /// remain distinct transactions.
    pub fn create(publisher: PeerId, data: TxData, timestamp: u64) -> Result<Self, CoreError> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);

        let id = hash_blake3(&serialize::to_bytes(&TxIdPreimage {
            publisher: &publisher,
            timestamp,
            data: &data,
            salt,
        })?);

        Ok(Transaction {
            id,
            timestamp,
            jsonrpc: data.jsonrpc,
            icode_id: data.icode_id,
            function: data.function,
            args: data.args,
            signature: data.signature,
            peer_id: publisher,
        })
    }

    /// Hash of the full transaction body, used for the block tx root
    pub fn hash(&self) -> Result<Hash, CoreError> {
        Ok(hash_blake3(&serialize::to_bytes(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> TxData {
        TxData {
            jsonrpc: "2.0".to_string(),
            icode_id: "asset-icode".to_string(),
            function: "transfer".to_string(),
            args: vec!["alice".to_string(), "bob".to_string(), "10".to_string()],
            signature: vec![0xde, 0xad],
        }
    }

    #[test]
    fn test_create_copies_payload() {
        let tx = Transaction::create(PeerId::new("peer-1"), sample_data(), 1_000).unwrap();

        assert_eq!(tx.peer_id, PeerId::new("peer-1"));
        assert_eq!(tx.function, "transfer");
        assert_eq!(tx.args.len(), 3);
        assert_eq!(tx.timestamp, 1_000);
    }

    #[test]
    fn test_same_payload_gets_distinct_ids() {
        let a = Transaction::create(PeerId::new("peer-1"), sample_data(), 1_000).unwrap();
        let b = Transaction::create(PeerId::new("peer-1"), sample_data(), 1_000).unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }
}
