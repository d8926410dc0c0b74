use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use itchain_consensus::{Broadcaster, VoteMessage};
use itchain_core::{PeerId, Transaction};
use itchain_txpool::{TxDispatcher, TxPoolError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What travels between peers of the local cluster
#[derive(Debug)]
pub enum Envelope {
    /// A bincode-encoded vote message
    Vote(Vec<u8>),
    /// Transactions forwarded to the leader
    Transactions(Vec<Transaction>),
}

/// In-process network connecting every peer's inbox.
///
/// Sends are serialized on `wire`, so a message caused by another message
/// is always queued behind it at every recipient.
pub struct LocalNetwork {
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<Envelope>>,
    wire: Mutex<()>,
}

impl LocalNetwork {
    pub fn new(peers: &[PeerId]) -> (Arc<Self>, HashMap<PeerId, mpsc::UnboundedReceiver<Envelope>>) {
        let mut inboxes = HashMap::new();
        let mut receivers = HashMap::new();
        for peer in peers {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(peer.clone(), tx);
            receivers.insert(peer.clone(), rx);
        }

        let network = LocalNetwork {
            inboxes,
            wire: Mutex::new(()),
        };
        (Arc::new(network), receivers)
    }

    /// The handle a single peer sends through
    pub fn link(self: &Arc<Self>, local: PeerId) -> Arc<PeerLink> {
        Arc::new(PeerLink {
            local,
            network: Arc::clone(self),
        })
    }

    fn send(&self, to: &PeerId, envelope: Envelope) -> bool {
        match self.inboxes.get(to) {
            Some(inbox) => inbox.send(envelope).is_ok(),
            None => false,
        }
    }
}

/// One peer's view of the [`LocalNetwork`]
pub struct PeerLink {
    local: PeerId,
    network: Arc<LocalNetwork>,
}

impl Broadcaster for PeerLink {
    fn broadcast(&self, msg: &VoteMessage) {
        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {}: {}", msg, e);
                return;
            }
        };

        let _wire = self
            .network
            .wire
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for peer in self.network.inboxes.keys() {
            if *peer == self.local {
                continue;
            }
            if !self.network.send(peer, Envelope::Vote(bytes.clone())) {
                debug!("Peer {} is gone, dropping {}", peer, msg);
            }
        }
    }
}

impl TxDispatcher for PeerLink {
    fn deliver(&self, recipient: &PeerId, txs: Vec<Transaction>) -> Result<(), TxPoolError> {
        let _wire = self
            .network
            .wire
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.network.send(recipient, Envelope::Transactions(txs)) {
            Ok(())
        } else {
            Err(TxPoolError::Dispatch(format!("peer {} is unreachable", recipient)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itchain_core::{RoundId, TxData, ViewId};
    use itchain_consensus::VotePhase;

    fn peers() -> Vec<PeerId> {
        (0..3).map(|i| PeerId::new(format!("peer-{}", i))).collect()
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let peers = peers();
        let (network, mut inboxes) = LocalNetwork::new(&peers);
        let link = network.link(peers[0].clone());

        let vote = VoteMessage::vote(
            RoundId::new("r"),
            ViewId::new("v"),
            1,
            VotePhase::Prepare,
            peers[0].clone(),
        )
        .unwrap();
        link.broadcast(&vote);

        assert!(inboxes.get_mut(&peers[0]).unwrap().try_recv().is_err());
        for peer in &peers[1..] {
            match inboxes.get_mut(peer).unwrap().try_recv().unwrap() {
                Envelope::Vote(bytes) => {
                    let decoded = VoteMessage::from_bytes(&bytes).unwrap();
                    assert_eq!(decoded.sender(), &peers[0]);
                    assert_eq!(decoded.phase(), VotePhase::Prepare);
                }
                other => panic!("unexpected envelope {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_peer_fails() {
        let peers = peers();
        let (network, mut inboxes) = LocalNetwork::new(&peers);
        let link = network.link(peers[0].clone());
        let tx = Transaction::create(peers[0].clone(), TxData::default(), 1).unwrap();

        link.deliver(&peers[2], vec![tx.clone()]).unwrap();
        assert!(matches!(
            inboxes.get_mut(&peers[2]).unwrap().try_recv(),
            Ok(Envelope::Transactions(txs)) if txs == vec![tx.clone()]
        ));

        let result = link.deliver(&PeerId::new("stranger"), vec![tx]);
        assert!(matches!(result, Err(TxPoolError::Dispatch(_))));
    }
}
