use itchain_core::PeerId;

use crate::message::VoteMessage;

/// Outbound side of the transport. Implementations deliver the vote to
/// every other peer; encoding and retries are theirs to handle.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, msg: &VoteMessage);
}

/// Round-robin leader for a sequence number
pub fn leader_for(sequence: u64, peers: &[PeerId]) -> Option<&PeerId> {
    if peers.is_empty() {
        return None;
    }
    peers.get((sequence % peers.len() as u64) as usize)
}
