use itchain_core::{Hash, RoundId, ViewId};
use thiserror::Error;

use crate::message::VotePhase;
use crate::round::RoundStage;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Two different blocks proposed for one round. This is a safety alarm
    /// and must not be retried.
    #[error("Conflicting proposal for round {round_id}: bound {bound}, proposed {proposed}")]
    ConflictingProposal {
        round_id: RoundId,
        bound: Hash,
        proposed: Hash,
    },

    #[error("{phase} vote not accepted at stage {stage}")]
    WrongPhase { phase: VotePhase, stage: RoundStage },

    #[error("Vote for {got_round}/{got_view} routed to round {expected_round}/{expected_view}")]
    RoundMismatch {
        expected_round: RoundId,
        expected_view: ViewId,
        got_round: RoundId,
        got_view: ViewId,
    },

    #[error("Round not found: {0}")]
    RoundNotFound(RoundId),

    #[error("Round already terminated: {0}")]
    RoundTerminated(RoundId),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid round: {0}")]
    InvalidRound(String),

    #[error("Vote for view {got} while current view is {current}")]
    ViewMismatch { current: ViewId, got: ViewId },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Vote from {0}, which is not a cluster member")]
    UnknownPeer(itchain_core::PeerId),

    #[error("Not the current leader")]
    NotLeader,

    #[error("Core error: {0}")]
    Core(#[from] itchain_core::CoreError),
}
