//! itchain Consensus - PBFT agreement rounds
//!
//! This crate provides the per-round three-phase state machine, the
//! registry that owns concurrently running rounds, the quorum policy, and
//! an engine that drives rounds for a local peer.

pub mod engine;
pub mod error;
pub mod events;
pub mod message;
pub mod net;
pub mod quorum;
pub mod registry;
pub mod round;

pub use engine::{ConsensusEngine, EngineConfig};
pub use error::ConsensusError;
pub use events::{BlockEventSink, RoundCompletion, RoundOutcome};
pub use message::{VoteMessage, VotePhase};
pub use net::{leader_for, Broadcaster};
pub use quorum::QuorumPolicy;
pub use registry::RoundRegistry;
pub use round::{ConsensusRound, RoundConfig, RoundStage, VoteOutcome};
