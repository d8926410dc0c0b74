use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use itchain_core::{serialize, Block, PeerId, RoundId, ViewId};
use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;

/// The three PBFT voting stages a message can belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VotePhase {
    PrePrepare,
    Prepare,
    Commit,
}

impl fmt::Display for VotePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VotePhase::PrePrepare => "pre-prepare",
            VotePhase::Prepare => "prepare",
            VotePhase::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// One peer's vote in one phase of one round.
///
/// Fields are private so the block invariant (present on `PrePrepare`,
/// absent otherwise) holds for every value built through [`VoteMessage::new`].
/// Values decoded from the wire are re-checked with [`VoteMessage::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteMessage {
    round_id: RoundId,
    view_id: ViewId,
    sequence: u64,
    phase: VotePhase,
    sender: PeerId,
    block: Option<Block>,
    /// Unix timestamp in milliseconds
    timestamp: u64,
}

impl VoteMessage {
    pub fn new(
        round_id: RoundId,
        view_id: ViewId,
        sequence: u64,
        phase: VotePhase,
        sender: PeerId,
        block: Option<Block>,
    ) -> Result<Self, ConsensusError> {
        let msg = VoteMessage {
            round_id,
            view_id,
            sequence,
            phase,
            sender,
            block,
            timestamp: current_timestamp_ms(),
        };
        msg.validate()?;
        Ok(msg)
    }

    pub fn pre_prepare(
        round_id: RoundId,
        view_id: ViewId,
        sequence: u64,
        sender: PeerId,
        block: Block,
    ) -> Self {
        VoteMessage {
            round_id,
            view_id,
            sequence,
            phase: VotePhase::PrePrepare,
            sender,
            block: Some(block),
            timestamp: current_timestamp_ms(),
        }
    }

    /// A `Prepare` or `Commit` vote, which never carries a block
    pub fn vote(
        round_id: RoundId,
        view_id: ViewId,
        sequence: u64,
        phase: VotePhase,
        sender: PeerId,
    ) -> Result<Self, ConsensusError> {
        Self::new(round_id, view_id, sequence, phase, sender, None)
    }

    /// Check the block invariant
    pub fn validate(&self) -> Result<(), ConsensusError> {
        match (self.phase, self.block.is_some()) {
            (VotePhase::PrePrepare, false) => Err(ConsensusError::InvalidMessage(format!(
                "pre-prepare for round {} carries no block",
                self.round_id
            ))),
            (VotePhase::Prepare | VotePhase::Commit, true) => {
                Err(ConsensusError::InvalidMessage(format!(
                    "{} vote for round {} carries a block",
                    self.phase, self.round_id
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn round_id(&self) -> &RoundId {
        &self.round_id
    }

    pub fn view_id(&self) -> &ViewId {
        &self.view_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn phase(&self) -> VotePhase {
        self.phase
    }

    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    pub fn block(&self) -> Option<&Block> {
        self.block.as_ref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Wire encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConsensusError> {
        Ok(serialize::to_bytes(self)?)
    }

    /// Decode a frame from the wire and check the block invariant
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConsensusError> {
        let msg: VoteMessage = serialize::from_bytes(bytes)?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn to_json(&self) -> Result<String, ConsensusError> {
        Ok(serialize::to_json(self)?)
    }
}

impl fmt::Display for VoteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} round={} view={} seq={} from={}",
            self.phase, self.round_id, self.view_id, self.sequence, self.sender
        )
    }
}

pub(crate) fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
