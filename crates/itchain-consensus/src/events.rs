use itchain_core::{Block, RoundId, ViewId};

/// How a round ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Commit quorum reached; the agreed block
    Finalized(Block),
    /// Lifetime elapsed before finalization
    TimedOut,
    /// Cancelled from outside, e.g. at a view change
    Aborted,
}

impl RoundOutcome {
    pub fn is_finalized(&self) -> bool {
        matches!(self, RoundOutcome::Finalized(_))
    }
}

/// Terminal notification delivered exactly once per round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundCompletion {
    pub round_id: RoundId,
    pub view_id: ViewId,
    pub outcome: RoundOutcome,
}

/// Downstream consumer of finalized blocks (persistence, application)
pub trait BlockEventSink: Send + Sync {
    fn on_block_finalized(&self, round_id: &RoundId, block: &Block);

    fn on_round_failed(&self, _round_id: &RoundId, _outcome: &RoundOutcome) {}
}
