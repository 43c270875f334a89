//! Sync progress bookkeeping.

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

/// Minimal block record sufficient to maintain chain linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightBlock {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

/// Where a chain's sync currently stands.
///
/// `start.number <= finalized.number` always holds, and `current` stays at or
/// below `finalized` for the whole historical phase. `end` is `None` for
/// open-ended indexing; a user `to_block` beyond the finalized tip is
/// represented by a synthetic future block (empty hash, max timestamp).
#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub start: LightBlock,
    pub current: Option<LightBlock>,
    pub finalized: LightBlock,
    pub end: Option<LightBlock>,
}

impl SyncProgress {
    pub fn new(start: LightBlock, finalized: LightBlock, end: Option<LightBlock>) -> Self {
        assert!(
            start.number <= finalized.number,
            "sync start {} is past the finalized block {}",
            start.number,
            finalized.number
        );
        Self {
            start,
            current: None,
            finalized,
            end,
        }
    }

    /// Block number sync has advanced through, or one before `start` when no
    /// window has completed yet.
    pub fn current_number(&self) -> Option<u64> {
        self.current.map(|b| b.number)
    }

    /// Historical sync is complete once `current` has reached the finalized
    /// block (or the user-declared end, whichever is lower).
    pub fn is_finalized(&self) -> bool {
        self.current
            .map(|c| c.number >= self.finalized.number)
            .unwrap_or(false)
    }

    /// The last block the historical phase must process.
    pub fn target_number(&self) -> u64 {
        match &self.end {
            Some(end) => end.number.min(self.finalized.number),
            None => self.finalized.number,
        }
    }

    /// True once the chain has nothing further to produce: the user declared
    /// an end block and sync has passed it.
    pub fn is_ended(&self) -> bool {
        match (&self.end, &self.current) {
            (Some(end), Some(current)) => current.number >= end.number,
            _ => false,
        }
    }
}
