//! Sync position tracker — the indexer's four block pointers.
//!
//! ```text
//!   initial_indexed ≤ latest_canonical ≤ latest_indexed ≤ chain_head
//! ```
//!
//! - `chain_head`: highest block the upstream feed has announced.
//! - `latest_indexed`: highest fully processed block on the recorded chain.
//! - `latest_canonical`: finality floor; blocks at or below are immutable.
//! - `initial_indexed`: where indexing started (or was restored from).
//!
//! The position is a plain value; persistence happens through
//! [`StateTx::save_sync_position`](crate::store::StateTx::save_sync_position)
//! inside the same transaction as the block that moved it.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::BlockPtr;

/// The singleton sync position record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPosition {
    pub chain_head: BlockPtr,
    pub latest_indexed: BlockPtr,
    pub latest_canonical: BlockPtr,
    pub initial_indexed: BlockPtr,
    /// Block of the most recent checkpoint, if any.
    pub latest_checkpoint: Option<BlockPtr>,
}

/// Result of [`SyncPosition::set_chain_head`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadUpdate {
    /// The head moved forward.
    Advanced,
    /// The same head was reported again.
    Unchanged,
    /// The head went backwards or changed hash at the same height.
    Regressed { previous: BlockPtr },
}

impl HeadUpdate {
    pub fn is_regression(&self) -> bool {
        matches!(self, Self::Regressed { .. })
    }
}

impl SyncPosition {
    /// Create a position where all four pointers reference `start`.
    pub fn new(start: BlockPtr) -> Self {
        Self {
            chain_head: start.clone(),
            latest_indexed: start.clone(),
            latest_canonical: start.clone(),
            initial_indexed: start,
            latest_checkpoint: None,
        }
    }

    /// Move the indexed pointer forward. Drags the chain head along if the
    /// indexed block reaches it.
    pub fn advance_indexed(&mut self, ptr: BlockPtr) -> Result<(), IndexerError> {
        if ptr.number < self.latest_indexed.number {
            return Err(IndexerError::OutOfOrder {
                current: self.latest_indexed.number,
                requested: ptr.number,
            });
        }
        if ptr.number >= self.chain_head.number {
            self.chain_head = ptr.clone();
        }
        self.latest_indexed = ptr;
        Ok(())
    }

    /// Move the canonical pointer forward.
    ///
    /// Returns `Ok(true)` if the pointer moved. A lower number is ignored.
    pub fn advance_canonical(&mut self, ptr: BlockPtr) -> Result<bool, IndexerError> {
        if ptr.number > self.latest_indexed.number {
            return Err(IndexerError::BeyondIndexed {
                requested: ptr.number,
                indexed: self.latest_indexed.number,
            });
        }
        if ptr.number <= self.latest_canonical.number {
            return Ok(false);
        }
        self.latest_canonical = ptr;
        Ok(true)
    }

    /// Record the chain head reported by the feed.
    ///
    /// A regressed head is recorded as long as it does not drop below the
    /// indexed pointer; the caller decides whether a reorg must be resolved.
    pub fn set_chain_head(&mut self, ptr: BlockPtr) -> HeadUpdate {
        let previous = self.chain_head.clone();
        if ptr == previous {
            return HeadUpdate::Unchanged;
        }
        let regressed = ptr.number < previous.number
            || (ptr.number == previous.number && ptr.hash != previous.hash);

        if ptr.number >= self.latest_indexed.number {
            self.chain_head = ptr;
        }
        if regressed {
            HeadUpdate::Regressed { previous }
        } else {
            HeadUpdate::Advanced
        }
    }

    /// Rewind the indexed pointer to a fork point during reorg resolution.
    pub(crate) fn rewind_indexed(&mut self, fork_point: BlockPtr) {
        debug_assert!(fork_point.number >= self.latest_canonical.number);
        self.latest_indexed = fork_point;
    }

    /// Rewind every pointer above `ptr.number` to `ptr` (admin recovery only).
    pub fn rewind_to(&mut self, ptr: &BlockPtr) {
        for p in [
            &mut self.chain_head,
            &mut self.latest_indexed,
            &mut self.latest_canonical,
            &mut self.initial_indexed,
        ] {
            if p.number > ptr.number {
                *p = ptr.clone();
            }
        }
        if matches!(&self.latest_checkpoint, Some(cp) if cp.number > ptr.number) {
            self.latest_checkpoint = None;
        }
    }

    pub fn set_checkpoint(&mut self, ptr: Option<BlockPtr>) {
        self.latest_checkpoint = ptr;
    }

    /// Checks the pointer ordering invariant.
    pub fn is_consistent(&self) -> bool {
        self.initial_indexed.number <= self.latest_canonical.number
            && self.latest_canonical.number <= self.latest_indexed.number
            && self.latest_indexed.number <= self.chain_head.number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: u64) -> BlockPtr {
        BlockPtr::new(format!("0x{n}"), n)
    }

    #[test]
    fn advance_indexed_moves_head_along() {
        let mut pos = SyncPosition::new(p(100));
        pos.advance_indexed(p(101)).unwrap();
        assert_eq!(pos.latest_indexed.number, 101);
        assert_eq!(pos.chain_head.number, 101);
        assert!(pos.is_consistent());
    }

    #[test]
    fn advance_indexed_rejects_regression() {
        let mut pos = SyncPosition::new(p(100));
        pos.advance_indexed(p(105)).unwrap();
        let err = pos.advance_indexed(p(104)).unwrap_err();
        assert!(matches!(err, IndexerError::OutOfOrder { current: 105, requested: 104 }));
        assert_eq!(pos.latest_indexed.number, 105);
    }

    #[test]
    fn canonical_cannot_pass_indexed() {
        let mut pos = SyncPosition::new(p(100));
        pos.advance_indexed(p(110)).unwrap();
        assert!(pos.advance_canonical(p(105)).unwrap());
        assert!(!pos.advance_canonical(p(103)).unwrap()); // ignored
        let err = pos.advance_canonical(p(111)).unwrap_err();
        assert!(matches!(err, IndexerError::BeyondIndexed { requested: 111, indexed: 110 }));
        assert_eq!(pos.latest_canonical.number, 105);
    }

    #[test]
    fn head_regression_detected() {
        let mut pos = SyncPosition::new(p(100));
        assert_eq!(pos.set_chain_head(p(120)), HeadUpdate::Advanced);
        assert_eq!(pos.set_chain_head(p(120)), HeadUpdate::Unchanged);

        let update = pos.set_chain_head(BlockPtr::new("0xother", 120));
        assert!(update.is_regression());
        assert_eq!(pos.chain_head.hash, "0xother");

        let update = pos.set_chain_head(p(118));
        assert_eq!(update, HeadUpdate::Regressed { previous: BlockPtr::new("0xother", 120) });
        assert_eq!(pos.chain_head.number, 118);
    }

    #[test]
    fn head_never_drops_below_indexed() {
        let mut pos = SyncPosition::new(p(100));
        pos.advance_indexed(p(110)).unwrap();
        assert!(pos.set_chain_head(p(105)).is_regression());
        assert_eq!(pos.chain_head.number, 110);
        assert!(pos.is_consistent());
    }

    #[test]
    fn rewind_to_resets_pointers_above() {
        let mut pos = SyncPosition::new(p(100));
        pos.advance_indexed(p(120)).unwrap();
        pos.advance_canonical(p(110)).unwrap();
        pos.set_checkpoint(Some(p(110)));

        pos.rewind_to(&p(105));
        assert_eq!(pos.latest_indexed.number, 105);
        assert_eq!(pos.latest_canonical.number, 105);
        assert_eq!(pos.chain_head.number, 105);
        assert_eq!(pos.initial_indexed.number, 100);
        assert!(pos.latest_checkpoint.is_none());
        assert!(pos.is_consistent());
    }
}
