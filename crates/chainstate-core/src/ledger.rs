//! Block ledger — per-block processing progress.
//!
//! Every block the indexer has seen gets one entry keyed by its hash. The
//! entry records how many events the block carries and how many have been
//! applied, which makes it the resume point after a crash: an event job for
//! an index below `processed_event_count` has already been applied.
//!
//! Non-pruned entries form a single chain (at most one per height). That
//! chain is the *recorded chain* the reorg resolver compares new blocks
//! against.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::store::StateTx;
use crate::types::{BlockNotification, BlockPtr};

/// Processing progress of a single block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLedgerEntry {
    pub block_hash: String,
    pub block_number: u64,
    pub parent_hash: String,
    /// Events the block is expected to carry.
    pub event_count: u32,
    /// Events applied so far.
    pub processed_event_count: u32,
    /// `true` iff `processed_event_count == event_count`.
    pub is_complete: bool,
    /// Set when the block was found on an orphaned branch.
    pub is_pruned: bool,
}

impl BlockLedgerEntry {
    pub fn new(block: &BlockNotification) -> Self {
        Self {
            block_hash: block.hash.clone(),
            block_number: block.number,
            parent_hash: block.parent_hash.clone(),
            event_count: block.event_count,
            processed_event_count: 0,
            is_complete: false,
            is_pruned: false,
        }
    }

    pub fn ptr(&self) -> BlockPtr {
        BlockPtr::new(self.block_hash.clone(), self.block_number)
    }

    /// Returns `true` once every expected event has been applied.
    pub fn counts_match(&self) -> bool {
        self.processed_event_count == self.event_count
    }
}

/// Create the ledger entry for `block`.
///
/// An incomplete entry that already exists is returned as-is so processing
/// can resume where it stopped.
pub async fn open_block(
    tx: &mut dyn StateTx,
    block: &BlockNotification,
) -> Result<BlockLedgerEntry, IndexerError> {
    if let Some(existing) = tx.block(&block.hash).await? {
        if existing.is_complete {
            return Err(IndexerError::DuplicateBlock {
                hash: block.hash.clone(),
            });
        }
        return Ok(existing);
    }
    let entry = BlockLedgerEntry::new(block);
    tx.save_block(&entry).await?;
    Ok(entry)
}

/// Count one more processed event for `hash`.
pub async fn record_event(
    tx: &mut dyn StateTx,
    hash: &str,
) -> Result<BlockLedgerEntry, IndexerError> {
    let mut entry = tx
        .block(hash)
        .await?
        .ok_or_else(|| IndexerError::UnknownBlock { hash: hash.into() })?;
    if entry.processed_event_count >= entry.event_count {
        return Err(IndexerError::Other(format!(
            "block {hash} already has all {} events recorded",
            entry.event_count
        )));
    }
    entry.processed_event_count += 1;
    tx.save_block(&entry).await?;
    Ok(entry)
}

/// Flag the block complete. Fails unless every event has been recorded.
pub async fn mark_complete(
    tx: &mut dyn StateTx,
    hash: &str,
) -> Result<BlockLedgerEntry, IndexerError> {
    let mut entry = tx
        .block(hash)
        .await?
        .ok_or_else(|| IndexerError::UnknownBlock { hash: hash.into() })?;
    if !entry.counts_match() {
        return Err(IndexerError::IncompleteBlock {
            hash: hash.into(),
            processed: entry.processed_event_count,
            expected: entry.event_count,
        });
    }
    if !entry.is_complete {
        entry.is_complete = true;
        tx.save_block(&entry).await?;
    }
    Ok(entry)
}

/// The non-pruned block recorded at `number`, if any.
pub async fn recorded_block_at(
    tx: &mut dyn StateTx,
    number: u64,
) -> Result<Option<BlockLedgerEntry>, IndexerError> {
    let mut live: Vec<_> = tx
        .blocks_at_height(number)
        .await?
        .into_iter()
        .filter(|b| !b.is_pruned)
        .collect();
    if live.len() > 1 {
        tracing::error!(
            block = number,
            branches = live.len(),
            "Invariant violation: more than one live block at height"
        );
        // Prefer a fully processed block.
        live.sort_by_key(|b| !b.is_complete);
    }
    Ok(live.into_iter().next())
}

/// Hash of the non-pruned block recorded at `number`.
pub async fn recorded_hash_at(
    tx: &mut dyn StateTx,
    number: u64,
) -> Result<Option<String>, IndexerError> {
    Ok(recorded_block_at(tx, number).await?.map(|b| b.block_hash))
}
