//! Operator recovery commands.
//!
//! These are the only code paths that physically delete ledger entries,
//! versions and checkpoints. They are meant to run while the worker pool is
//! stopped, e.g. after it halted on a reorg below the canonical block.

use crate::entity;
use crate::error::IndexerError;
use crate::handler::EntityKindRegistry;
use crate::ledger;
use crate::queue::JobQueue;
use crate::store::{RangeDeletion, StateStore};
use crate::sync::SyncPosition;
use crate::types::{BlockPtr, BlockRange};

/// What [`reset_to_block`] removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub block: BlockPtr,
    pub deleted: RangeDeletion,
    /// Latest pointers recomputed from surviving versions.
    pub entities_recomputed: usize,
    pub position: SyncPosition,
}

/// Roll the whole store back to block `number`.
///
/// Deletes everything recorded above `number`, recomputes the latest
/// pointers of the entities that lost versions and rewinds every sync
/// pointer above `number` to the recorded block there. Runs in one
/// transaction.
pub async fn reset_to_block(
    store: &dyn StateStore,
    registry: &EntityKindRegistry,
    number: u64,
) -> Result<ResetReport, IndexerError> {
    let mut tx = store.begin().await?;
    let mut pos = tx
        .sync_position()
        .await?
        .ok_or_else(|| IndexerError::NotFound("sync position".into()))?;
    let block = ledger::recorded_block_at(tx.as_mut(), number)
        .await?
        .filter(|b| b.is_complete)
        .ok_or(IndexerError::NoBlockAtHeight {
            block_number: number,
        })?;
    let target = block.ptr();

    let deleted = tx.delete_range(BlockRange::above(number)).await?;
    for entity_id in &deleted.entity_ids {
        entity::recompute_latest(tx.as_mut(), registry, entity_id).await?;
    }

    pos.rewind_to(&target);
    pos.set_checkpoint(tx.checkpoints().await?.last().map(|c| c.block()));
    tx.save_sync_position(&pos).await?;
    tx.commit().await?;

    tracing::info!(
        block = number,
        hash = %target.hash,
        blocks = deleted.blocks,
        versions = deleted.versions,
        checkpoints = deleted.checkpoints,
        entities = deleted.entity_ids.len(),
        "Store reset to block"
    );
    Ok(ResetReport {
        block: target,
        entities_recomputed: deleted.entity_ids.len(),
        deleted,
        position: pos,
    })
}

/// Delete checkpoints recorded for blocks in `start..=end`.
///
/// The checkpoint pointer falls back to the newest checkpoint below `start`.
pub async fn reset_checkpoint_state(
    store: &dyn StateStore,
    start: u64,
    end: u64,
) -> Result<u64, IndexerError> {
    let range = BlockRange::new(start, end);
    if range.is_empty() {
        return Err(IndexerError::Other(format!(
            "invalid block range {start}..={end}"
        )));
    }
    let mut tx = store.begin().await?;
    let deleted = tx.delete_checkpoints(range).await?;

    if let Some(mut pos) = tx.sync_position().await? {
        if pos
            .latest_checkpoint
            .as_ref()
            .is_some_and(|cp| cp.number >= start)
        {
            let fallback = tx
                .checkpoints()
                .await?
                .into_iter()
                .filter(|c| c.block_number < start)
                .last()
                .map(|c| c.block());
            pos.set_checkpoint(fallback);
            tx.save_sync_position(&pos).await?;
        }
    }
    tx.commit().await?;

    tracing::info!(start, end, deleted, "Checkpoint state reset");
    Ok(deleted)
}

/// Drop every queued, running and failed job.
pub async fn reset_job_queue(queue: &JobQueue) -> Result<u64, IndexerError> {
    queue.reset().await
}
