//! Reorg detection and resolution.
//!
//! A reorg is detected when a new block's parent is not the block recorded
//! one height below, or when a different live block already sits at the new
//! block's height. Resolution:
//!
//! 1. Walk the new block's ancestry through the ledger until a block on the
//!    recorded chain is found: the fork point.
//! 2. Refuse with [`IndexerError::ReorgTooDeep`] if the fork point is below
//!    the canonical pointer; finalized history is never rewritten.
//! 3. Mark every block above the fork point that is not on the new branch,
//!    and all of its entity versions, pruned. Blocks of the new branch that
//!    an earlier reorg pruned are revived.
//! 4. Recompute the latest pointer of every affected entity.
//! 5. Rewind the indexed pointer to the fork point.
//!
//! All of it runs inside the caller's transaction while the indexer holds
//! its exclusive reorg lock.

use std::collections::{BTreeSet, HashSet};

use crate::entity;
use crate::error::IndexerError;
use crate::handler::EntityKindRegistry;
use crate::ledger::{self, BlockLedgerEntry};
use crate::store::StateTx;
use crate::types::{BlockNotification, BlockPtr, BlockRange};

/// Describes a resolved chain reorganization.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// The block whose arrival triggered resolution.
    pub detected_at: BlockPtr,
    /// Highest block shared by both branches.
    pub fork_point: BlockPtr,
    /// Blocks marked pruned, most recent first.
    pub dropped_blocks: Vec<BlockPtr>,
    /// Previously pruned blocks brought back by the new branch.
    pub revived_blocks: Vec<BlockPtr>,
    /// Indexed blocks rolled back (indexed tip minus fork point).
    pub depth: u64,
    pub reorg_type: ReorgType,
    /// Entities whose latest pointer was recomputed.
    pub affected_entities: Vec<String>,
}

/// Classification of the reorg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// 1–3 indexed blocks replaced.
    ShortReorg,
    /// More than 3 indexed blocks replaced.
    DeepReorg,
    /// Resolved because the reported chain head regressed.
    HeadRegression,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortReorg => write!(f, "short reorg"),
            Self::DeepReorg => write!(f, "deep reorg"),
            Self::HeadRegression => write!(f, "head regression"),
        }
    }
}

/// Returns `true` if `block` does not extend the recorded chain.
pub async fn needs_resolution(
    tx: &mut dyn StateTx,
    block: &BlockNotification,
) -> Result<bool, IndexerError> {
    let Some(pos) = tx.sync_position().await? else {
        return Ok(false);
    };
    if block.hash == pos.initial_indexed.hash {
        return Ok(false);
    }
    if let Some(sibling) = ledger::recorded_block_at(tx, block.number).await? {
        if sibling.block_hash != block.hash {
            return Ok(true);
        }
    }
    let parent = ledger::recorded_hash_at(tx, block.number.saturating_sub(1)).await?;
    Ok(parent.as_deref() != Some(block.parent_hash.as_str()))
}

/// Walk the ancestry of `block` back to the recorded chain.
///
/// Returns the fork point and the new-branch blocks between it and `block`
/// (most recent first).
pub async fn find_fork_point(
    tx: &mut dyn StateTx,
    block: &BlockNotification,
    canonical: u64,
) -> Result<(BlockPtr, Vec<BlockLedgerEntry>), IndexerError> {
    let mut branch = Vec::new();
    let mut cursor = block.parent_hash.clone();
    loop {
        let entry = tx
            .block(&cursor)
            .await?
            .ok_or_else(|| IndexerError::ParentUnknown {
                block_number: block.number,
                parent_hash: cursor.clone(),
            })?;
        if !entry.is_pruned {
            return Ok((entry.ptr(), branch));
        }
        if entry.block_number <= canonical {
            // A pruned block at or below the floor: the branch forks off below it.
            return Err(IndexerError::ReorgTooDeep {
                fork_point: entry.block_number.saturating_sub(1),
                canonical,
            });
        }
        cursor = entry.parent_hash.clone();
        branch.push(entry);
    }
}

/// Resolve the reorg introduced by `block`.
///
/// Leaves the store untouched when the fork point is below the canonical
/// pointer.
pub async fn resolve(
    tx: &mut dyn StateTx,
    registry: &EntityKindRegistry,
    block: &BlockNotification,
    reorg_type: Option<ReorgType>,
) -> Result<ReorgEvent, IndexerError> {
    let mut pos = tx
        .sync_position()
        .await?
        .ok_or_else(|| IndexerError::Other("reorg resolution before sync position exists".into()))?;
    let canonical = pos.latest_canonical.number;

    let (fork_point, branch) = find_fork_point(tx, block, canonical).await?;
    if fork_point.number < canonical {
        tracing::error!(
            fork_point = fork_point.number,
            canonical,
            at = block.number,
            "Reorg below canonical block, halting"
        );
        return Err(IndexerError::ReorgTooDeep {
            fork_point: fork_point.number,
            canonical,
        });
    }

    let mut revive: Vec<BlockLedgerEntry> = branch;
    if let Some(existing) = tx.block(&block.hash).await? {
        if existing.is_pruned {
            revive.insert(0, existing);
        }
    }
    let branch_hashes: HashSet<&str> = revive.iter().map(|b| b.block_hash.as_str()).collect();

    let mut affected = BTreeSet::new();

    let mut dropped = Vec::new();
    for mut orphan in tx.blocks_in_range(BlockRange::above(fork_point.number)).await? {
        if orphan.is_pruned
            || orphan.block_hash == block.hash
            || branch_hashes.contains(orphan.block_hash.as_str())
        {
            continue;
        }
        orphan.is_pruned = true;
        tx.save_block(&orphan).await?;
        affected.extend(tx.set_versions_pruned(&orphan.block_hash, true).await?);
        dropped.push(orphan.ptr());
    }
    dropped.sort_by(|a, b| b.number.cmp(&a.number));

    let mut revived = Vec::new();
    for mut entry in revive {
        entry.is_pruned = false;
        tx.save_block(&entry).await?;
        affected.extend(tx.set_versions_pruned(&entry.block_hash, false).await?);
        revived.push(entry.ptr());
    }

    for entity_id in &affected {
        entity::recompute_latest(tx, registry, entity_id).await?;
    }

    let depth = pos.latest_indexed.number.saturating_sub(fork_point.number);
    pos.rewind_indexed(fork_point.clone());
    tx.save_sync_position(&pos).await?;

    let reorg_type = reorg_type.unwrap_or(if depth <= 3 {
        ReorgType::ShortReorg
    } else {
        ReorgType::DeepReorg
    });
    tracing::warn!(
        depth,
        at = block.number,
        fork_point = fork_point.number,
        dropped = dropped.len(),
        revived = revived.len(),
        entities = affected.len(),
        reorg_type = %reorg_type,
        "Reorg resolved"
    );

    Ok(ReorgEvent {
        detected_at: block.ptr(),
        fork_point,
        dropped_blocks: dropped,
        revived_blocks: revived,
        depth,
        reorg_type,
        affected_entities: affected.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{apply_mutation, get_latest};
    use crate::ledger::{mark_complete, open_block};
    use crate::memory::MemoryStateStore;
    use crate::store::StateStore;
    use crate::sync::SyncPosition;
    use crate::types::EntityMutation;
    use serde_json::json;

    fn b(num: u64, hash: &str, parent: &str) -> BlockNotification {
        BlockNotification {
            number: num,
            hash: hash.into(),
            parent_hash: parent.into(),
            event_count: 0,
        }
    }

    fn registry() -> EntityKindRegistry {
        EntityKindRegistry::builder().kind("Token").build()
    }

    async fn index(tx: &mut dyn StateTx, block: &BlockNotification, writes: &[(&str, i64)]) {
        open_block(tx, block).await.unwrap();
        for (id, value) in writes {
            let m = EntityMutation {
                entity_id: id.to_string(),
                entity_kind: "Token".into(),
                block_hash: block.hash.clone(),
                payload: json!(value),
            };
            apply_mutation(tx, &registry(), &m).await.unwrap();
        }
        mark_complete(tx, &block.hash).await.unwrap();
        let mut pos = tx.sync_position().await.unwrap().unwrap();
        pos.advance_indexed(block.ptr()).unwrap();
        tx.save_sync_position(&pos).await.unwrap();
    }

    /// A(10, canonical) → B(11) → C(12)
    async fn chain(tx: &mut dyn StateTx) {
        tx.save_sync_position(&SyncPosition::new(BlockPtr::new("0xa", 10)))
            .await
            .unwrap();
        index(tx, &b(10, "0xa", "0x9"), &[("x", 10)]).await;
        index(tx, &b(11, "0xb", "0xa"), &[("x", 11), ("only_b", 1)]).await;
        index(tx, &b(12, "0xc", "0xb"), &[("x", 12)]).await;
    }

    #[tokio::test]
    async fn no_reorg_on_normal_chain() {
        let store = MemoryStateStore::new();
        let mut tx = store.begin().await.unwrap();
        chain(tx.as_mut()).await;
        assert!(!needs_resolution(tx.as_mut(), &b(13, "0xd", "0xc")).await.unwrap());
    }

    #[tokio::test]
    async fn sibling_block_triggers_resolution() {
        let store = MemoryStateStore::new();
        let mut tx = store.begin().await.unwrap();
        chain(tx.as_mut()).await;

        let b2 = b(11, "0xb2", "0xa");
        assert!(needs_resolution(tx.as_mut(), &b2).await.unwrap());

        let event = resolve(tx.as_mut(), &registry(), &b2, None).await.unwrap();
        assert_eq!(event.fork_point.number, 10);
        assert_eq!(event.depth, 2);
        assert_eq!(event.reorg_type, ReorgType::ShortReorg);
        assert_eq!(
            event.dropped_blocks.iter().map(|p| p.number).collect::<Vec<_>>(),
            vec![12, 11]
        );

        // B/C versions pruned, latest falls back to A, B-only entity gone.
        assert_eq!(get_latest(tx.as_mut(), "x").await.unwrap().payload, json!(10));
        assert!(get_latest(tx.as_mut(), "only_b").await.is_err());
        assert!(tx.version("x", "0xc").await.unwrap().unwrap().is_pruned);

        let pos = tx.sync_position().await.unwrap().unwrap();
        assert_eq!(pos.latest_indexed.hash, "0xa");
    }

    #[tokio::test]
    async fn unknown_ancestor_is_transient() {
        let store = MemoryStateStore::new();
        let mut tx = store.begin().await.unwrap();
        chain(tx.as_mut()).await;

        let err = resolve(tx.as_mut(), &registry(), &b(13, "0xd2", "0xc2"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::ParentUnknown { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn fork_below_canonical_is_refused() {
        let store = MemoryStateStore::new();
        let mut tx = store.begin().await.unwrap();
        chain(tx.as_mut()).await;
        let mut pos = tx.sync_position().await.unwrap().unwrap();
        pos.advance_canonical(BlockPtr::new("0xb", 11)).unwrap();
        tx.save_sync_position(&pos).await.unwrap();

        let err = resolve(tx.as_mut(), &registry(), &b(11, "0xb2", "0xa"), None)
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        // Nothing was touched.
        let after = tx.sync_position().await.unwrap().unwrap();
        assert_eq!(after, pos);
        assert!(!tx.block("0xb").await.unwrap().unwrap().is_pruned);
        assert_eq!(get_latest(tx.as_mut(), "x").await.unwrap().payload, json!(12));
    }

    #[tokio::test]
    async fn switching_back_revives_pruned_branch() {
        let store = MemoryStateStore::new();
        let mut tx = store.begin().await.unwrap();
        chain(tx.as_mut()).await;

        let b2 = b(11, "0xb2", "0xa");
        resolve(tx.as_mut(), &registry(), &b2, None).await.unwrap();
        index(tx.as_mut(), &b2, &[("x", 110)]).await;

        // The old branch comes back with a new block on top of C.
        let d = b(13, "0xd", "0xc");
        assert!(needs_resolution(tx.as_mut(), &d).await.unwrap());
        let event = resolve(tx.as_mut(), &registry(), &d, None).await.unwrap();
        assert_eq!(event.fork_point.hash, "0xa");
        assert_eq!(event.revived_blocks.len(), 2);
        assert_eq!(event.dropped_blocks, vec![BlockPtr::new("0xb2", 11)]);

        assert_eq!(get_latest(tx.as_mut(), "x").await.unwrap().payload, json!(12));
        assert!(get_latest(tx.as_mut(), "only_b").await.is_ok());
    }
}
