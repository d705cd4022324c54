//! Versioned ("frothy") entity store.
//!
//! Every mutation produces a new [`VersionedEntity`] keyed by
//! `(entity_id, block_hash)`. Versions above the canonical pointer are
//! *frothy*: a reorg may mark them pruned. A [`LatestEntityPointer`] per
//! entity id names the version that is current as of the indexed tip, so at
//! most one version per id is ever served as "latest".
//!
//! The write path has a single entry point, [`apply_mutation`], which checks
//! the entity-kind registry, inserts the version through [`put_version`]
//! and maintains the latest pointer in the same transaction.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::handler::{EntityKindRegistry, WriteEvent};
use crate::ledger;
use crate::store::StateTx;
use crate::types::{BlockPtr, EntityMutation};

/// One version of an entity, written at one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntity {
    pub entity_id: String,
    /// Logical table name.
    pub entity_kind: String,
    pub block_hash: String,
    pub block_number: u64,
    pub payload: serde_json::Value,
    /// Soft-deleted because its block is on an orphaned branch.
    pub is_pruned: bool,
    /// Write sequence assigned by the store; higher means written later.
    pub seq: u64,
}

impl VersionedEntity {
    pub fn block(&self) -> BlockPtr {
        BlockPtr::new(self.block_hash.clone(), self.block_number)
    }
}

/// Derived index: the version of an entity considered current at the indexed tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestEntityPointer {
    pub entity_id: String,
    pub entity_kind: String,
    pub block_hash: String,
    pub block_number: u64,
}

impl From<&VersionedEntity> for LatestEntityPointer {
    fn from(v: &VersionedEntity) -> Self {
        Self {
            entity_id: v.entity_id.clone(),
            entity_kind: v.entity_kind.clone(),
            block_hash: v.block_hash.clone(),
            block_number: v.block_number,
        }
    }
}

// ─── Write path ───────────────────────────────────────────────────────────────

/// Insert a new version for `mutation`.
///
/// Rejected with [`IndexerError::ParentMismatch`] unless the block's declared
/// parent is the block currently recorded one height below. The initial
/// indexed block has no recorded parent and is exempt.
pub async fn put_version(
    tx: &mut dyn StateTx,
    mutation: &EntityMutation,
) -> Result<VersionedEntity, IndexerError> {
    let block = tx
        .block(&mutation.block_hash)
        .await?
        .ok_or_else(|| IndexerError::UnknownBlock {
            hash: mutation.block_hash.clone(),
        })?;

    if block.is_pruned {
        let recorded = ledger::recorded_hash_at(tx, block.block_number).await?;
        return Err(IndexerError::ParentMismatch {
            block_number: block.block_number,
            expected: recorded.unwrap_or_default(),
            actual: block.block_hash,
        });
    }

    let is_initial = match tx.sync_position().await? {
        Some(pos) => pos.initial_indexed.hash == block.block_hash,
        None => true,
    };
    if !is_initial {
        let recorded = ledger::recorded_hash_at(tx, block.block_number.saturating_sub(1)).await?;
        if recorded.as_deref() != Some(block.parent_hash.as_str()) {
            return Err(IndexerError::ParentMismatch {
                block_number: block.block_number,
                expected: recorded.unwrap_or_default(),
                actual: block.parent_hash,
            });
        }
    }

    let mut version = VersionedEntity {
        entity_id: mutation.entity_id.clone(),
        entity_kind: mutation.entity_kind.clone(),
        block_hash: block.block_hash,
        block_number: block.block_number,
        payload: mutation.payload.clone(),
        is_pruned: false,
        seq: 0,
    };
    version.seq = tx.insert_version(&version).await?;
    Ok(version)
}

/// Single write-path entry point: registry check, version insert and
/// latest-pointer maintenance.
pub async fn apply_mutation(
    tx: &mut dyn StateTx,
    registry: &EntityKindRegistry,
    mutation: &EntityMutation,
) -> Result<WriteEvent, IndexerError> {
    let tracks_latest = registry.tracks_latest(&mutation.entity_kind)?;
    let version = put_version(tx, mutation).await?;

    let mut became_latest = false;
    if tracks_latest {
        let current = tx.latest(&version.entity_id).await?;
        if current.map_or(true, |c| c.block_number <= version.block_number) {
            tx.save_latest(&LatestEntityPointer::from(&version)).await?;
            became_latest = true;
        }
    }

    tracing::debug!(
        entity = %version.entity_id,
        kind = %version.entity_kind,
        block = version.block_number,
        became_latest,
        "entity version written"
    );
    Ok(WriteEvent {
        version,
        became_latest,
    })
}

/// Pick the winner among non-pruned versions.
///
/// Highest block number wins. Two versions at the same height should not
/// exist; if they do, the one on the recorded chain wins, otherwise the one
/// written last. The second value reports whether that tie-break was needed.
pub fn pick_latest(
    candidates: &[VersionedEntity],
    recorded_hash: Option<&str>,
) -> Option<(VersionedEntity, bool)> {
    let top = candidates.iter().map(|v| v.block_number).max()?;
    let at_top: Vec<_> = candidates.iter().filter(|v| v.block_number == top).collect();
    if at_top.len() == 1 {
        return Some((at_top[0].clone(), false));
    }
    let winner = at_top
        .iter()
        .find(|v| Some(v.block_hash.as_str()) == recorded_hash)
        .or_else(|| at_top.iter().max_by_key(|v| v.seq))
        .map(|v| (*v).clone())?;
    Some((winner, true))
}

/// Recompute the latest pointer of one entity from its surviving versions.
///
/// Removes the pointer if no non-pruned version remains.
pub async fn recompute_latest(
    tx: &mut dyn StateTx,
    registry: &EntityKindRegistry,
    entity_id: &str,
) -> Result<Option<LatestEntityPointer>, IndexerError> {
    let live: Vec<_> = tx
        .versions_of(entity_id)
        .await?
        .into_iter()
        .filter(|v| !v.is_pruned)
        .collect();

    let top = match live.iter().map(|v| v.block_number).max() {
        Some(n) => n,
        None => {
            tx.remove_latest(entity_id).await?;
            return Ok(None);
        }
    };
    let recorded = ledger::recorded_hash_at(tx, top).await?;
    let Some((winner, violated)) = pick_latest(&live, recorded.as_deref()) else {
        tx.remove_latest(entity_id).await?;
        return Ok(None);
    };
    if violated {
        tracing::error!(
            entity = entity_id,
            block = top,
            winner = %winner.block_hash,
            "Invariant violation: several live versions at the same height"
        );
    }

    // Kinds that do not track a latest view keep only their versions.
    if !registry.tracks_latest(&winner.entity_kind).unwrap_or(false) {
        tx.remove_latest(entity_id).await?;
        return Ok(None);
    }

    let pointer = LatestEntityPointer::from(&winner);
    tx.save_latest(&pointer).await?;
    Ok(Some(pointer))
}

// ─── Read path ────────────────────────────────────────────────────────────────

/// The version the latest pointer names.
pub async fn get_latest(
    tx: &mut dyn StateTx,
    entity_id: &str,
) -> Result<VersionedEntity, IndexerError> {
    let pointer = tx
        .latest(entity_id)
        .await?
        .ok_or_else(|| IndexerError::NotFound(format!("entity {entity_id}")))?;
    tx.version(entity_id, &pointer.block_hash)
        .await?
        .ok_or_else(|| {
            IndexerError::Storage(format!(
                "latest pointer of {entity_id} names missing version at {}",
                pointer.block_hash
            ))
        })
}

/// The exact version written at `block_hash`. Never a best-effort match.
pub async fn get_at_block(
    tx: &mut dyn StateTx,
    entity_id: &str,
    block_hash: &str,
) -> Result<VersionedEntity, IndexerError> {
    match tx.version(entity_id, block_hash).await? {
        Some(v) if !v.is_pruned => Ok(v),
        _ => Err(IndexerError::NotFound(format!(
            "entity {entity_id} at block {block_hash}"
        ))),
    }
}

/// The entity as seen from `block_hash`: the most recent version on that
/// block's ancestry.
///
/// Walks parent links through the frothy region, then falls back to the
/// highest version at or below the canonical height, where only one chain
/// exists.
pub async fn get_as_of(
    tx: &mut dyn StateTx,
    entity_id: &str,
    block_hash: &str,
) -> Result<VersionedEntity, IndexerError> {
    let start = tx
        .block(block_hash)
        .await?
        .ok_or_else(|| IndexerError::UnknownBlock {
            hash: block_hash.into(),
        })?;
    let canonical = tx
        .sync_position()
        .await?
        .map(|p| p.latest_canonical.number)
        .unwrap_or(0);

    let mut floor = start.block_number;
    let mut cursor = Some(start);
    while let Some(block) = cursor.take() {
        if block.block_number <= canonical {
            floor = block.block_number;
            break;
        }
        if let Some(v) = tx.version(entity_id, &block.block_hash).await? {
            return Ok(v);
        }
        floor = block.block_number.saturating_sub(1);
        cursor = tx.block(&block.parent_hash).await?;
    }

    tx.versions_of(entity_id)
        .await?
        .into_iter()
        .filter(|v| !v.is_pruned && v.block_number <= floor.min(canonical))
        .max_by_key(|v| (v.block_number, v.seq))
        .ok_or_else(|| IndexerError::NotFound(format!("entity {entity_id} as of {block_hash}")))
}
