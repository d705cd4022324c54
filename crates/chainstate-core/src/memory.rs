//! In-memory state store.
//!
//! Holds the ledger, sync position, entity versions, latest pointers and
//! checkpoints in RAM. Useful for tests and short-lived indexers that don't
//! need persistence.
//!
//! A transaction takes the store's lock for its whole lifetime. Reads go
//! straight to the committed state; the first write takes a private copy,
//! which `commit` swaps in and dropping discards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::checkpoint::Checkpoint;
use crate::entity::{LatestEntityPointer, VersionedEntity};
use crate::error::IndexerError;
use crate::ledger::BlockLedgerEntry;
use crate::store::{RangeDeletion, StateStore, StateTx};
use crate::sync::SyncPosition;
use crate::types::BlockRange;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    position: Option<SyncPosition>,
    blocks: HashMap<String, BlockLedgerEntry>,
    /// `(entity_id, block_hash)` → version.
    versions: BTreeMap<(String, String), VersionedEntity>,
    latest: BTreeMap<String, LatestEntityPointer>,
    checkpoints: HashMap<String, Checkpoint>,
    next_seq: u64,
}

/// In-memory [`StateStore`]. All data is lost when the process exits.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn begin(&self) -> Result<Box<dyn StateTx>, IndexerError> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryStateTx { guard, work: None }))
    }
}

/// Transaction over a [`MemoryStateStore`].
///
/// Reads see the committed state through the guard until the first write,
/// which takes the private copy.
pub struct MemoryStateTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: Option<MemoryState>,
}

impl MemoryStateTx {
    fn view(&self) -> &MemoryState {
        self.work.as_ref().unwrap_or(&*self.guard)
    }

    fn edit(&mut self) -> &mut MemoryState {
        let Self { guard, work } = self;
        work.get_or_insert_with(|| (**guard).clone())
    }
}

#[async_trait]
impl StateTx for MemoryStateTx {
    async fn sync_position(&mut self) -> Result<Option<SyncPosition>, IndexerError> {
        Ok(self.view().position.clone())
    }

    async fn save_sync_position(&mut self, position: &SyncPosition) -> Result<(), IndexerError> {
        self.edit().position = Some(position.clone());
        Ok(())
    }

    async fn block(&mut self, hash: &str) -> Result<Option<BlockLedgerEntry>, IndexerError> {
        Ok(self.view().blocks.get(hash).cloned())
    }

    async fn save_block(&mut self, entry: &BlockLedgerEntry) -> Result<(), IndexerError> {
        self.edit()
            .blocks
            .insert(entry.block_hash.clone(), entry.clone());
        Ok(())
    }

    async fn blocks_at_height(
        &mut self,
        number: u64,
    ) -> Result<Vec<BlockLedgerEntry>, IndexerError> {
        Ok(self
            .view()
            .blocks
            .values()
            .filter(|b| b.block_number == number)
            .cloned()
            .collect())
    }

    async fn blocks_in_range(
        &mut self,
        range: BlockRange,
    ) -> Result<Vec<BlockLedgerEntry>, IndexerError> {
        let mut blocks: Vec<_> = self
            .view()
            .blocks
            .values()
            .filter(|b| range.contains(b.block_number))
            .cloned()
            .collect();
        blocks.sort_by(|a, b| {
            a.block_number
                .cmp(&b.block_number)
                .then_with(|| a.block_hash.cmp(&b.block_hash))
        });
        Ok(blocks)
    }

    async fn insert_version(&mut self, version: &VersionedEntity) -> Result<u64, IndexerError> {
        let state = self.edit();
        state.next_seq += 1;
        let seq = state.next_seq;
        let mut stored = version.clone();
        stored.seq = seq;
        state.versions.insert(
            (version.entity_id.clone(), version.block_hash.clone()),
            stored,
        );
        Ok(seq)
    }

    async fn version(
        &mut self,
        entity_id: &str,
        block_hash: &str,
    ) -> Result<Option<VersionedEntity>, IndexerError> {
        Ok(self
            .view()
            .versions
            .get(&(entity_id.to_string(), block_hash.to_string()))
            .cloned())
    }

    async fn versions_of(&mut self, entity_id: &str) -> Result<Vec<VersionedEntity>, IndexerError> {
        let mut versions: Vec<_> = self
            .view()
            .versions
            .values()
            .filter(|v| v.entity_id == entity_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| (v.block_number, v.seq));
        Ok(versions)
    }

    async fn set_versions_pruned(
        &mut self,
        block_hash: &str,
        pruned: bool,
    ) -> Result<Vec<String>, IndexerError> {
        let mut ids = Vec::new();
        for v in self.edit().versions.values_mut() {
            if v.block_hash == block_hash {
                v.is_pruned = pruned;
                ids.push(v.entity_id.clone());
            }
        }
        Ok(ids)
    }

    async fn versions_in_range(
        &mut self,
        range: BlockRange,
    ) -> Result<Vec<VersionedEntity>, IndexerError> {
        let mut versions: Vec<_> = self
            .view()
            .versions
            .values()
            .filter(|v| !v.is_pruned && range.contains(v.block_number))
            .cloned()
            .collect();
        versions.sort_by_key(|v| (v.block_number, v.seq));
        Ok(versions)
    }

    async fn latest(
        &mut self,
        entity_id: &str,
    ) -> Result<Option<LatestEntityPointer>, IndexerError> {
        Ok(self.view().latest.get(entity_id).cloned())
    }

    async fn save_latest(&mut self, pointer: &LatestEntityPointer) -> Result<(), IndexerError> {
        self.edit()
            .latest
            .insert(pointer.entity_id.clone(), pointer.clone());
        Ok(())
    }

    async fn remove_latest(&mut self, entity_id: &str) -> Result<(), IndexerError> {
        self.edit().latest.remove(entity_id);
        Ok(())
    }

    async fn all_latest(&mut self) -> Result<Vec<LatestEntityPointer>, IndexerError> {
        Ok(self.view().latest.values().cloned().collect())
    }

    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), IndexerError> {
        self.edit()
            .checkpoints
            .insert(checkpoint.block_hash.clone(), checkpoint.clone());
        Ok(())
    }

    async fn checkpoints(&mut self) -> Result<Vec<Checkpoint>, IndexerError> {
        let mut cps: Vec<_> = self.view().checkpoints.values().cloned().collect();
        cps.sort_by_key(|c| c.block_number);
        Ok(cps)
    }

    async fn delete_checkpoints(&mut self, range: BlockRange) -> Result<u64, IndexerError> {
        let checkpoints = &mut self.edit().checkpoints;
        let before = checkpoints.len();
        checkpoints.retain(|_, c| !range.contains(c.block_number));
        Ok((before - checkpoints.len()) as u64)
    }

    async fn delete_range(&mut self, range: BlockRange) -> Result<RangeDeletion, IndexerError> {
        let mut deleted = RangeDeletion::default();
        let state = self.edit();

        let blocks_before = state.blocks.len();
        state.blocks.retain(|_, b| !range.contains(b.block_number));
        deleted.blocks = (blocks_before - state.blocks.len()) as u64;

        let entity_ids = &mut deleted.entity_ids;
        let versions_before = state.versions.len();
        state.versions.retain(|_, v| {
            let doomed = range.contains(v.block_number);
            if doomed {
                entity_ids.insert(v.entity_id.clone());
            }
            !doomed
        });
        deleted.versions = (versions_before - state.versions.len()) as u64;

        deleted.checkpoints = self.delete_checkpoints(range).await?;
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> Result<(), IndexerError> {
        let MemoryStateTx { mut guard, work } = *self;
        if let Some(work) = work {
            *guard = work;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), IndexerError> {
        Ok(())
    }
}
