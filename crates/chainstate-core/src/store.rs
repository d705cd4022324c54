//! Storage traits.
//!
//! Every mutation of the ledger, the sync position and the versioned entity
//! store goes through a [`StateTx`]. A transaction either commits as a whole
//! or leaves no trace, which is what makes block application all-or-nothing.
//!
//! Implementations: [`MemoryStateStore`](crate::memory::MemoryStateStore)
//! and `SqliteStorage` in `chainstate-storage`.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::entity::{LatestEntityPointer, VersionedEntity};
use crate::error::IndexerError;
use crate::ledger::BlockLedgerEntry;
use crate::sync::SyncPosition;
use crate::types::BlockRange;

/// Transaction runner.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Begin a transaction. Dropping it without committing rolls it back.
    async fn begin(&self) -> Result<Box<dyn StateTx>, IndexerError>;
}

/// Rows removed by [`StateTx::delete_range`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeDeletion {
    pub blocks: u64,
    pub versions: u64,
    pub checkpoints: u64,
    /// Entities that lost at least one version.
    pub entity_ids: BTreeSet<String>,
}

/// An open storage transaction.
#[async_trait]
pub trait StateTx: Send {
    // ─── Sync position ──────────────────────────────────────────────────────

    async fn sync_position(&mut self) -> Result<Option<SyncPosition>, IndexerError>;

    async fn save_sync_position(&mut self, position: &SyncPosition) -> Result<(), IndexerError>;

    // ─── Block ledger ───────────────────────────────────────────────────────

    async fn block(&mut self, hash: &str) -> Result<Option<BlockLedgerEntry>, IndexerError>;

    /// Insert or replace the entry keyed by `entry.block_hash`.
    async fn save_block(&mut self, entry: &BlockLedgerEntry) -> Result<(), IndexerError>;

    /// All entries at a height, pruned ones included.
    async fn blocks_at_height(&mut self, number: u64)
        -> Result<Vec<BlockLedgerEntry>, IndexerError>;

    /// All entries inside `range`, ordered by block number.
    async fn blocks_in_range(&mut self, range: BlockRange)
        -> Result<Vec<BlockLedgerEntry>, IndexerError>;

    // ─── Entity versions ────────────────────────────────────────────────────

    /// Insert or replace the version keyed by `(entity_id, block_hash)`.
    ///
    /// Returns the write sequence number assigned by the store.
    async fn insert_version(&mut self, version: &VersionedEntity) -> Result<u64, IndexerError>;

    async fn version(
        &mut self,
        entity_id: &str,
        block_hash: &str,
    ) -> Result<Option<VersionedEntity>, IndexerError>;

    /// Every version of an entity (pruned included), ordered by `(block_number, seq)`.
    async fn versions_of(&mut self, entity_id: &str) -> Result<Vec<VersionedEntity>, IndexerError>;

    /// Flip `is_pruned` on every version written at `block_hash`.
    ///
    /// Returns the ids of the affected entities.
    async fn set_versions_pruned(
        &mut self,
        block_hash: &str,
        pruned: bool,
    ) -> Result<Vec<String>, IndexerError>;

    /// Non-pruned versions whose block number lies in `range`.
    async fn versions_in_range(
        &mut self,
        range: BlockRange,
    ) -> Result<Vec<VersionedEntity>, IndexerError>;

    // ─── Latest pointers ────────────────────────────────────────────────────

    async fn latest(&mut self, entity_id: &str)
        -> Result<Option<LatestEntityPointer>, IndexerError>;

    async fn save_latest(&mut self, pointer: &LatestEntityPointer) -> Result<(), IndexerError>;

    async fn remove_latest(&mut self, entity_id: &str) -> Result<(), IndexerError>;

    async fn all_latest(&mut self) -> Result<Vec<LatestEntityPointer>, IndexerError>;

    // ─── Checkpoints ────────────────────────────────────────────────────────

    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), IndexerError>;

    /// All checkpoints, ordered by block number.
    async fn checkpoints(&mut self) -> Result<Vec<Checkpoint>, IndexerError>;

    /// Delete checkpoints whose block number lies in `range`.
    async fn delete_checkpoints(&mut self, range: BlockRange) -> Result<u64, IndexerError>;

    // ─── Range deletion ─────────────────────────────────────────────────────

    /// Physically delete ledger entries, versions and checkpoints whose block
    /// number lies in `range`. Latest pointers are left to the caller.
    async fn delete_range(&mut self, range: BlockRange) -> Result<RangeDeletion, IndexerError>;

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), IndexerError>;

    async fn rollback(self: Box<Self>) -> Result<(), IndexerError>;
}
