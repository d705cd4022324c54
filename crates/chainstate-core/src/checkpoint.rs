//! Checkpoint manager — content-addressed snapshots of consolidated state.
//!
//! Once a block is canonical, the entity state up to it can no longer change.
//! Every `interval` canonical blocks the manager serializes that state into a
//! [`CheckpointSnapshot`], pushes it to the [`ContentStore`] and records the
//! returned address as a [`Checkpoint`]. A process can later [`restore`] an
//! empty store from a checkpoint and resume without replaying history.
//!
//! Snapshots are either *full* (every entity) or *diffs* (entities written
//! since the previous checkpoint, chained through `base`). The first
//! checkpoint and every `full_every`-th one are full.
//!
//! [`restore`]: CheckpointManager::restore

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::content::{self, ContentStore};
use crate::entity::{LatestEntityPointer, VersionedEntity};
use crate::error::IndexerError;
use crate::handler::EntityKindRegistry;
use crate::ledger::{self, BlockLedgerEntry};
use crate::metrics::ChainStateMetrics;
use crate::store::{StateStore, StateTx};
use crate::sync::SyncPosition;
use crate::types::{BlockPtr, BlockRange};

/// Snapshot flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    /// Only entities changed since the previous checkpoint.
    Diff,
    /// Every entity.
    Full,
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Diff => write!(f, "diff"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for CheckpointKind {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "diff" => Ok(Self::Diff),
            "full" => Ok(Self::Full),
            other => Err(IndexerError::Other(format!("unknown checkpoint kind '{other}'"))),
        }
    }
}

/// A recorded checkpoint. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block_hash: String,
    pub block_number: u64,
    /// Address of the snapshot blob in the content store.
    pub content_address: String,
    pub kind: CheckpointKind,
    /// Unix timestamp of when this checkpoint was recorded.
    pub created_at: i64,
}

impl Checkpoint {
    pub fn block(&self) -> BlockPtr {
        BlockPtr::new(self.block_hash.clone(), self.block_number)
    }
}

/// One entity inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub kind: String,
    pub block_hash: String,
    pub block_number: u64,
    pub payload: serde_json::Value,
}

impl From<&VersionedEntity> for SnapshotEntry {
    fn from(v: &VersionedEntity) -> Self {
        Self {
            kind: v.entity_kind.clone(),
            block_hash: v.block_hash.clone(),
            block_number: v.block_number,
            payload: v.payload.clone(),
        }
    }
}

/// The serialized checkpoint blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub block: BlockPtr,
    pub parent_hash: String,
    pub kind: CheckpointKind,
    /// Address of the previous checkpoint (diffs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    pub entities: BTreeMap<String, SnapshotEntry>,
}

impl CheckpointSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Fully resolved entity state at a checkpoint block.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedState {
    pub block: BlockPtr,
    pub parent_hash: String,
    /// Kind of the snapshot the chain was resolved from.
    pub kind: CheckpointKind,
    pub entities: BTreeMap<String, SnapshotEntry>,
}

/// Newest version per entity id.
fn newest_per_entity(versions: Vec<VersionedEntity>) -> BTreeMap<String, SnapshotEntry> {
    let mut newest: BTreeMap<String, VersionedEntity> = BTreeMap::new();
    for v in versions {
        match newest.get(&v.entity_id) {
            Some(cur) if (cur.block_number, cur.seq) >= (v.block_number, v.seq) => {}
            _ => {
                newest.insert(v.entity_id.clone(), v);
            }
        }
    }
    newest
        .into_iter()
        .map(|(id, v)| (id, SnapshotEntry::from(&v)))
        .collect()
}

fn timeout_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Creates, loads and restores checkpoints.
pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    content: Arc<dyn ContentStore>,
    /// Canonical blocks between checkpoints.
    interval: u64,
    /// Every N-th checkpoint is a full snapshot.
    full_every: u64,
    /// Bound on each content-store call.
    timeout: Duration,
    metrics: ChainStateMetrics,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        content: Arc<dyn ContentStore>,
        interval: u64,
        full_every: u64,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            content,
            interval: interval.max(1),
            full_every: full_every.max(1),
            timeout,
            metrics: ChainStateMetrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: ChainStateMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Checkpoint `block_number` if the interval has elapsed since the last one.
    ///
    /// Content-store failures are logged and reported as `Ok(None)`; the next
    /// trigger retries.
    pub async fn maybe_checkpoint(
        &self,
        block_number: u64,
    ) -> Result<Option<Checkpoint>, IndexerError> {
        let Some(pos) = self.position().await? else {
            return Ok(None);
        };
        if block_number > pos.latest_canonical.number {
            tracing::debug!(
                block = block_number,
                canonical = pos.latest_canonical.number,
                "checkpoint skipped: block not canonical yet"
            );
            return Ok(None);
        }
        let last = pos
            .latest_checkpoint
            .as_ref()
            .map_or(pos.initial_indexed.number, |cp| cp.number);
        if block_number <= last || block_number - last < self.interval {
            return Ok(None);
        }

        match self.create(block_number, None).await {
            Ok(cp) => Ok(Some(cp)),
            Err(e @ (IndexerError::ContentStore(_) | IndexerError::Timeout { .. })) => {
                tracing::warn!(
                    block = block_number,
                    error = %e,
                    "Checkpoint upload failed, will retry on next trigger"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Checkpoint `block_number` now, regardless of the interval.
    ///
    /// `kind` overrides the full/diff schedule. Unlike
    /// [`maybe_checkpoint`](Self::maybe_checkpoint), content-store failures
    /// are returned.
    pub async fn force_checkpoint(
        &self,
        block_number: u64,
        kind: Option<CheckpointKind>,
    ) -> Result<Checkpoint, IndexerError> {
        let pos = self
            .position()
            .await?
            .ok_or_else(|| IndexerError::Other("no sync position, nothing to checkpoint".into()))?;
        if block_number > pos.latest_canonical.number {
            return Err(IndexerError::Other(format!(
                "block {block_number} is not canonical (canonical: {})",
                pos.latest_canonical.number
            )));
        }
        self.create(block_number, kind).await
    }

    /// Recorded checkpoints, ordered by block number.
    pub async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, IndexerError> {
        let mut tx = self.store.begin().await?;
        let checkpoints = tx.checkpoints().await?;
        tx.rollback().await?;
        Ok(checkpoints)
    }

    async fn position(&self) -> Result<Option<SyncPosition>, IndexerError> {
        let mut tx = self.store.begin().await?;
        let pos = tx.sync_position().await?;
        tx.rollback().await?;
        Ok(pos)
    }

    async fn create(
        &self,
        block_number: u64,
        kind: Option<CheckpointKind>,
    ) -> Result<Checkpoint, IndexerError> {
        // Build the snapshot from a consistent read, then release the store
        // before talking to the content store.
        let mut tx = self.store.begin().await?;
        let block = ledger::recorded_block_at(tx.as_mut(), block_number)
            .await?
            .filter(|b| b.is_complete)
            .ok_or(IndexerError::NoBlockAtHeight { block_number })?;

        let existing = tx.checkpoints().await?;
        if let Some(cp) = existing.iter().find(|c| c.block_hash == block.block_hash) {
            tx.rollback().await?;
            return Ok(cp.clone());
        }
        let previous = existing.iter().filter(|c| c.block_number < block_number).last();
        let kind = match (kind, previous) {
            (Some(k), Some(_)) => k,
            (_, None) => CheckpointKind::Full,
            (None, Some(_)) if existing.len() as u64 % self.full_every == 0 => CheckpointKind::Full,
            (None, Some(_)) => CheckpointKind::Diff,
        };
        let snapshot = self
            .build_snapshot(tx.as_mut(), &block, kind, previous)
            .await?;
        tx.rollback().await?;

        let bytes = snapshot.to_bytes()?;
        let size = bytes.len();
        let address = self.put(bytes).await?;

        let checkpoint = Checkpoint {
            block_hash: block.block_hash.clone(),
            block_number,
            content_address: address,
            kind,
            created_at: chrono::Utc::now().timestamp(),
        };

        let mut tx = self.store.begin().await?;
        let mut pos = tx
            .sync_position()
            .await?
            .ok_or_else(|| IndexerError::Other("sync position vanished during checkpoint".into()))?;
        tx.save_checkpoint(&checkpoint).await?;
        if pos
            .latest_checkpoint
            .as_ref()
            .map_or(true, |cp| cp.number < block_number)
        {
            pos.set_checkpoint(Some(checkpoint.block()));
            tx.save_sync_position(&pos).await?;
        }
        tx.commit().await?;

        self.metrics.record_checkpoint(kind);
        tracing::info!(
            block = block_number,
            kind = %kind,
            entities = snapshot.entities.len(),
            bytes = size,
            address = %checkpoint.content_address,
            "Checkpoint recorded"
        );
        Ok(checkpoint)
    }

    async fn build_snapshot(
        &self,
        tx: &mut dyn StateTx,
        block: &BlockLedgerEntry,
        kind: CheckpointKind,
        previous: Option<&Checkpoint>,
    ) -> Result<CheckpointSnapshot, IndexerError> {
        let (range, base) = match (kind, previous) {
            (CheckpointKind::Diff, Some(prev)) => (
                BlockRange::new(prev.block_number + 1, block.block_number),
                Some(prev.content_address.clone()),
            ),
            _ => (BlockRange::new(0, block.block_number), None),
        };
        let versions = tx.versions_in_range(range).await?;
        Ok(CheckpointSnapshot {
            block: block.ptr(),
            parent_hash: block.parent_hash.clone(),
            kind: if base.is_some() { CheckpointKind::Diff } else { CheckpointKind::Full },
            base,
            entities: newest_per_entity(versions),
        })
    }

    async fn put(&self, bytes: Vec<u8>) -> Result<String, IndexerError> {
        match tokio::time::timeout(self.timeout, self.content.put(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(IndexerError::Timeout {
                operation: "content store put".into(),
                millis: timeout_millis(self.timeout),
            }),
        }
    }

    async fn get(&self, address: &str) -> Result<Vec<u8>, IndexerError> {
        match tokio::time::timeout(self.timeout, self.content.get(address)).await {
            Ok(result) => result,
            Err(_) => Err(IndexerError::Timeout {
                operation: format!("content store get {address}"),
                millis: timeout_millis(self.timeout),
            }),
        }
    }

    /// Fetch, verify and deserialize the snapshot at `address`.
    pub async fn load_snapshot(&self, address: &str) -> Result<CheckpointSnapshot, IndexerError> {
        let bytes = self.get(address).await?;
        content::verify(address, &bytes)?;
        CheckpointSnapshot::from_bytes(&bytes)
    }

    /// Resolve the diff chain ending at `address` into the full entity state.
    pub async fn materialize(&self, address: &str) -> Result<MaterializedState, IndexerError> {
        let mut chain = Vec::new();
        let mut next = Some(address.to_string());
        while let Some(addr) = next.take() {
            let snapshot = self.load_snapshot(&addr).await?;
            next = match snapshot.kind {
                CheckpointKind::Full => None,
                CheckpointKind::Diff => Some(snapshot.base.clone().ok_or_else(|| {
                    IndexerError::Serialization(format!("diff snapshot {addr} has no base"))
                })?),
            };
            chain.push(snapshot);
        }

        let (block, parent_hash, kind) = chain
            .first()
            .map(|s| (s.block.clone(), s.parent_hash.clone(), s.kind))
            .ok_or_else(|| IndexerError::NotFound(format!("snapshot {address}")))?;
        let mut entities = BTreeMap::new();
        for snapshot in chain.into_iter().rev() {
            entities.extend(snapshot.entities);
        }
        Ok(MaterializedState {
            block,
            parent_hash,
            kind,
            entities,
        })
    }

    /// Seed an empty store from the checkpoint at `address`.
    ///
    /// Writes the checkpoint block's ledger entry, one version per entity,
    /// latest pointers for tracked kinds and a sync position whose four
    /// pointers all reference the checkpoint block.
    pub async fn restore(
        &self,
        address: &str,
        registry: &EntityKindRegistry,
    ) -> Result<SyncPosition, IndexerError> {
        let state = self.materialize(address).await?;

        let mut tx = self.store.begin().await?;
        if tx.sync_position().await?.is_some()
            || !tx.blocks_in_range(BlockRange::new(0, u64::MAX)).await?.is_empty()
        {
            return Err(IndexerError::Other(
                "restore requires an empty store; reset it first".into(),
            ));
        }

        let entry = BlockLedgerEntry {
            block_hash: state.block.hash.clone(),
            block_number: state.block.number,
            parent_hash: state.parent_hash.clone(),
            event_count: 0,
            processed_event_count: 0,
            is_complete: true,
            is_pruned: false,
        };
        tx.save_block(&entry).await?;

        for (entity_id, snap) in &state.entities {
            let tracks_latest = registry.tracks_latest(&snap.kind)?;
            let mut version = VersionedEntity {
                entity_id: entity_id.clone(),
                entity_kind: snap.kind.clone(),
                block_hash: snap.block_hash.clone(),
                block_number: snap.block_number,
                payload: snap.payload.clone(),
                is_pruned: false,
                seq: 0,
            };
            version.seq = tx.insert_version(&version).await?;
            if tracks_latest {
                tx.save_latest(&LatestEntityPointer::from(&version)).await?;
            }
        }

        tx.save_checkpoint(&Checkpoint {
            block_hash: state.block.hash.clone(),
            block_number: state.block.number,
            content_address: address.to_string(),
            kind: state.kind,
            created_at: chrono::Utc::now().timestamp(),
        })
        .await?;

        let mut pos = SyncPosition::new(state.block.clone());
        pos.set_checkpoint(Some(state.block.clone()));
        tx.save_sync_position(&pos).await?;
        tx.commit().await?;

        tracing::info!(
            block = state.block.number,
            entities = state.entities.len(),
            address,
            "Store restored from checkpoint"
        );
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentStore;
    use crate::entity::{apply_mutation, get_latest};
    use crate::ledger::{mark_complete, open_block};
    use crate::memory::MemoryStateStore;
    use crate::types::{BlockNotification, EntityMutation};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> EntityKindRegistry {
        EntityKindRegistry::builder().kind("Token").build()
    }

    fn hash(n: u64) -> String {
        format!("0x{n:x}")
    }

    /// Index blocks `from..=to`; block `n` writes entity `e{n % 3}` = n.
    /// Canonical follows `to - lag`.
    async fn populate(store: &MemoryStateStore, from: u64, to: u64, lag: u64) {
        let reg = registry();
        let mut tx = store.begin().await.unwrap();
        if tx.sync_position().await.unwrap().is_none() {
            tx.save_sync_position(&SyncPosition::new(BlockPtr::new(hash(from), from)))
                .await
                .unwrap();
        }
        for n in from..=to {
            let block = BlockNotification {
                number: n,
                hash: hash(n),
                parent_hash: hash(n - 1),
                event_count: 0,
            };
            open_block(tx.as_mut(), &block).await.unwrap();
            let m = EntityMutation {
                entity_id: format!("e{}", n % 3),
                entity_kind: "Token".into(),
                block_hash: hash(n),
                payload: json!(n),
            };
            apply_mutation(tx.as_mut(), &reg, &m).await.unwrap();
            mark_complete(tx.as_mut(), &hash(n)).await.unwrap();
            let mut pos = tx.sync_position().await.unwrap().unwrap();
            pos.advance_indexed(block.ptr()).unwrap();
            let canonical = to.saturating_sub(lag).max(from);
            pos.advance_canonical(BlockPtr::new(hash(canonical), canonical))
                .unwrap_or(false);
            tx.save_sync_position(&pos).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn manager(
        store: &MemoryStateStore,
        content: Arc<dyn ContentStore>,
        interval: u64,
        full_every: u64,
    ) -> CheckpointManager {
        CheckpointManager::new(
            Arc::new(store.clone()),
            content,
            interval,
            full_every,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn triggers_on_interval_and_canonical_only() {
        let store = MemoryStateStore::new();
        populate(&store, 1, 30, 5).await; // canonical = 25
        let mgr = manager(&store, Arc::new(MemoryContentStore::new()), 10, 10);

        assert!(mgr.maybe_checkpoint(5).await.unwrap().is_none()); // interval not reached
        assert!(mgr.maybe_checkpoint(28).await.unwrap().is_none()); // not canonical
        let cp = mgr.maybe_checkpoint(11).await.unwrap().unwrap();
        assert_eq!(cp.block_number, 11);
        assert_eq!(cp.kind, CheckpointKind::Full);
        assert!(mgr.maybe_checkpoint(15).await.unwrap().is_none());

        let cp = mgr.maybe_checkpoint(21).await.unwrap().unwrap();
        assert_eq!(cp.kind, CheckpointKind::Diff);

        let pos = mgr.position().await.unwrap().unwrap();
        assert_eq!(pos.latest_checkpoint.as_ref().unwrap().number, 21);
    }

    #[tokio::test]
    async fn full_every_nth_checkpoint() {
        let store = MemoryStateStore::new();
        populate(&store, 1, 40, 0).await;
        let mgr = manager(&store, Arc::new(MemoryContentStore::new()), 1, 3);

        let mut seen = Vec::new();
        for n in [5, 10, 15, 20] {
            seen.push(mgr.force_checkpoint(n, None).await.unwrap().kind);
        }
        assert_eq!(
            seen,
            vec![
                CheckpointKind::Full,
                CheckpointKind::Diff,
                CheckpointKind::Diff,
                CheckpointKind::Full
            ]
        );
    }

    #[tokio::test]
    async fn diff_chain_materializes_latest_state() {
        let store = MemoryStateStore::new();
        populate(&store, 1, 30, 0).await;
        let mgr = manager(&store, Arc::new(MemoryContentStore::new()), 1, 10);

        mgr.force_checkpoint(10, None).await.unwrap();
        let diff = mgr.force_checkpoint(20, None).await.unwrap();
        assert_eq!(diff.kind, CheckpointKind::Diff);

        let snapshot = mgr.load_snapshot(&diff.content_address).await.unwrap();
        assert!(snapshot.base.is_some());

        let state = mgr.materialize(&diff.content_address).await.unwrap();
        assert_eq!(state.block.number, 20);
        // Entities e0/e1/e2 were last written at 18, 19 and 20.
        assert_eq!(state.entities["e0"].payload, json!(18));
        assert_eq!(state.entities["e1"].payload, json!(19));
        assert_eq!(state.entities["e2"].payload, json!(20));
    }

    #[tokio::test]
    async fn restore_reproduces_latest_pointers() {
        let source = MemoryStateStore::new();
        populate(&source, 1, 30, 0).await;
        let content: Arc<dyn ContentStore> = Arc::new(MemoryContentStore::new());
        let cp = manager(&source, content.clone(), 1, 10)
            .force_checkpoint(30, None)
            .await
            .unwrap();

        let target = MemoryStateStore::new();
        let pos = manager(&target, content, 1, 10)
            .restore(&cp.content_address, &registry())
            .await
            .unwrap();
        assert_eq!(pos.latest_indexed.number, 30);
        assert_eq!(pos.latest_checkpoint.as_ref().unwrap().number, 30);

        let mut a = source.begin().await.unwrap();
        let mut b = target.begin().await.unwrap();
        assert_eq!(a.all_latest().await.unwrap(), b.all_latest().await.unwrap());
        assert_eq!(
            get_latest(b.as_mut(), "e1").await.unwrap().payload,
            json!(28)
        );
    }

    #[tokio::test]
    async fn restore_from_diff_keeps_diff_kind() {
        let source = MemoryStateStore::new();
        populate(&source, 1, 20, 0).await;
        let content: Arc<dyn ContentStore> = Arc::new(MemoryContentStore::new());
        let mgr = manager(&source, content.clone(), 1, 10);
        mgr.force_checkpoint(10, None).await.unwrap();
        let diff = mgr.force_checkpoint(20, None).await.unwrap();

        let target = MemoryStateStore::new();
        let restorer = manager(&target, content, 1, 10);
        restorer.restore(&diff.content_address, &registry()).await.unwrap();

        let recorded = restorer.list_checkpoints().await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].kind, CheckpointKind::Diff);
        assert_eq!(recorded[0].content_address, diff.content_address);
        assert_eq!(recorded[0].block_number, 20);
    }

    #[tokio::test]
    async fn restore_refuses_non_empty_store() {
        let store = MemoryStateStore::new();
        populate(&store, 1, 5, 0).await;
        let mgr = manager(&store, Arc::new(MemoryContentStore::new()), 1, 10);
        let cp = mgr.force_checkpoint(5, None).await.unwrap();
        assert!(mgr.restore(&cp.content_address, &registry()).await.is_err());
    }

    struct FlakyStore {
        inner: MemoryContentStore,
        down: AtomicBool,
        hang: bool,
    }

    #[async_trait]
    impl ContentStore for FlakyStore {
        async fn put(&self, bytes: Vec<u8>) -> Result<String, IndexerError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(IndexerError::ContentStore("unavailable".into()));
            }
            self.inner.put(bytes).await
        }

        async fn get(&self, address: &str) -> Result<Vec<u8>, IndexerError> {
            self.inner.get(address).await
        }
    }

    #[tokio::test]
    async fn store_failure_is_retried_on_next_trigger() {
        let store = MemoryStateStore::new();
        populate(&store, 1, 30, 0).await;
        let content = Arc::new(FlakyStore {
            inner: MemoryContentStore::new(),
            down: AtomicBool::new(true),
            hang: false,
        });
        let mgr = manager(&store, content.clone(), 10, 10);

        assert!(mgr.maybe_checkpoint(12).await.unwrap().is_none());
        assert!(mgr.position().await.unwrap().unwrap().latest_checkpoint.is_none());

        content.down.store(false, Ordering::SeqCst);
        let cp = mgr.maybe_checkpoint(13).await.unwrap().unwrap();
        assert_eq!(cp.block_number, 13);
    }

    #[tokio::test]
    async fn content_store_timeout() {
        let store = MemoryStateStore::new();
        populate(&store, 1, 30, 0).await;
        let content = Arc::new(FlakyStore {
            inner: MemoryContentStore::new(),
            down: AtomicBool::new(false),
            hang: true,
        });
        let mgr = manager(&store, content, 10, 10);

        assert!(mgr.maybe_checkpoint(20).await.unwrap().is_none());
        let err = mgr.force_checkpoint(20, None).await.unwrap_err();
        assert!(matches!(err, IndexerError::Timeout { .. }));
    }

    struct CorruptStore(MemoryContentStore);

    #[async_trait]
    impl ContentStore for CorruptStore {
        async fn put(&self, bytes: Vec<u8>) -> Result<String, IndexerError> {
            self.0.put(bytes).await
        }

        async fn get(&self, _address: &str) -> Result<Vec<u8>, IndexerError> {
            Ok(b"{}".to_vec())
        }
    }

    #[tokio::test]
    async fn tampered_blob_rejected() {
        let store = MemoryStateStore::new();
        populate(&store, 1, 3, 0).await;
        let mgr = manager(&store, Arc::new(CorruptStore(MemoryContentStore::new())), 1, 10);
        let cp = mgr.force_checkpoint(3, None).await.unwrap();
        let err = mgr.load_snapshot(&cp.content_address).await.unwrap_err();
        assert!(matches!(err, IndexerError::ContentStore(_)));
    }
}
