//! Indexer configuration, state and the block/event application engine.
//!
//! [`StateIndexer`] applies block notifications and entity mutations to the
//! [`StateStore`]. Each block (or event) is applied in one transaction that
//! covers the ledger entry, the entity versions and the sync position. Block
//! application holds the shared side of the reorg lock; reorg resolution
//! holds the exclusive side.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::entity::{self, VersionedEntity};
use crate::error::IndexerError;
use crate::handler::{EntityKindRegistry, HookRegistry, WriteEvent};
use crate::ledger::{self, BlockLedgerEntry};
use crate::metrics::ChainStateMetrics;
use crate::queue::QueueConfig;
use crate::reorg::{self, ReorgEvent, ReorgType};
use crate::store::{StateStore, StateTx};
use crate::sync::{HeadUpdate, SyncPosition};
use crate::types::{BlockNotification, BlockPtr, EventMutations};

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer.
    pub id: String,
    /// Chain being indexed (e.g. `"ethereum"`).
    pub chain: String,
    /// Blocks behind the indexed tip after which a block is canonical.
    pub max_reorg_depth: u64,
    /// Canonical blocks between checkpoints.
    pub checkpoint_interval: u64,
    /// Every N-th checkpoint is a full snapshot.
    pub full_checkpoint_every: u64,
    /// Bound on each content-store call (milliseconds).
    pub content_store_timeout_ms: u64,
    pub queue: QueueConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain: "ethereum".into(),
            max_reorg_depth: 16,
            checkpoint_interval: 100,
            full_checkpoint_every: 10,
            content_store_timeout_ms: 10_000,
            queue: QueueConfig::default(),
        }
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Applying blocks.
    Syncing,
    /// Resolving a reorg.
    ReorgRecovery,
    /// Stopped on a fatal error; needs an operator.
    Halted,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Halted => write!(f, "halted"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of applying a block or an event.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The block is now fully processed and indexed.
    Completed {
        block: BlockPtr,
        /// Set when the canonical pointer moved.
        canonical: Option<BlockPtr>,
        /// Fork point, when a reorg was resolved first.
        reorg: Option<BlockPtr>,
    },
    /// Events were applied but the block still waits for more.
    Pending {
        block: BlockPtr,
        processed: u32,
        expected: u32,
    },
    /// Nothing to do: already applied.
    AlreadyApplied { block: BlockPtr },
    /// The block sits on an orphaned branch; the work is dropped.
    Orphaned { block: BlockPtr },
}

impl ApplyOutcome {
    /// The new canonical pointer, if this application advanced it.
    pub fn canonical_advance(&self) -> Option<&BlockPtr> {
        match self {
            Self::Completed { canonical, .. } => canonical.as_ref(),
            _ => None,
        }
    }
}

enum Prepared {
    Ready,
    NeedsReorg,
    Done(ApplyOutcome),
}

/// The reorg-aware block and event application engine.
pub struct StateIndexer {
    config: IndexerConfig,
    store: Arc<dyn StateStore>,
    registry: Arc<EntityKindRegistry>,
    hooks: HookRegistry,
    reorg_lock: RwLock<()>,
    state: Mutex<IndexerState>,
    metrics: ChainStateMetrics,
}

impl StateIndexer {
    pub fn new(
        config: IndexerConfig,
        store: Arc<dyn StateStore>,
        registry: Arc<EntityKindRegistry>,
        hooks: HookRegistry,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            hooks,
            reorg_lock: RwLock::new(()),
            state: Mutex::new(IndexerState::Idle),
            metrics: ChainStateMetrics::global(),
        }
    }

    pub fn with_metrics(mut self, metrics: ChainStateMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<EntityKindRegistry> {
        &self.registry
    }

    pub fn state(&self) -> IndexerState {
        self.state.lock().map(|s| *s).unwrap_or(IndexerState::Halted)
    }

    pub fn set_state(&self, state: IndexerState) {
        if let Ok(mut s) = self.state.lock() {
            if *s != state {
                tracing::debug!(from = %*s, to = %state, "indexer state change");
                *s = state;
            }
        }
    }

    // ─── Write path ─────────────────────────────────────────────────────────

    /// Apply a block notification together with any of its events known
    /// up front.
    ///
    /// Resolves a reorg first when the block does not extend the recorded
    /// chain. Events with an index below the ledger's processed count are
    /// skipped, which makes redelivery after a crash harmless.
    pub async fn ingest_block(
        &self,
        block: &BlockNotification,
        events: &[EventMutations],
    ) -> Result<ApplyOutcome, IndexerError> {
        self.ingest(block, events, None).await
    }

    async fn ingest(
        &self,
        block: &BlockNotification,
        events: &[EventMutations],
        reorg_type: Option<ReorgType>,
    ) -> Result<ApplyOutcome, IndexerError> {
        {
            let _shared = self.reorg_lock.read().await;
            let mut tx = self.store.begin().await?;
            match self.prepare(tx.as_mut(), block).await? {
                Prepared::Done(outcome) => {
                    tx.rollback().await?;
                    return Ok(outcome);
                }
                Prepared::Ready => return self.apply_block(tx, block, events, None).await,
                Prepared::NeedsReorg => tx.rollback().await?,
            }
        }

        let _exclusive = self.reorg_lock.write().await;
        let mut tx = self.store.begin().await?;
        let reorg = match self.prepare(tx.as_mut(), block).await? {
            Prepared::Done(outcome) => {
                tx.rollback().await?;
                return Ok(outcome);
            }
            Prepared::Ready => None,
            Prepared::NeedsReorg => {
                let previous = self.state();
                self.set_state(IndexerState::ReorgRecovery);
                let resolved = reorg::resolve(tx.as_mut(), &self.registry, block, reorg_type).await;
                match resolved {
                    Ok(event) => {
                        self.set_state(previous);
                        Some(event)
                    }
                    Err(e) => {
                        self.set_state(if e.is_fatal() {
                            IndexerState::Halted
                        } else {
                            previous
                        });
                        return Err(e);
                    }
                }
            }
        };
        self.apply_block(tx, block, events, reorg).await
    }

    /// Decide how `block` is handled before anything is written.
    async fn prepare(
        &self,
        tx: &mut dyn StateTx,
        block: &BlockNotification,
    ) -> Result<Prepared, IndexerError> {
        let pos = match tx.sync_position().await? {
            Some(pos) => pos,
            None => {
                tracing::info!(block = block.number, hash = %block.hash, "Initializing sync position");
                tx.save_sync_position(&SyncPosition::new(block.ptr())).await?;
                return Ok(Prepared::Ready);
            }
        };
        if block.number < pos.initial_indexed.number {
            return Err(IndexerError::OutOfOrder {
                current: pos.initial_indexed.number,
                requested: block.number,
            });
        }
        if let Some(existing) = tx.block(&block.hash).await? {
            if existing.is_pruned {
                return Ok(Prepared::NeedsReorg);
            }
            if existing.is_complete {
                return Ok(Prepared::Done(ApplyOutcome::AlreadyApplied {
                    block: existing.ptr(),
                }));
            }
        }
        if block.hash == pos.initial_indexed.hash {
            return Ok(Prepared::Ready);
        }
        if reorg::needs_resolution(tx, block).await? {
            return Ok(Prepared::NeedsReorg);
        }
        Ok(Prepared::Ready)
    }

    /// Parent-first ordering: a block can only be worked on once its parent
    /// is fully processed.
    async fn require_parent_complete(
        &self,
        tx: &mut dyn StateTx,
        entry: &BlockLedgerEntry,
    ) -> Result<(), IndexerError> {
        let pos = tx.sync_position().await?;
        if pos.map_or(true, |p| p.initial_indexed.hash == entry.block_hash) {
            return Ok(());
        }
        match tx.block(&entry.parent_hash).await? {
            Some(parent) if parent.is_complete && !parent.is_pruned => Ok(()),
            _ => Err(IndexerError::ParentUnknown {
                block_number: entry.block_number,
                parent_hash: entry.parent_hash.clone(),
            }),
        }
    }

    async fn apply_block(
        &self,
        mut tx: Box<dyn StateTx>,
        block: &BlockNotification,
        events: &[EventMutations],
        reorg: Option<ReorgEvent>,
    ) -> Result<ApplyOutcome, IndexerError> {
        let started = Instant::now();
        let mut entry = match tx.block(&block.hash).await? {
            Some(existing) => existing,
            None => ledger::open_block(tx.as_mut(), block).await?,
        };
        self.require_parent_complete(tx.as_mut(), &entry).await?;

        let mut writes = Vec::new();
        if !entry.is_complete {
            let mut sorted: Vec<&EventMutations> = events.iter().collect();
            sorted.sort_by_key(|e| e.event_index);
            for event in sorted {
                if event.event_index < entry.processed_event_count {
                    continue;
                }
                entry = self
                    .apply_event_mutations(tx.as_mut(), &entry, event, &mut writes)
                    .await?;
            }
        }

        let fork_point = reorg.as_ref().map(|r| r.fork_point.clone());
        let outcome = self.finish(tx.as_mut(), &entry, fork_point).await?;
        tx.commit().await?;

        if let Some(event) = &reorg {
            self.metrics.record_reorg(event.reorg_type, event.depth);
            self.hooks.dispatch_reorg(event);
        }
        self.hooks.dispatch_writes(&writes);
        self.observe(&outcome, writes.len(), started.elapsed());
        Ok(outcome)
    }

    /// Apply one event of a block.
    ///
    /// Fails with the retryable [`IndexerError::BlockNotOpened`] while the
    /// block's own job has not committed yet.
    pub async fn apply_event(
        &self,
        block_hash: &str,
        event: &EventMutations,
    ) -> Result<ApplyOutcome, IndexerError> {
        let _shared = self.reorg_lock.read().await;
        let started = Instant::now();
        let mut tx = self.store.begin().await?;

        let entry = tx
            .block(block_hash)
            .await?
            .ok_or_else(|| IndexerError::BlockNotOpened {
                hash: block_hash.into(),
            })?;
        if entry.is_pruned {
            tracing::debug!(block = entry.block_number, hash = block_hash, "event dropped: block orphaned");
            tx.rollback().await?;
            return Ok(ApplyOutcome::Orphaned { block: entry.ptr() });
        }
        if entry.is_complete || event.event_index < entry.processed_event_count {
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyApplied { block: entry.ptr() });
        }
        self.require_parent_complete(tx.as_mut(), &entry).await?;

        let mut writes = Vec::new();
        let entry = self
            .apply_event_mutations(tx.as_mut(), &entry, event, &mut writes)
            .await?;
        let outcome = self.finish(tx.as_mut(), &entry, None).await?;
        tx.commit().await?;

        self.hooks.dispatch_writes(&writes);
        self.observe(&outcome, writes.len(), started.elapsed());
        Ok(outcome)
    }

    async fn apply_event_mutations(
        &self,
        tx: &mut dyn StateTx,
        entry: &BlockLedgerEntry,
        event: &EventMutations,
        writes: &mut Vec<WriteEvent>,
    ) -> Result<BlockLedgerEntry, IndexerError> {
        if event.event_index != entry.processed_event_count {
            return Err(IndexerError::EventOutOfOrder {
                hash: entry.block_hash.clone(),
                event_index: event.event_index,
                expected: entry.processed_event_count,
            });
        }
        for mutation in &event.mutations {
            if mutation.block_hash != entry.block_hash {
                return Err(IndexerError::Other(format!(
                    "mutation of {} tagged with block {} inside event of block {}",
                    mutation.entity_id, mutation.block_hash, entry.block_hash
                )));
            }
            writes.push(entity::apply_mutation(tx, &self.registry, mutation).await?);
        }
        ledger::record_event(tx, &entry.block_hash).await
    }

    /// Complete the block if all its events are in, then advance the indexed
    /// and canonical pointers.
    async fn finish(
        &self,
        tx: &mut dyn StateTx,
        entry: &BlockLedgerEntry,
        reorg: Option<BlockPtr>,
    ) -> Result<ApplyOutcome, IndexerError> {
        if !entry.counts_match() {
            return Ok(ApplyOutcome::Pending {
                block: entry.ptr(),
                processed: entry.processed_event_count,
                expected: entry.event_count,
            });
        }
        let entry = ledger::mark_complete(tx, &entry.block_hash).await?;

        let mut pos = tx
            .sync_position()
            .await?
            .ok_or_else(|| IndexerError::Other("sync position missing".into()))?;
        if entry.block_number >= pos.latest_indexed.number {
            pos.advance_indexed(entry.ptr())?;
        }
        let canonical = self.canonicalize(tx, &mut pos).await?;
        tx.save_sync_position(&pos).await?;

        Ok(ApplyOutcome::Completed {
            block: entry.ptr(),
            canonical,
            reorg,
        })
    }

    /// Move the canonical pointer to the recorded block `max_reorg_depth`
    /// below the indexed tip.
    async fn canonicalize(
        &self,
        tx: &mut dyn StateTx,
        pos: &mut SyncPosition,
    ) -> Result<Option<BlockPtr>, IndexerError> {
        let Some(target) = pos
            .latest_indexed
            .number
            .checked_sub(self.config.max_reorg_depth)
        else {
            return Ok(None);
        };
        if target <= pos.latest_canonical.number {
            return Ok(None);
        }
        match ledger::recorded_block_at(tx, target).await? {
            Some(block) if block.is_complete => {
                let ptr = block.ptr();
                if pos.advance_canonical(ptr.clone())? {
                    return Ok(Some(ptr));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Log and record metrics for a committed apply.
    fn observe(&self, outcome: &ApplyOutcome, writes: usize, elapsed: Duration) {
        self.metrics.record_apply(elapsed);
        match outcome {
            ApplyOutcome::Completed {
                block, canonical, ..
            } => {
                self.metrics.record_block_completed(block.number);
                tracing::info!(block = block.number, hash = %block.hash, writes, "Block indexed");
                if let Some(c) = canonical {
                    tracing::info!(block = c.number, hash = %c.hash, "Canonical block advanced");
                }
            }
            ApplyOutcome::Pending {
                block,
                processed,
                expected,
            } => {
                tracing::debug!(block = block.number, processed, expected, writes, "block pending events");
            }
            _ => {}
        }
    }

    /// Record the chain head reported by the upstream feed.
    ///
    /// A regression to a block the ledger knows on a pruned branch switches
    /// the recorded chain back to that branch.
    pub async fn set_chain_head(&self, head: BlockPtr) -> Result<HeadUpdate, IndexerError> {
        let (update, revive) = {
            let _shared = self.reorg_lock.read().await;
            let mut tx = self.store.begin().await?;
            let update = match tx.sync_position().await? {
                None => {
                    tracing::info!(block = head.number, hash = %head.hash, "Initializing sync position from chain head");
                    tx.save_sync_position(&SyncPosition::new(head.clone())).await?;
                    HeadUpdate::Advanced
                }
                Some(mut pos) => {
                    let update = pos.set_chain_head(head.clone());
                    if update != HeadUpdate::Unchanged {
                        tx.save_sync_position(&pos).await?;
                    }
                    update
                }
            };
            let revive = match &update {
                HeadUpdate::Regressed { previous } => {
                    tracing::warn!(
                        from = previous.number,
                        to = head.number,
                        hash = %head.hash,
                        "Chain head regressed"
                    );
                    tx.block(&head.hash)
                        .await?
                        .filter(|b| b.is_pruned && b.is_complete)
                }
                _ => None,
            };
            tx.commit().await?;
            (update, revive)
        };

        if let Some(entry) = revive {
            let block = BlockNotification {
                number: entry.block_number,
                hash: entry.block_hash.clone(),
                parent_hash: entry.parent_hash.clone(),
                event_count: entry.event_count,
            };
            self.ingest(&block, &[], Some(ReorgType::HeadRegression))
                .await?;
        }
        Ok(update)
    }

    // ─── Read path ──────────────────────────────────────────────────────────

    /// Current version of an entity.
    pub async fn get_latest(&self, entity_id: &str) -> Result<VersionedEntity, IndexerError> {
        let mut tx = self.store.begin().await?;
        let result = entity::get_latest(tx.as_mut(), entity_id).await;
        tx.rollback().await?;
        result
    }

    /// The version written at exactly `block_hash`.
    pub async fn get_at_block(
        &self,
        entity_id: &str,
        block_hash: &str,
    ) -> Result<VersionedEntity, IndexerError> {
        let mut tx = self.store.begin().await?;
        let result = entity::get_at_block(tx.as_mut(), entity_id, block_hash).await;
        tx.rollback().await?;
        result
    }

    /// The entity as seen from `block_hash`.
    pub async fn get_as_of(
        &self,
        entity_id: &str,
        block_hash: &str,
    ) -> Result<VersionedEntity, IndexerError> {
        let mut tx = self.store.begin().await?;
        let result = entity::get_as_of(tx.as_mut(), entity_id, block_hash).await;
        tx.rollback().await?;
        result
    }

    pub async fn get_sync_position(&self) -> Result<Option<SyncPosition>, IndexerError> {
        let mut tx = self.store.begin().await?;
        let pos = tx.sync_position().await?;
        tx.rollback().await?;
        Ok(pos)
    }

    /// Ledger entry of a block (processing progress).
    pub async fn get_block_progress(
        &self,
        block_hash: &str,
    ) -> Result<Option<BlockLedgerEntry>, IndexerError> {
        let mut tx = self.store.begin().await?;
        let entry = tx.block(block_hash).await?;
        tx.rollback().await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::WriteHook;
    use crate::memory::MemoryStateStore;
    use crate::types::EntityMutation;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn block(number: u64, hash: &str, parent: &str, events: u32) -> BlockNotification {
        BlockNotification {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            event_count: events,
        }
    }

    fn event(index: u32, hash: &str, writes: &[(&str, serde_json::Value)]) -> EventMutations {
        EventMutations {
            event_index: index,
            mutations: writes
                .iter()
                .map(|(id, v)| EntityMutation {
                    entity_id: id.to_string(),
                    entity_kind: "Token".into(),
                    block_hash: hash.into(),
                    payload: v.clone(),
                })
                .collect(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        writes: AtomicU32,
        reorgs: AtomicU32,
    }

    impl WriteHook for Recorder {
        fn on_write(&self, _e: &WriteEvent) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_reorg(&self, _e: &ReorgEvent) {
            self.reorgs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn indexer(depth: u64) -> (StateIndexer, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut hooks = HookRegistry::new();
        hooks.register(recorder.clone());
        let config = IndexerConfig {
            max_reorg_depth: depth,
            ..IndexerConfig::default()
        };
        let registry = EntityKindRegistry::builder().kind("Token").build();
        let idx = StateIndexer::new(
            config,
            Arc::new(MemoryStateStore::new()),
            Arc::new(registry),
            hooks,
        );
        (idx, recorder)
    }

    /// Index `x = value` at `(number, hash)` in a one-event block.
    async fn put(idx: &StateIndexer, number: u64, hash: &str, parent: &str, value: &str) -> ApplyOutcome {
        idx.ingest_block(
            &block(number, hash, parent, 1),
            &[event(0, hash, &[("x", json!(value))])],
        )
        .await
        .unwrap()
    }

    #[test]
    fn config_defaults() {
        let cfg = IndexerConfig::default();
        assert_eq!(cfg.max_reorg_depth, 16);
        assert_eq!(cfg.checkpoint_interval, 100);
        assert_eq!(cfg.queue.max_retries, 15);
    }

    #[test]
    fn config_deserializes_partial() {
        let cfg: IndexerConfig = serde_json::from_str(r#"{"id":"pools","queue":{"workers":2}}"#).unwrap();
        assert_eq!(cfg.id, "pools");
        assert_eq!(cfg.queue.workers, 2);
        assert_eq!(cfg.queue.max_retries, 15);
        assert_eq!(cfg.max_reorg_depth, 16);
    }

    #[tokio::test]
    async fn linear_chain_latest_is_highest_write() {
        let (idx, rec) = indexer(16);
        put(&idx, 10, "0xa", "0x9", "a").await;
        put(&idx, 11, "0xb", "0xa", "b").await;
        let out = put(&idx, 12, "0xc", "0xb", "c").await;
        assert!(matches!(out, ApplyOutcome::Completed { ref block, .. } if block.number == 12));

        assert_eq!(idx.get_latest("x").await.unwrap().payload, json!("c"));
        assert_eq!(idx.get_at_block("x", "0xb").await.unwrap().payload, json!("b"));
        assert_eq!(idx.get_as_of("x", "0xb").await.unwrap().payload, json!("b"));
        let pos = idx.get_sync_position().await.unwrap().unwrap();
        assert_eq!(pos.latest_indexed.number, 12);
        assert_eq!(pos.initial_indexed.number, 10);
        assert_eq!(rec.writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn redelivered_block_is_idempotent() {
        let (idx, rec) = indexer(16);
        put(&idx, 10, "0xa", "0x9", "a").await;
        put(&idx, 11, "0xb", "0xa", "b").await;
        let again = put(&idx, 11, "0xb", "0xa", "b").await;
        assert!(matches!(again, ApplyOutcome::AlreadyApplied { .. }));
        assert_eq!(rec.writes.load(Ordering::SeqCst), 2);
        assert_eq!(idx.get_latest("x").await.unwrap().payload, json!("b"));
    }

    #[tokio::test]
    async fn reorg_replaces_branch() {
        let (idx, rec) = indexer(16);
        put(&idx, 10, "0xa", "0x9", "a").await;
        put(&idx, 11, "0xb", "0xa", "b").await;
        idx.ingest_block(
            &block(12, "0xc", "0xb", 1),
            &[event(0, "0xc", &[("x", json!("c")), ("only_c", json!(1))])],
        )
        .await
        .unwrap();

        let out = put(&idx, 11, "0xb2", "0xa", "b2").await;
        assert!(matches!(out, ApplyOutcome::Completed { reorg: Some(ref f), .. } if f.hash == "0xa"));
        put(&idx, 12, "0xc2", "0xb2", "c2").await;

        assert_eq!(idx.get_latest("x").await.unwrap().payload, json!("c2"));
        assert!(matches!(idx.get_latest("only_c").await, Err(IndexerError::NotFound(_))));
        assert!(idx.get_at_block("x", "0xc").await.is_err());
        assert!(idx.get_block_progress("0xb").await.unwrap().unwrap().is_pruned);
        assert_eq!(rec.reorgs.load(Ordering::SeqCst), 1);
        assert_eq!(idx.state(), IndexerState::Idle);
    }

    #[tokio::test]
    async fn sibling_without_write_falls_back_to_canonical_value() {
        // Block 10 canonical, 11 writes x, 11' does not.
        let (idx, _) = indexer(1);
        put(&idx, 10, "0xa", "0x9", "ten").await;
        put(&idx, 11, "0xb", "0xa", "eleven").await;
        let pos = idx.get_sync_position().await.unwrap().unwrap();
        assert_eq!(pos.latest_canonical.number, 10);

        idx.ingest_block(&block(11, "0xb2", "0xa", 0), &[]).await.unwrap();
        assert_eq!(idx.get_latest("x").await.unwrap().payload, json!("ten"));
    }

    #[tokio::test]
    async fn reorg_below_canonical_halts() {
        let (idx, _) = indexer(1);
        put(&idx, 10, "0xa", "0x9", "a").await;
        put(&idx, 11, "0xb", "0xa", "b").await;
        put(&idx, 12, "0xc", "0xb", "c").await; // canonical = 11
        let before = idx.get_sync_position().await.unwrap().unwrap();

        let err = idx
            .ingest_block(&block(11, "0xb2", "0xa", 0), &[])
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(idx.state(), IndexerState::Halted);
        assert_eq!(idx.get_sync_position().await.unwrap().unwrap(), before);
        assert_eq!(idx.get_latest("x").await.unwrap().payload, json!("c"));
    }

    #[tokio::test]
    async fn events_applied_one_by_one() {
        let (idx, _) = indexer(16);
        put(&idx, 10, "0xa", "0x9", "a").await;

        let b = block(11, "0xb", "0xa", 2);
        let out = idx.ingest_block(&b, &[]).await.unwrap();
        assert!(matches!(out, ApplyOutcome::Pending { processed: 0, expected: 2, .. }));

        let err = idx
            .apply_event("0xb", &event(1, "0xb", &[("x", json!("late"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::EventOutOfOrder { expected: 0, .. }));

        let out = idx
            .apply_event("0xb", &event(0, "0xb", &[("x", json!("first"))]))
            .await
            .unwrap();
        assert!(matches!(out, ApplyOutcome::Pending { processed: 1, .. }));
        // Redelivered event is a no-op.
        let out = idx
            .apply_event("0xb", &event(0, "0xb", &[("x", json!("first"))]))
            .await
            .unwrap();
        assert!(matches!(out, ApplyOutcome::AlreadyApplied { .. }));

        let out = idx
            .apply_event("0xb", &event(1, "0xb", &[("x", json!("second"))]))
            .await
            .unwrap();
        assert!(matches!(out, ApplyOutcome::Completed { .. }));
        assert_eq!(idx.get_latest("x").await.unwrap().payload, json!("second"));
        assert_eq!(
            idx.get_sync_position().await.unwrap().unwrap().latest_indexed.number,
            11
        );
    }

    #[tokio::test]
    async fn child_waits_for_incomplete_parent() {
        let (idx, _) = indexer(16);
        put(&idx, 10, "0xa", "0x9", "a").await;
        idx.ingest_block(&block(11, "0xb", "0xa", 1), &[]).await.unwrap();

        let err = idx
            .ingest_block(&block(12, "0xc", "0xb", 0), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::ParentUnknown { .. }));
        assert!(err.is_retryable());
        assert!(idx.get_block_progress("0xc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chain_head_initializes_and_regresses() {
        let (idx, _) = indexer(16);
        assert_eq!(
            idx.set_chain_head(BlockPtr::new("0xa", 10)).await.unwrap(),
            HeadUpdate::Advanced
        );
        put(&idx, 10, "0xa", "0x9", "a").await;
        put(&idx, 11, "0xb", "0xa", "b").await;
        put(&idx, 11, "0xb2", "0xa", "b2").await; // reorg: 0xb pruned

        // Upstream flips back to 0xb.
        let update = idx.set_chain_head(BlockPtr::new("0xb", 11)).await.unwrap();
        assert!(update.is_regression());
        assert_eq!(idx.get_latest("x").await.unwrap().payload, json!("b"));
        assert!(!idx.get_block_progress("0xb").await.unwrap().unwrap().is_pruned);
        assert!(idx.get_block_progress("0xb2").await.unwrap().unwrap().is_pruned);
    }

    #[tokio::test]
    async fn canonical_follows_depth() {
        let (idx, _) = indexer(2);
        put(&idx, 10, "0xa", "0x9", "a").await;
        put(&idx, 11, "0xb", "0xa", "b").await;
        let out = put(&idx, 12, "0xc", "0xb", "c").await;
        assert!(out.canonical_advance().is_none()); // 12 - 2 = 10, already canonical
        let out = put(&idx, 13, "0xd", "0xc", "d").await;
        assert_eq!(out.canonical_advance().unwrap().number, 11);
    }
}
