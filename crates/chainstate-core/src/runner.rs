//! Job runner — turns queued jobs into indexer calls.
//!
//! | Job          | Payload                     | Dedupe key               |
//! |--------------|-----------------------------|--------------------------|
//! | `block`      | [`BlockJob`]                | `block:<hash>`           |
//! | `event`      | [`EventJob`]                | `event:<hash>:<index>`   |
//! | `checkpoint` | [`CheckpointJob`]           | `checkpoint`             |
//!
//! Every job is safe to re-run: the block ledger remembers how far a block
//! got, so a job redelivered after a crash skips what is already applied.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManager;
use crate::error::IndexerError;
use crate::indexer::{ApplyOutcome, StateIndexer};
use crate::queue::{Job, JobKind, JobQueue, NewJob};
use crate::types::{BlockNotification, EventMutations};
use crate::worker::JobHandler;

/// Payload of a block job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJob {
    pub block: BlockNotification,
    /// Events delivered together with the block. Empty when events arrive
    /// as separate event jobs.
    #[serde(default)]
    pub events: Vec<EventMutations>,
}

/// Payload of an event job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventJob {
    pub block_hash: String,
    pub event: EventMutations,
}

/// Payload of a checkpoint job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointJob {
    /// Canonical block that triggered the job.
    pub block_number: u64,
}

/// [`JobHandler`] driving a [`StateIndexer`].
pub struct JobRunner {
    indexer: Arc<StateIndexer>,
    queue: Arc<JobQueue>,
    checkpoints: Option<Arc<CheckpointManager>>,
}

impl JobRunner {
    pub fn new(
        indexer: Arc<StateIndexer>,
        queue: Arc<JobQueue>,
        checkpoints: Option<Arc<CheckpointManager>>,
    ) -> Self {
        Self {
            indexer,
            queue,
            checkpoints,
        }
    }

    /// Enqueue a block, optionally with its events inline.
    pub async fn enqueue_block(
        &self,
        block: BlockNotification,
        events: Vec<EventMutations>,
    ) -> Result<Job, IndexerError> {
        let key = format!("block:{}", block.hash);
        let payload = serde_json::to_value(BlockJob { block, events })?;
        self.queue
            .enqueue(NewJob::new(JobKind::Block, payload).dedupe_key(key))
            .await
    }

    /// Enqueue one event of a block announced through [`enqueue_block`](Self::enqueue_block).
    pub async fn enqueue_event(
        &self,
        block_hash: impl Into<String>,
        event: EventMutations,
    ) -> Result<Job, IndexerError> {
        let block_hash = block_hash.into();
        let key = format!("event:{}:{}", block_hash, event.event_index);
        let payload = serde_json::to_value(EventJob { block_hash, event })?;
        self.queue
            .enqueue(NewJob::new(JobKind::Event, payload).dedupe_key(key))
            .await
    }

    async fn after_apply(&self, outcome: &ApplyOutcome) -> Result<(), IndexerError> {
        let (Some(_), Some(canonical)) = (&self.checkpoints, outcome.canonical_advance()) else {
            return Ok(());
        };
        let payload = serde_json::to_value(CheckpointJob {
            block_number: canonical.number,
        })?;
        self.queue
            .enqueue(
                NewJob::new(JobKind::Checkpoint, payload)
                    .dedupe_key("checkpoint")
                    .priority(-1),
            )
            .await?;
        Ok(())
    }

    async fn run_checkpoint(&self, job: CheckpointJob) -> Result<(), IndexerError> {
        let Some(manager) = &self.checkpoints else {
            tracing::debug!(block = job.block_number, "checkpoint job ignored: no content store");
            return Ok(());
        };
        // The canonical pointer may have moved on since the job was queued.
        let canonical = self
            .indexer
            .get_sync_position()
            .await?
            .map_or(job.block_number, |p| p.latest_canonical.number);
        manager.maybe_checkpoint(canonical.max(job.block_number)).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: &Job) -> Result<(), IndexerError> {
        match job.kind {
            JobKind::Block => {
                let payload: BlockJob = serde_json::from_value(job.payload.clone())?;
                let outcome = self
                    .indexer
                    .ingest_block(&payload.block, &payload.events)
                    .await?;
                self.after_apply(&outcome).await
            }
            JobKind::Event => {
                let payload: EventJob = serde_json::from_value(job.payload.clone())?;
                let outcome = self
                    .indexer
                    .apply_event(&payload.block_hash, &payload.event)
                    .await?;
                self.after_apply(&outcome).await
            }
            JobKind::Checkpoint => {
                let payload: CheckpointJob = serde_json::from_value(job.payload.clone())?;
                self.run_checkpoint(payload).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointKind;
    use crate::content::MemoryContentStore;
    use crate::handler::{EntityKindRegistry, HookRegistry};
    use crate::indexer::IndexerConfig;
    use crate::memory::MemoryStateStore;
    use crate::queue::{JobStatus, MemoryJobStore, QueueConfig};
    use crate::types::EntityMutation;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        runner: JobRunner,
        queue: Arc<JobQueue>,
        indexer: Arc<StateIndexer>,
        checkpoints: Arc<CheckpointManager>,
    }

    fn harness(depth: u64, interval: u64, backoff_ms: u64) -> Harness {
        let store = Arc::new(MemoryStateStore::new());
        let config = IndexerConfig {
            max_reorg_depth: depth,
            checkpoint_interval: interval,
            queue: QueueConfig {
                initial_backoff_ms: backoff_ms,
                max_backoff_ms: backoff_ms,
                ..QueueConfig::default()
            },
            ..IndexerConfig::default()
        };
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryJobStore::new()), &config.queue));
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone(),
            Arc::new(MemoryContentStore::new()),
            interval,
            10,
            Duration::from_secs(1),
        ));
        let indexer = Arc::new(StateIndexer::new(
            config,
            store,
            Arc::new(EntityKindRegistry::builder().kind("Token").build()),
            HookRegistry::new(),
        ));
        Harness {
            runner: JobRunner::new(indexer.clone(), queue.clone(), Some(checkpoints.clone())),
            queue,
            indexer,
            checkpoints,
        }
    }

    fn block(n: u64, events: u32) -> BlockNotification {
        BlockNotification {
            number: n,
            hash: format!("0x{n}"),
            parent_hash: format!("0x{}", n - 1),
            event_count: events,
        }
    }

    fn event(n: u64, index: u32, value: i64) -> EventMutations {
        EventMutations {
            event_index: index,
            mutations: vec![EntityMutation {
                entity_id: "x".into(),
                entity_kind: "Token".into(),
                block_hash: format!("0x{n}"),
                payload: json!(value),
            }],
        }
    }

    /// Run queued jobs until the queue is idle.
    async fn drain(h: &Harness) {
        while let Some(job) = h.queue.pull().await.unwrap() {
            match h.runner.handle(&job).await {
                Ok(()) => h.queue.complete(&job).await.unwrap(),
                Err(e) => {
                    h.queue.fail(&job, &e).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn block_jobs_are_deduplicated() {
        let h = harness(16, 100, 0);
        let a = h.runner.enqueue_block(block(1, 0), vec![]).await.unwrap();
        let b = h.runner.enqueue_block(block(1, 0), vec![]).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.dedupe_key.as_deref(), Some("block:0x1"));
    }

    #[tokio::test]
    async fn block_then_event_jobs() {
        let h = harness(16, 100, 0);
        h.runner.enqueue_block(block(1, 1), vec![event(1, 0, 1)]).await.unwrap();
        h.runner.enqueue_block(block(2, 2), vec![]).await.unwrap();
        h.runner.enqueue_event("0x2", event(2, 0, 20)).await.unwrap();
        h.runner.enqueue_event("0x2", event(2, 1, 21)).await.unwrap();
        drain(&h).await;

        assert_eq!(h.indexer.get_latest("x").await.unwrap().payload, json!(21));
        let progress = h.indexer.get_block_progress("0x2").await.unwrap().unwrap();
        assert!(progress.is_complete);
        assert_eq!(progress.processed_event_count, 2);
    }

    #[tokio::test]
    async fn event_queued_before_its_block_is_retried() {
        let h = harness(16, 100, 1);
        h.runner.enqueue_event("0x1", event(1, 0, 10)).await.unwrap();
        h.runner.enqueue_block(block(1, 1), vec![]).await.unwrap();
        for _ in 0..100 {
            drain(&h).await;
            if h.queue.store().list(None).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let progress = h.indexer.get_block_progress("0x1").await.unwrap().unwrap();
        assert!(progress.is_complete);
        assert_eq!(progress.processed_event_count, 1);
        assert_eq!(h.indexer.get_latest("x").await.unwrap().payload, json!(10));
        assert!(h.queue.store().list(Some(JobStatus::Dead)).await.unwrap().is_empty());
        assert!(h.queue.store().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_event_is_retried() {
        let h = harness(16, 100, 60_000);
        h.runner.enqueue_block(block(1, 2), vec![]).await.unwrap();
        h.runner.enqueue_event("0x1", event(1, 1, 11)).await.unwrap();
        drain(&h).await;

        let failed = h.queue.store().list(Some(JobStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("arrived before"));

        h.runner.enqueue_event("0x1", event(1, 0, 10)).await.unwrap();
        drain(&h).await;

        // Make the backed-off job due now.
        let mut retry = failed[0].clone();
        retry.run_at = 0;
        h.queue.store().update(&retry).await.unwrap();
        drain(&h).await;

        assert_eq!(h.indexer.get_latest("x").await.unwrap().payload, json!(11));
        assert!(h.queue.store().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn canonical_advance_triggers_checkpoint() {
        let h = harness(2, 3, 0);
        for n in 1..=8 {
            h.runner.enqueue_block(block(n, 1), vec![event(n, 0, n as i64)]).await.unwrap();
            drain(&h).await;
        }
        // Canonical reaches 4 after block 6; 4 - 1 (initial) meets the interval.
        let pos = h.indexer.get_sync_position().await.unwrap().unwrap();
        assert_eq!(pos.latest_canonical.number, 6);
        assert_eq!(pos.latest_checkpoint.map(|cp| cp.number), Some(4));

        let recorded = h.checkpoints.list_checkpoints().await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].block_number, 4);
        assert_eq!(recorded[0].block_hash, "0x4");
        assert_eq!(recorded[0].kind, CheckpointKind::Full);
    }
}
