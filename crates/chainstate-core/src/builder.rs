//! Fluent builder API for assembling an indexer.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainstate_core::{EntityKindRegistry, IndexerBuilder};
//! use chainstate_core::memory::MemoryStateStore;
//!
//! let indexer = IndexerBuilder::new()
//!     .id("uniswap-pools")
//!     .chain("ethereum")
//!     .max_reorg_depth(32)
//!     .workers(4)
//!     .registry(EntityKindRegistry::builder().kind("Pool").build())
//!     .store(Arc::new(MemoryStateStore::new()))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::CheckpointManager;
use crate::content::ContentStore;
use crate::error::IndexerError;
use crate::handler::{EntityKindRegistry, HookRegistry, WriteHook};
use crate::indexer::{IndexerConfig, StateIndexer};
use crate::metrics::ChainStateMetrics;
use crate::queue::{JobQueue, JobStore, MemoryJobStore};
use crate::runner::JobRunner;
use crate::store::StateStore;
use crate::worker::WorkerPool;

/// Fluent builder for [`IndexerConfig`] and the components around it.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    store: Option<Arc<dyn StateStore>>,
    jobs: Option<Arc<dyn JobStore>>,
    content: Option<Arc<dyn ContentStore>>,
    registry: EntityKindRegistry,
    hooks: HookRegistry,
    metrics: Option<ChainStateMetrics>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn with_config(config: IndexerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the indexer ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the chain to index.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Blocks behind the indexed tip after which a block is canonical.
    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Canonical blocks between checkpoints.
    pub fn checkpoint_interval(mut self, n: u64) -> Self {
        self.config.checkpoint_interval = n;
        self
    }

    pub fn full_checkpoint_every(mut self, n: u64) -> Self {
        self.config.full_checkpoint_every = n;
        self
    }

    pub fn content_store_timeout_ms(mut self, ms: u64) -> Self {
        self.config.content_store_timeout_ms = ms;
        self
    }

    /// Number of worker tasks.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.queue.workers = n;
        self
    }

    /// Retries before a job is dead-lettered.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.queue.max_retries = n;
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Job storage. Defaults to [`MemoryJobStore`].
    pub fn job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Content store for checkpoints. Without one, checkpointing is off.
    pub fn content_store(mut self, content: Arc<dyn ContentStore>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn registry(mut self, registry: EntityKindRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn hook(mut self, hook: Arc<dyn WriteHook>) -> Self {
        self.hooks.register(hook);
        self
    }

    /// Metric instruments. Defaults to the global meter provider.
    pub fn metrics(mut self, metrics: ChainStateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Assemble the indexer, its queue, checkpoint manager and job runner.
    pub fn build(self) -> Result<Indexer, IndexerError> {
        let store = self
            .store
            .ok_or_else(|| IndexerError::Other("IndexerBuilder: no state store configured".into()))?;
        if self.config.queue.workers == 0 {
            return Err(IndexerError::Other("IndexerBuilder: workers must be at least 1".into()));
        }

        let metrics = self.metrics.unwrap_or_default();
        let jobs = self
            .jobs
            .unwrap_or_else(|| Arc::new(MemoryJobStore::new()));
        let queue = Arc::new(JobQueue::new(jobs, &self.config.queue).with_metrics(metrics.clone()));
        let checkpoints = self.content.map(|content| {
            Arc::new(CheckpointManager::new(
                Arc::clone(&store),
                content,
                self.config.checkpoint_interval,
                self.config.full_checkpoint_every,
                Duration::from_millis(self.config.content_store_timeout_ms),
            )
            .with_metrics(metrics.clone()))
        });
        let registry = Arc::new(self.registry);
        let indexer = Arc::new(
            StateIndexer::new(self.config, store, registry, self.hooks).with_metrics(metrics),
        );
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&indexer),
            Arc::clone(&queue),
            checkpoints.clone(),
        ));
        Ok(Indexer {
            indexer,
            queue,
            checkpoints,
            runner,
        })
    }
}

/// A fully wired indexer.
pub struct Indexer {
    pub indexer: Arc<StateIndexer>,
    pub queue: Arc<JobQueue>,
    pub checkpoints: Option<Arc<CheckpointManager>>,
    pub runner: Arc<JobRunner>,
}

impl Indexer {
    /// Worker pool draining the queue through the job runner.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.queue),
            self.runner.clone(),
            self.indexer.config().queue.workers,
        )
        .with_indexer(Arc::clone(&self.indexer))
    }
}
