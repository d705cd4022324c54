//! chainstate-core — reorg-aware, multi-version state indexing engine.
//!
//! # Architecture
//!
//! ```text
//! IndexerBuilder → Indexer
//!                    ├── JobQueue + WorkerPool  (block / event / checkpoint jobs)
//!                    ├── JobRunner              (jobs → StateIndexer calls)
//!                    ├── StateIndexer           (ingest, reorg lock, canonicalization)
//!                    │     ├── SyncPosition     (head / indexed / canonical / initial)
//!                    │     ├── Block ledger     (per-block progress, recorded chain)
//!                    │     ├── Entity store     (frothy versions + latest pointers)
//!                    │     └── Reorg resolver   (fork point, prune, revive)
//!                    ├── CheckpointManager      (content-addressed snapshots)
//!                    ├── ChainStateMetrics      (OpenTelemetry counters / gauges)
//!                    └── StateStore backend     (memory / SQLite)
//! ```

pub mod admin;
pub mod builder;
pub mod checkpoint;
pub mod content;
pub mod entity;
pub mod error;
pub mod handler;
pub mod indexer;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod reorg;
pub mod retry;
pub mod runner;
pub mod store;
pub mod sync;
pub mod types;
pub mod worker;

pub use builder::{Indexer, IndexerBuilder};
pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointManager, CheckpointSnapshot};
pub use content::{ContentStore, MemoryContentStore};
pub use entity::{LatestEntityPointer, VersionedEntity};
pub use error::IndexerError;
pub use handler::{EntityKindRegistry, HookRegistry, WriteEvent, WriteHook};
pub use indexer::{ApplyOutcome, IndexerConfig, IndexerState, StateIndexer};
pub use ledger::BlockLedgerEntry;
pub use metrics::ChainStateMetrics;
pub use queue::{Job, JobKind, JobQueue, JobStatus, JobStore, QueueConfig};
pub use reorg::{ReorgEvent, ReorgType};
pub use runner::JobRunner;
pub use store::{StateStore, StateTx};
pub use sync::{HeadUpdate, SyncPosition};
pub use types::{BlockNotification, BlockPtr, BlockRange, EntityMutation, EventMutations};
pub use worker::{JobHandler, WorkerPool};
