//! Error types for the chainstate pipeline.

use thiserror::Error;

/// Errors that can occur while indexing, querying or checkpointing state.
#[derive(Debug, Error)]
pub enum IndexerError {
    // ─── Sync position misuse ────────────────────────────────────────────────
    #[error("Out of order: cannot move indexed pointer from block {current} back to {requested}")]
    OutOfOrder { current: u64, requested: u64 },

    #[error("Canonical block {requested} is beyond latest indexed block {indexed}")]
    BeyondIndexed { requested: u64, indexed: u64 },

    // ─── Block ledger consistency ────────────────────────────────────────────
    #[error("Block {hash} is already fully processed")]
    DuplicateBlock { hash: String },

    #[error("Unknown block {hash}")]
    UnknownBlock { hash: String },

    #[error("Event for block {hash} arrived before the block was opened")]
    BlockNotOpened { hash: String },

    #[error("Block {hash} incomplete: {processed}/{expected} events processed")]
    IncompleteBlock {
        hash: String,
        processed: u32,
        expected: u32,
    },

    #[error("No indexed block at height {block_number}")]
    NoBlockAtHeight { block_number: u64 },

    // ─── Reorgs ──────────────────────────────────────────────────────────────
    #[error("Parent mismatch at block {block_number}: expected parent {expected}, got {actual}")]
    ParentMismatch {
        block_number: u64,
        expected: String,
        actual: String,
    },

    #[error("Parent {parent_hash} of block {block_number} has not been indexed yet")]
    ParentUnknown {
        block_number: u64,
        parent_hash: String,
    },

    #[error("Reorg too deep: fork point {fork_point} is below canonical block {canonical}")]
    ReorgTooDeep { fork_point: u64, canonical: u64 },

    #[error("Event {event_index} of block {hash} arrived before event {expected}")]
    EventOutOfOrder {
        hash: String,
        event_index: u32,
        expected: u32,
    },

    // ─── Entities ────────────────────────────────────────────────────────────
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Entity kind '{0}' is not registered")]
    UnknownEntityKind(String),

    // ─── Collaborators ───────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Content store error: {0}")]
    ContentStore(String),

    #[error("Timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error is a parent-hash mismatch (resolved by the reorg resolver).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ParentMismatch { .. })
    }

    /// Returns `true` if the job that produced this error should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ParentUnknown { .. }
                | Self::BlockNotOpened { .. }
                | Self::EventOutOfOrder { .. }
                | Self::Storage(_)
                | Self::ContentStore(_)
                | Self::Timeout { .. }
        )
    }

    /// Returns `true` if processing must halt until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReorgTooDeep { .. })
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
