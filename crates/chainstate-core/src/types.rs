//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};

// ─── BlockPtr ─────────────────────────────────────────────────────────────────

/// A `(hash, number)` reference to a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPtr {
    /// Block hash (`0x…`).
    pub hash: String,
    /// Block number.
    pub number: u64,
}

impl BlockPtr {
    pub fn new(hash: impl Into<String>, number: u64) -> Self {
        Self {
            hash: hash.into(),
            number,
        }
    }
}

impl std::fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

// ─── BlockNotification ────────────────────────────────────────────────────────

/// A block announced by the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockNotification {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Number of events the decoding layer will deliver for this block.
    pub event_count: u32,
}

impl BlockNotification {
    pub fn ptr(&self) -> BlockPtr {
        BlockPtr::new(self.hash.clone(), self.number)
    }
}

// ─── EntityMutation ───────────────────────────────────────────────────────────

/// A request to write a new version of an entity at a block.
///
/// Produced by the contract-decoding layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMutation {
    /// Entity identifier (unique within its kind's logical table).
    pub entity_id: String,
    /// Logical table name, e.g. `"Pool"` or `"Token"`.
    pub entity_kind: String,
    /// Block the mutation happened in.
    pub block_hash: String,
    /// Full entity value after the mutation.
    pub payload: serde_json::Value,
}

/// All mutations produced by one event of a block, in event order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMutations {
    /// Position of the event inside its block (0-based).
    pub event_index: u32,
    pub mutations: Vec<EntityMutation>,
}

// ─── BlockRange ───────────────────────────────────────────────────────────────

/// Inclusive range of block numbers, used by range scans and range deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub low: u64,
    pub high: u64,
}

impl BlockRange {
    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    /// Every block strictly above `number`.
    pub fn above(number: u64) -> Self {
        Self {
            low: number.saturating_add(1),
            high: u64::MAX,
        }
    }

    pub fn contains(&self, number: u64) -> bool {
        number >= self.low && number <= self.high
    }

    pub fn is_empty(&self) -> bool {
        self.low > self.high
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
