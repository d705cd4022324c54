//! SQLite storage backend for ChainState.
//!
//! Persists the sync position, block ledger, entity versions, latest
//! pointers, checkpoint records and the job queue to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainstate_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./state.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```
//!
//! State transactions are serialized by a store-wide writer lock, so a
//! block application never races another one into `SQLITE_BUSY`. Job
//! operations run as single statements straight on the pool.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use chainstate_core::checkpoint::{Checkpoint, CheckpointKind};
use chainstate_core::entity::{LatestEntityPointer, VersionedEntity};
use chainstate_core::error::IndexerError;
use chainstate_core::ledger::BlockLedgerEntry;
use chainstate_core::queue::{Job, JobKind, JobStatus, JobStore, NewJob};
use chainstate_core::store::{RangeDeletion, StateStore, StateTx};
use chainstate_core::sync::SyncPosition;
use chainstate_core::types::{BlockPtr, BlockRange};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_position (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        head_hash        TEXT    NOT NULL,
        head_number      INTEGER NOT NULL,
        indexed_hash     TEXT    NOT NULL,
        indexed_number   INTEGER NOT NULL,
        canonical_hash   TEXT    NOT NULL,
        canonical_number INTEGER NOT NULL,
        initial_hash     TEXT    NOT NULL,
        initial_number   INTEGER NOT NULL,
        checkpoint_hash   TEXT,
        checkpoint_number INTEGER,
        updated_at       INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS blocks (
        block_hash            TEXT    PRIMARY KEY,
        block_number          INTEGER NOT NULL,
        parent_hash           TEXT    NOT NULL,
        event_count           INTEGER NOT NULL,
        processed_event_count INTEGER NOT NULL,
        is_complete           INTEGER NOT NULL,
        is_pruned             INTEGER NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_blocks_number ON blocks (block_number);",
    "CREATE TABLE IF NOT EXISTS versions (
        entity_id    TEXT    NOT NULL,
        entity_kind  TEXT    NOT NULL,
        block_hash   TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        payload      TEXT    NOT NULL,
        is_pruned    INTEGER NOT NULL,
        seq          INTEGER NOT NULL,
        PRIMARY KEY (entity_id, block_hash)
    );",
    "CREATE INDEX IF NOT EXISTS idx_versions_block ON versions (block_hash);",
    "CREATE INDEX IF NOT EXISTS idx_versions_number ON versions (block_number);",
    "CREATE TABLE IF NOT EXISTS latest (
        entity_id    TEXT    PRIMARY KEY,
        entity_kind  TEXT    NOT NULL,
        block_hash   TEXT    NOT NULL,
        block_number INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        block_hash      TEXT    PRIMARY KEY,
        block_number    INTEGER NOT NULL,
        content_address TEXT    NOT NULL,
        kind            TEXT    NOT NULL,
        created_at      INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS counters (
        name  TEXT    PRIMARY KEY,
        value INTEGER NOT NULL
    );",
    "INSERT OR IGNORE INTO counters (name, value) VALUES ('version_seq', 0);",
    "CREATE TABLE IF NOT EXISTS jobs (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        kind       TEXT    NOT NULL,
        payload    TEXT    NOT NULL,
        dedupe_key TEXT,
        attempts   INTEGER NOT NULL,
        status     TEXT    NOT NULL,
        priority   INTEGER NOT NULL,
        run_at     INTEGER NOT NULL,
        last_error TEXT,
        created_at INTEGER NOT NULL
    );",
    // Only one active job per dedupe key.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_key ON jobs (dedupe_key)
        WHERE dedupe_key IS NOT NULL AND status IN ('queued', 'running', 'failed');",
    "CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs (status, run_at);",
];

fn db_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite stores integers as `i64`; `u64::MAX` range ends clamp to `i64::MAX`.
fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(v: i64, column: &str) -> Result<u64, IndexerError> {
    u64::try_from(v).map_err(|_| IndexerError::Storage(format!("negative value in column {column}")))
}

fn get_u64(row: &SqliteRow, column: &str) -> Result<u64, IndexerError> {
    let v: i64 = row.try_get(column).map_err(db_err)?;
    to_u64(v, column)
}

fn get_u32(row: &SqliteRow, column: &str) -> Result<u32, IndexerError> {
    let v: i64 = row.try_get(column).map_err(db_err)?;
    u32::try_from(v).map_err(|_| IndexerError::Storage(format!("value out of range in column {column}")))
}

fn get_str(row: &SqliteRow, column: &str) -> Result<String, IndexerError> {
    row.try_get(column).map_err(db_err)
}

fn ptr(row: &SqliteRow, hash: &str, number: &str) -> Result<BlockPtr, IndexerError> {
    Ok(BlockPtr::new(get_str(row, hash)?, get_u64(row, number)?))
}

fn block_from_row(row: &SqliteRow) -> Result<BlockLedgerEntry, IndexerError> {
    Ok(BlockLedgerEntry {
        block_hash: get_str(row, "block_hash")?,
        block_number: get_u64(row, "block_number")?,
        parent_hash: get_str(row, "parent_hash")?,
        event_count: get_u32(row, "event_count")?,
        processed_event_count: get_u32(row, "processed_event_count")?,
        is_complete: row.try_get("is_complete").map_err(db_err)?,
        is_pruned: row.try_get("is_pruned").map_err(db_err)?,
    })
}

fn version_from_row(row: &SqliteRow) -> Result<VersionedEntity, IndexerError> {
    let payload: String = get_str(row, "payload")?;
    Ok(VersionedEntity {
        entity_id: get_str(row, "entity_id")?,
        entity_kind: get_str(row, "entity_kind")?,
        block_hash: get_str(row, "block_hash")?,
        block_number: get_u64(row, "block_number")?,
        payload: serde_json::from_str(&payload)?,
        is_pruned: row.try_get("is_pruned").map_err(db_err)?,
        seq: get_u64(row, "seq")?,
    })
}

fn latest_from_row(row: &SqliteRow) -> Result<LatestEntityPointer, IndexerError> {
    Ok(LatestEntityPointer {
        entity_id: get_str(row, "entity_id")?,
        entity_kind: get_str(row, "entity_kind")?,
        block_hash: get_str(row, "block_hash")?,
        block_number: get_u64(row, "block_number")?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, IndexerError> {
    let kind: String = get_str(row, "kind")?;
    Ok(Checkpoint {
        block_hash: get_str(row, "block_hash")?,
        block_number: get_u64(row, "block_number")?,
        content_address: get_str(row, "content_address")?,
        kind: kind.parse::<CheckpointKind>()?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job, IndexerError> {
    let payload: String = get_str(row, "payload")?;
    Ok(Job {
        id: get_u64(row, "id")?,
        kind: get_str(row, "kind")?.parse::<JobKind>()?,
        payload: serde_json::from_str(&payload)?,
        dedupe_key: row.try_get("dedupe_key").map_err(db_err)?,
        attempts: get_u32(row, "attempts")?,
        status: get_str(row, "status")?.parse::<JobStatus>()?,
        priority: row.try_get("priority").map_err(db_err)?,
        run_at: row.try_get("run_at").map_err(db_err)?,
        last_error: row.try_get("last_error").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

/// SQLite-backed [`StateStore`] and [`JobStore`].
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./state.db"`) or a full
    /// SQLite URL (`"sqlite:./state.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .map_err(db_err)?;

        let storage = Self::from_pool(pool);
        storage.init_schema().await?;
        debug!(path, "sqlite state store opened");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `sqlite::memory:` sees its own database, so the
    /// pool is pinned to a single connection that never expires. All data
    /// is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let storage = Self::from_pool(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Close the pool, waiting for open connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ─── StateStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl StateStore for SqliteStorage {
    async fn begin(&self) -> Result<Box<dyn StateTx>, IndexerError> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(SqliteStateTx { tx, _guard: guard }))
    }
}

/// Transaction over a [`SqliteStorage`]. Dropping it rolls back.
pub struct SqliteStateTx {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl SqliteStateTx {
    async fn fetch_blocks(
        &mut self,
        sql: &str,
        a: i64,
        b: Option<i64>,
    ) -> Result<Vec<BlockLedgerEntry>, IndexerError> {
        let mut query = sqlx::query(sql).bind(a);
        if let Some(b) = b {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&mut *self.tx).await.map_err(db_err)?;
        rows.iter().map(block_from_row).collect()
    }

    async fn fetch_versions(
        &mut self,
        sql: &str,
        binds: &[&str],
    ) -> Result<Vec<VersionedEntity>, IndexerError> {
        let mut query = sqlx::query(sql);
        for b in binds {
            query = query.bind(*b);
        }
        let rows = query.fetch_all(&mut *self.tx).await.map_err(db_err)?;
        rows.iter().map(version_from_row).collect()
    }
}

#[async_trait]
impl StateTx for SqliteStateTx {
    async fn sync_position(&mut self) -> Result<Option<SyncPosition>, IndexerError> {
        let row = sqlx::query("SELECT * FROM sync_position WHERE id = 1")
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let checkpoint_hash: Option<String> = row.try_get("checkpoint_hash").map_err(db_err)?;
        let checkpoint_number = row
            .try_get::<Option<i64>, _>("checkpoint_number")
            .map_err(db_err)?
            .map(|n| to_u64(n, "checkpoint_number"))
            .transpose()?;
        Ok(Some(SyncPosition {
            chain_head: ptr(&row, "head_hash", "head_number")?,
            latest_indexed: ptr(&row, "indexed_hash", "indexed_number")?,
            latest_canonical: ptr(&row, "canonical_hash", "canonical_number")?,
            initial_indexed: ptr(&row, "initial_hash", "initial_number")?,
            latest_checkpoint: checkpoint_hash
                .zip(checkpoint_number)
                .map(|(hash, number)| BlockPtr::new(hash, number)),
        }))
    }

    async fn save_sync_position(&mut self, position: &SyncPosition) -> Result<(), IndexerError> {
        let checkpoint = position.latest_checkpoint.as_ref();
        sqlx::query(
            "INSERT OR REPLACE INTO sync_position
             (id, head_hash, head_number, indexed_hash, indexed_number,
              canonical_hash, canonical_number, initial_hash, initial_number,
              checkpoint_hash, checkpoint_number, updated_at)
             VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&position.chain_head.hash)
        .bind(to_i64(position.chain_head.number))
        .bind(&position.latest_indexed.hash)
        .bind(to_i64(position.latest_indexed.number))
        .bind(&position.latest_canonical.hash)
        .bind(to_i64(position.latest_canonical.number))
        .bind(&position.initial_indexed.hash)
        .bind(to_i64(position.initial_indexed.number))
        .bind(checkpoint.map(|c| c.hash.clone()))
        .bind(checkpoint.map(|c| to_i64(c.number)))
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn block(&mut self, hash: &str) -> Result<Option<BlockLedgerEntry>, IndexerError> {
        let row = sqlx::query("SELECT * FROM blocks WHERE block_hash = ?")
            .bind(hash)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn save_block(&mut self, entry: &BlockLedgerEntry) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO blocks
             (block_hash, block_number, parent_hash, event_count,
              processed_event_count, is_complete, is_pruned)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.block_hash)
        .bind(to_i64(entry.block_number))
        .bind(&entry.parent_hash)
        .bind(i64::from(entry.event_count))
        .bind(i64::from(entry.processed_event_count))
        .bind(entry.is_complete)
        .bind(entry.is_pruned)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn blocks_at_height(
        &mut self,
        number: u64,
    ) -> Result<Vec<BlockLedgerEntry>, IndexerError> {
        self.fetch_blocks(
            "SELECT * FROM blocks WHERE block_number = ? ORDER BY block_hash",
            to_i64(number),
            None,
        )
        .await
    }

    async fn blocks_in_range(
        &mut self,
        range: BlockRange,
    ) -> Result<Vec<BlockLedgerEntry>, IndexerError> {
        self.fetch_blocks(
            "SELECT * FROM blocks WHERE block_number BETWEEN ? AND ?
             ORDER BY block_number, block_hash",
            to_i64(range.low),
            Some(to_i64(range.high)),
        )
        .await
    }

    async fn insert_version(&mut self, version: &VersionedEntity) -> Result<u64, IndexerError> {
        let row = sqlx::query(
            "UPDATE counters SET value = value + 1 WHERE name = 'version_seq' RETURNING value",
        )
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        let seq = get_u64(&row, "value")?;

        sqlx::query(
            "INSERT OR REPLACE INTO versions
             (entity_id, entity_kind, block_hash, block_number, payload, is_pruned, seq)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&version.entity_id)
        .bind(&version.entity_kind)
        .bind(&version.block_hash)
        .bind(to_i64(version.block_number))
        .bind(serde_json::to_string(&version.payload)?)
        .bind(version.is_pruned)
        .bind(to_i64(seq))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(seq)
    }

    async fn version(
        &mut self,
        entity_id: &str,
        block_hash: &str,
    ) -> Result<Option<VersionedEntity>, IndexerError> {
        let mut found = self
            .fetch_versions(
                "SELECT * FROM versions WHERE entity_id = ? AND block_hash = ?",
                &[entity_id, block_hash],
            )
            .await?;
        Ok(found.pop())
    }

    async fn versions_of(&mut self, entity_id: &str) -> Result<Vec<VersionedEntity>, IndexerError> {
        self.fetch_versions(
            "SELECT * FROM versions WHERE entity_id = ? ORDER BY block_number, seq",
            &[entity_id],
        )
        .await
    }

    async fn set_versions_pruned(
        &mut self,
        block_hash: &str,
        pruned: bool,
    ) -> Result<Vec<String>, IndexerError> {
        let rows = sqlx::query(
            "UPDATE versions SET is_pruned = ? WHERE block_hash = ? RETURNING entity_id",
        )
        .bind(pruned)
        .bind(block_hash)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| get_str(r, "entity_id")).collect()
    }

    async fn versions_in_range(
        &mut self,
        range: BlockRange,
    ) -> Result<Vec<VersionedEntity>, IndexerError> {
        let rows = sqlx::query(
            "SELECT * FROM versions
             WHERE is_pruned = 0 AND block_number BETWEEN ? AND ?
             ORDER BY block_number, seq",
        )
        .bind(to_i64(range.low))
        .bind(to_i64(range.high))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(version_from_row).collect()
    }

    async fn latest(
        &mut self,
        entity_id: &str,
    ) -> Result<Option<LatestEntityPointer>, IndexerError> {
        let row = sqlx::query("SELECT * FROM latest WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(latest_from_row).transpose()
    }

    async fn save_latest(&mut self, pointer: &LatestEntityPointer) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO latest (entity_id, entity_kind, block_hash, block_number)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&pointer.entity_id)
        .bind(&pointer.entity_kind)
        .bind(&pointer.block_hash)
        .bind(to_i64(pointer.block_number))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_latest(&mut self, entity_id: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM latest WHERE entity_id = ?")
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn all_latest(&mut self) -> Result<Vec<LatestEntityPointer>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM latest ORDER BY entity_id")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;
        rows.iter().map(latest_from_row).collect()
    }

    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (block_hash, block_number, content_address, kind, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.block_hash)
        .bind(to_i64(checkpoint.block_number))
        .bind(&checkpoint.content_address)
        .bind(checkpoint.kind.to_string())
        .bind(checkpoint.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        debug!(
            block = checkpoint.block_number,
            address = %checkpoint.content_address,
            "checkpoint recorded"
        );
        Ok(())
    }

    async fn checkpoints(&mut self) -> Result<Vec<Checkpoint>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM checkpoints ORDER BY block_number")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn delete_checkpoints(&mut self, range: BlockRange) -> Result<u64, IndexerError> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE block_number BETWEEN ? AND ?")
            .bind(to_i64(range.low))
            .bind(to_i64(range.high))
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_range(&mut self, range: BlockRange) -> Result<RangeDeletion, IndexerError> {
        let (low, high) = (to_i64(range.low), to_i64(range.high));

        let rows = sqlx::query(
            "SELECT DISTINCT entity_id FROM versions WHERE block_number BETWEEN ? AND ?",
        )
        .bind(low)
        .bind(high)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        let entity_ids = rows
            .iter()
            .map(|r| get_str(r, "entity_id"))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let versions = sqlx::query("DELETE FROM versions WHERE block_number BETWEEN ? AND ?")
            .bind(low)
            .bind(high)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        let blocks = sqlx::query("DELETE FROM blocks WHERE block_number BETWEEN ? AND ?")
            .bind(low)
            .bind(high)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        let checkpoints = self.delete_checkpoints(range).await?;

        debug!(low = range.low, high = range.high, blocks, versions, checkpoints, "range deleted");
        Ok(RangeDeletion {
            blocks,
            versions,
            checkpoints,
            entity_ids,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), IndexerError> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), IndexerError> {
        self.tx.rollback().await.map_err(db_err)
    }
}

// ─── JobStore impl ───────────────────────────────────────────────────────────

#[async_trait]
impl JobStore for SqliteStorage {
    async fn insert_unique(&self, job: &NewJob, now: i64) -> Result<(Job, bool), IndexerError> {
        let payload = serde_json::to_string(&job.payload)?;
        // The partial unique index turns a duplicate active key into a no-op.
        // A holder that finishes between the insert and the lookup leaves
        // nothing to return, so try again.
        for _ in 0..3 {
            let inserted = sqlx::query(
                "INSERT INTO jobs
                 (kind, payload, dedupe_key, attempts, status, priority, run_at, last_error, created_at)
                 VALUES (?, ?, ?, 0, 'queued', ?, ?, NULL, ?)
                 ON CONFLICT DO NOTHING
                 RETURNING *",
            )
            .bind(job.kind.as_str())
            .bind(&payload)
            .bind(&job.dedupe_key)
            .bind(job.priority)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = inserted {
                return Ok((job_from_row(&row)?, true));
            }

            let existing = sqlx::query(
                "SELECT * FROM jobs
                 WHERE dedupe_key = ? AND status IN ('queued', 'running', 'failed')",
            )
            .bind(&job.dedupe_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(row) = existing {
                return Ok((job_from_row(&row)?, false));
            }
        }
        Err(IndexerError::Storage(format!(
            "could not enqueue job with key {:?}",
            job.dedupe_key
        )))
    }

    async fn claim_next(&self, now: i64) -> Result<Option<Job>, IndexerError> {
        let row = sqlx::query(
            "UPDATE jobs SET status = 'running'
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status IN ('queued', 'failed') AND run_at <= ?
                 ORDER BY priority DESC, run_at, id
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update(&self, job: &Job) -> Result<(), IndexerError> {
        let result = sqlx::query(
            "UPDATE jobs SET attempts = ?, status = ?, run_at = ?, last_error = ?
             WHERE id = ?",
        )
        .bind(i64::from(job.attempts))
        .bind(job.status.as_str())
        .bind(job.run_at)
        .bind(&job.last_error)
        .bind(to_i64(job.id))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(IndexerError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(to_i64(id))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<Option<Job>, IndexerError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(to_i64(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, IndexerError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn requeue_running(&self) -> Result<u64, IndexerError> {
        let result = sqlx::query("UPDATE jobs SET status = 'queued' WHERE status = 'running'")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn clear_active(&self) -> Result<u64, IndexerError> {
        let result =
            sqlx::query("DELETE FROM jobs WHERE status IN ('queued', 'running', 'failed')")
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainstate_core::handler::{EntityKindRegistry, HookRegistry};
    use chainstate_core::indexer::{ApplyOutcome, IndexerConfig, StateIndexer};
    use chainstate_core::queue::{JobQueue, QueueConfig};
    use chainstate_core::types::{BlockNotification, EntityMutation, EventMutations};
    use serde_json::json;

    fn entry(number: u64, hash: &str) -> BlockLedgerEntry {
        BlockLedgerEntry::new(&BlockNotification {
            number,
            hash: hash.into(),
            parent_hash: format!("0x{}", number.saturating_sub(1)),
            event_count: 0,
        })
    }

    fn version(id: &str, hash: &str, number: u64) -> VersionedEntity {
        VersionedEntity {
            entity_id: id.into(),
            entity_kind: "Token".into(),
            block_hash: hash.into(),
            block_number: number,
            payload: json!({ "at": number }),
            is_pruned: false,
            seq: 0,
        }
    }

    // ── State transactions ────────────────────────────────────────────────────

    #[tokio::test]
    async fn sync_position_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();

        let mut pos = SyncPosition::new(BlockPtr::new("0xa", 1));
        pos.set_checkpoint(Some(BlockPtr::new("0xa", 1)));
        let mut tx = store.begin().await.unwrap();
        assert!(tx.sync_position().await.unwrap().is_none());
        tx.save_sync_position(&pos).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.sync_position().await.unwrap(), Some(pos));
    }

    #[tokio::test]
    async fn negative_block_numbers_are_rejected() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut pos = SyncPosition::new(BlockPtr::new("0xa", 1));
        pos.set_checkpoint(Some(BlockPtr::new("0xa", 1)));
        let mut tx = store.begin().await.unwrap();
        tx.save_sync_position(&pos).await.unwrap();
        tx.commit().await.unwrap();

        sqlx::query("UPDATE sync_position SET checkpoint_number = -1")
            .execute(&store.pool)
            .await
            .unwrap();
        let mut tx = store.begin().await.unwrap();
        let err = tx.sync_position().await.unwrap_err();
        assert!(matches!(err, IndexerError::Storage(ref m) if m.contains("checkpoint_number")));
        tx.rollback().await.unwrap();

        sqlx::query("UPDATE sync_position SET checkpoint_number = 1, indexed_number = -5")
            .execute(&store.pool)
            .await
            .unwrap();
        let mut tx = store.begin().await.unwrap();
        assert!(matches!(tx.sync_position().await, Err(IndexerError::Storage(_))));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = SqliteStorage::in_memory().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.save_block(&entry(1, "0xa")).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.save_block(&entry(2, "0xb")).await.unwrap();
            // dropped without commit
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.block("0xa").await.unwrap().is_none());
        assert!(tx.block("0xb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blocks_by_height_and_range() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        for (n, h) in [(1, "0x1"), (2, "0x2"), (2, "0x2b"), (3, "0x3")] {
            tx.save_block(&entry(n, h)).await.unwrap();
        }

        let mut pruned = entry(2, "0x2b");
        pruned.is_pruned = true;
        tx.save_block(&pruned).await.unwrap();

        let at_two = tx.blocks_at_height(2).await.unwrap();
        assert_eq!(at_two.len(), 2);
        assert!(at_two.iter().any(|b| b.is_pruned));

        let above = tx.blocks_in_range(BlockRange::above(1)).await.unwrap();
        let numbers: Vec<_> = above.iter().map(|b| b.block_number).collect();
        assert_eq!(numbers, vec![2, 2, 3]);
    }

    #[tokio::test]
    async fn versions_seq_prune_and_range() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();

        let a = tx.insert_version(&version("x", "0x1", 1)).await.unwrap();
        let b = tx.insert_version(&version("x", "0x2", 2)).await.unwrap();
        let c = tx.insert_version(&version("x", "0x1", 1)).await.unwrap();
        assert!(a < b && b < c);
        assert_eq!(tx.versions_of("x").await.unwrap().len(), 2);
        assert_eq!(tx.version("x", "0x1").await.unwrap().unwrap().seq, c);
        assert_eq!(
            tx.version("x", "0x2").await.unwrap().unwrap().payload,
            json!({ "at": 2 })
        );

        let ids = tx.set_versions_pruned("0x2", true).await.unwrap();
        assert_eq!(ids, vec!["x".to_string()]);
        let live = tx.versions_in_range(BlockRange::new(0, 10)).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].block_hash, "0x1");
    }

    #[tokio::test]
    async fn delete_range_clamps_upper_bound() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        for (n, h) in [(1, "0x1"), (2, "0x2"), (3, "0x3")] {
            tx.save_block(&entry(n, h)).await.unwrap();
            tx.save_checkpoint(&Checkpoint {
                block_hash: h.into(),
                block_number: n,
                content_address: format!("sha256:{n:064x}"),
                kind: CheckpointKind::Full,
                created_at: 0,
            })
            .await
            .unwrap();
        }
        tx.insert_version(&version("x", "0x1", 1)).await.unwrap();
        tx.insert_version(&version("x", "0x2", 2)).await.unwrap();
        tx.insert_version(&version("y", "0x3", 3)).await.unwrap();

        let deleted = tx.delete_range(BlockRange::above(1)).await.unwrap();
        assert_eq!(deleted.blocks, 2);
        assert_eq!(deleted.versions, 2);
        assert_eq!(deleted.checkpoints, 2);
        assert_eq!(
            deleted.entity_ids.into_iter().collect::<Vec<_>>(),
            vec!["x".to_string(), "y".to_string()]
        );
        assert_eq!(tx.checkpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn latest_pointers() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();

        let v = version("x", "0x1", 1);
        tx.save_latest(&LatestEntityPointer::from(&v)).await.unwrap();
        tx.save_latest(&LatestEntityPointer::from(&version("y", "0x1", 1)))
            .await
            .unwrap();
        assert_eq!(tx.latest("x").await.unwrap().unwrap().block_hash, "0x1");
        assert_eq!(tx.all_latest().await.unwrap().len(), 2);

        tx.remove_latest("x").await.unwrap();
        assert!(tx.latest("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn indexer_runs_on_sqlite() {
        let store = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let indexer = StateIndexer::new(
            IndexerConfig {
                max_reorg_depth: 2,
                ..IndexerConfig::default()
            },
            store,
            Arc::new(EntityKindRegistry::builder().kind("Token").build()),
            HookRegistry::new(),
        );

        for n in 1..=4u64 {
            let hash = format!("0x{n}");
            let out = indexer
                .ingest_block(
                    &BlockNotification {
                        number: n,
                        hash: hash.clone(),
                        parent_hash: format!("0x{}", n - 1),
                        event_count: 1,
                    },
                    &[EventMutations {
                        event_index: 0,
                        mutations: vec![EntityMutation {
                            entity_id: "x".into(),
                            entity_kind: "Token".into(),
                            block_hash: hash,
                            payload: json!(n),
                        }],
                    }],
                )
                .await
                .unwrap();
            assert!(matches!(out, ApplyOutcome::Completed { .. }));
        }

        // Sibling of block 4 on top of block 3.
        let out = indexer
            .ingest_block(
                &BlockNotification {
                    number: 4,
                    hash: "0x4b".into(),
                    parent_hash: "0x3".into(),
                    event_count: 0,
                },
                &[],
            )
            .await
            .unwrap();
        match out {
            ApplyOutcome::Completed { reorg, .. } => {
                assert_eq!(reorg.unwrap().number, 3)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(indexer.get_latest("x").await.unwrap().payload, json!(3));
        let pos = indexer.get_sync_position().await.unwrap().unwrap();
        assert_eq!(pos.latest_indexed.hash, "0x4b");
        assert_eq!(pos.latest_canonical.number, 2);
    }

    // ── Job store ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn job_dedupe_and_claim_order() {
        let store = SqliteStorage::in_memory().await.unwrap();

        let (a, fresh) = store
            .insert_unique(&NewJob::new(JobKind::Block, json!({ "n": 1 })).dedupe_key("block:0x1"), 10)
            .await
            .unwrap();
        assert!(fresh);
        let (dup, fresh) = store
            .insert_unique(&NewJob::new(JobKind::Block, json!({ "n": 1 })).dedupe_key("block:0x1"), 11)
            .await
            .unwrap();
        assert!(!fresh);
        assert_eq!(dup.id, a.id);

        let (urgent, _) = store
            .insert_unique(&NewJob::new(JobKind::Event, json!({})).priority(5), 20)
            .await
            .unwrap();

        assert!(store.claim_next(5).await.unwrap().is_none());
        let first = store.claim_next(30).await.unwrap().unwrap();
        assert_eq!(first.id, urgent.id);
        assert_eq!(first.status, JobStatus::Running);
        let second = store.claim_next(30).await.unwrap().unwrap();
        assert_eq!(second.id, a.id);
        assert!(store.claim_next(30).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_job_releases_dedupe_key() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let job = NewJob::new(JobKind::Checkpoint, json!({})).dedupe_key("checkpoint");

        let (mut first, _) = store.insert_unique(&job, 0).await.unwrap();
        first.status = JobStatus::Dead;
        first.last_error = Some("boom".into());
        store.update(&first).await.unwrap();

        let (second, fresh) = store.insert_unique(&job, 1).await.unwrap();
        assert!(fresh);
        assert_ne!(second.id, first.id);
        assert_eq!(store.list(Some(JobStatus::Dead)).await.unwrap().len(), 1);
        assert_eq!(
            store.get(first.id).await.unwrap().unwrap().last_error.as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn queue_recover_and_reset_on_sqlite() {
        let store = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let queue = JobQueue::new(store.clone(), &QueueConfig::default());

        queue.enqueue(NewJob::new(JobKind::Block, json!({}))).await.unwrap();
        queue.enqueue(NewJob::new(JobKind::Event, json!({}))).await.unwrap();
        let claimed = queue.pull().await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);

        assert_eq!(queue.recover().await.unwrap(), 1);
        assert!(store.list(Some(JobStatus::Running)).await.unwrap().is_empty());

        let job = queue.pull().await.unwrap().unwrap();
        queue.complete(&job).await.unwrap();
        assert!(store.get(job.id).await.unwrap().is_none());

        assert_eq!(queue.reset().await.unwrap(), 1);
        assert!(store.list(None).await.unwrap().is_empty());
    }
}
