//! chainstate CLI — inspect indexer state and run recovery commands.
//!
//! # Commands
//! ```text
//! chainstate status
//! chainstate block      <hash>
//! chainstate entity     <id> [--at <hash> | --as-of <hash>]
//! chainstate jobs       [--status dead]
//! chainstate checkpoint list|create|inspect|restore
//! chainstate reset      state --block-number <N> | checkpoints --start <A> --end <B> | job-queue
//! chainstate info
//! ```
//!
//! Every command except `info` works on the SQLite database given by `--db`
//! (default `./chainstate.db`). Recovery commands must not run while an
//! indexer is processing the same database. With `--otlp-endpoint`, the
//! metrics recorded by a command (and the gauges `status` publishes) are
//! pushed to an OTLP collector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use chainstate_core::checkpoint::{CheckpointKind, CheckpointManager, CheckpointSnapshot};
use chainstate_core::handler::EntityKindRegistry;
use chainstate_core::indexer::IndexerConfig;
use chainstate_core::queue::{JobQueue, JobStatus, JobStore, QueueConfig};
use chainstate_core::store::StateStore;
use chainstate_core::{admin, entity, ChainStateMetrics};
use chainstate_storage::{FsContentStore, SqliteStorage};

mod logging;
mod telemetry;

use logging::{init_tracing, LogConfig};
use telemetry::init_metrics;

#[derive(Parser)]
#[command(
    name = "chainstate",
    about = "ChainState CLI: reorg-aware blockchain state indexer",
    version
)]
struct Cli {
    /// SQLite database (path or sqlite: URL)
    #[arg(long, global = true, default_value = "./chainstate.db")]
    db: String,

    /// Enable debug logging for ChainState crates
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Push metrics to this OTLP/HTTP endpoint (e.g. http://localhost:4318/v1/metrics)
    #[arg(long, global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the sync position
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show processing progress of a block
    Block {
        /// Block hash
        hash: String,
    },

    /// Show an entity: latest, at a block, or as seen from a block
    Entity {
        /// Entity ID
        id: String,
        /// Version written at exactly this block hash
        #[arg(long, conflicts_with = "as_of")]
        at: Option<String>,
        /// Newest version on the branch ending at this block hash
        #[arg(long)]
        as_of: Option<String>,
    },

    /// List jobs in the queue
    Jobs {
        /// Filter by status: queued | running | failed | dead
        #[arg(long)]
        status: Option<String>,
    },

    /// Checkpoint management
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Recovery commands (stop the indexer first)
    Reset {
        #[command(subcommand)]
        action: ResetAction,
    },

    /// Show ChainState defaults and capabilities
    Info,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List recorded checkpoints
    List,
    /// Checkpoint a canonical block now
    Create {
        /// Canonical block number (default: latest canonical)
        #[arg(long)]
        block_number: Option<u64>,
        /// Force a full snapshot instead of following the diff schedule
        #[arg(long)]
        full: bool,
        #[command(flatten)]
        blobs: BlobArgs,
    },
    /// Fetch a snapshot, verify its content address and print it
    Inspect {
        /// Content address (sha256:…)
        #[arg(long)]
        address: String,
        /// Print the whole snapshot as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        blobs: BlobArgs,
    },
    /// Seed an empty database from a checkpoint
    Restore {
        /// Content address (sha256:…)
        #[arg(long)]
        address: String,
        #[command(flatten)]
        blobs: BlobArgs,
        #[command(flatten)]
        kinds: KindArgs,
    },
}

#[derive(Subcommand)]
enum ResetAction {
    /// Roll the database back to a block
    State {
        #[arg(long)]
        block_number: u64,
        #[command(flatten)]
        kinds: KindArgs,
    },
    /// Delete checkpoints recorded for blocks in start..=end
    Checkpoints {
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
    },
    /// Drop every queued, running and failed job
    #[command(name = "job-queue")]
    JobQueue,
}

#[derive(Args)]
struct BlobArgs {
    /// Directory of the filesystem content store
    #[arg(long, default_value = "./chainstate-blobs")]
    blobs: String,
}

/// Entity kinds, needed wherever latest pointers are rebuilt.
#[derive(Args)]
struct KindArgs {
    /// Entity kind with a latest view (repeatable)
    #[arg(long = "kind")]
    kinds: Vec<String>,
    /// Append-only entity kind (repeatable)
    #[arg(long = "versions-only")]
    versions_only: Vec<String>,
}

impl KindArgs {
    fn registry(&self) -> EntityKindRegistry {
        let mut builder = EntityKindRegistry::builder();
        for k in &self.kinds {
            builder = builder.kind(k);
        }
        for k in &self.versions_only {
            builder = builder.versions_only(k);
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig::from_flags(cli.verbose, cli.log_json));
    let exporter = cli.otlp_endpoint.as_deref().map(init_metrics).transpose()?;

    let store = match cli.command {
        Commands::Info => {
            cmd_info();
            if let Some(exporter) = exporter {
                exporter.shutdown();
            }
            return Ok(());
        }
        _ => {
            tracing::debug!(db = %cli.db, "opening database");
            Arc::new(
                SqliteStorage::open(&cli.db)
                    .await
                    .with_context(|| format!("failed to open database '{}'", cli.db))?,
            )
        }
    };

    let result = match cli.command {
        Commands::Status { json } => cmd_status(store.clone(), json).await,
        Commands::Block { hash } => cmd_block(store.as_ref(), &hash).await,
        Commands::Entity { id, at, as_of } => {
            cmd_entity(store.as_ref(), &id, at.as_deref(), as_of.as_deref()).await
        }
        Commands::Jobs { status } => cmd_jobs(store.as_ref(), status.as_deref()).await,
        Commands::Checkpoint { action } => match action {
            CheckpointAction::List => cmd_checkpoint_list(store.as_ref()).await,
            CheckpointAction::Create {
                block_number,
                full,
                blobs,
            } => cmd_checkpoint_create(store.clone(), block_number, full, &blobs).await,
            CheckpointAction::Inspect {
                address,
                json,
                blobs,
            } => cmd_checkpoint_inspect(store.clone(), &address, json, &blobs).await,
            CheckpointAction::Restore {
                address,
                blobs,
                kinds,
            } => cmd_checkpoint_restore(store.clone(), &address, &blobs, &kinds).await,
        },
        Commands::Reset { action } => match action {
            ResetAction::State {
                block_number,
                kinds,
            } => cmd_reset_state(store.as_ref(), block_number, &kinds).await,
            ResetAction::Checkpoints { start, end } => {
                let deleted = admin::reset_checkpoint_state(store.as_ref(), start, end).await?;
                println!("Deleted {deleted} checkpoint(s) in {start}..={end}");
                Ok(())
            }
            ResetAction::JobQueue => {
                let queue = JobQueue::new(store.clone(), &QueueConfig::default());
                let cleared = admin::reset_job_queue(&queue).await?;
                println!("Cleared {cleared} job(s)");
                Ok(())
            }
        },
        Commands::Info => Ok(()),
    };

    store.close().await;
    if let Some(exporter) = exporter {
        exporter.shutdown();
    }
    result
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_status(store: Arc<SqliteStorage>, as_json: bool) -> Result<()> {
    let mut tx = store.begin().await?;
    let pos = tx.sync_position().await?;
    tx.rollback().await?;

    let queue = JobQueue::new(store.clone(), &QueueConfig::default());
    let jobs = queue.publish_job_counts().await?;

    let Some(pos) = pos else {
        println!("Nothing indexed yet.");
        return Ok(());
    };
    ChainStateMetrics::global().record_block_completed(pos.latest_indexed.number);

    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "position": pos, "jobs": jobs }))?
        );
        return Ok(());
    }
    println!("Chain head:       {}", pos.chain_head);
    println!("Latest indexed:   {}", pos.latest_indexed);
    println!("Latest canonical: {}", pos.latest_canonical);
    println!("Initial indexed:  {}", pos.initial_indexed);
    match &pos.latest_checkpoint {
        Some(cp) => println!("Latest checkpoint: {cp}"),
        None => println!("Latest checkpoint: none"),
    }
    println!("Lag to head:      {} block(s)", pos.chain_head.number.saturating_sub(pos.latest_indexed.number));
    println!(
        "Jobs:             {}",
        jobs.iter()
            .map(|(status, n)| format!("{status}={n}"))
            .collect::<Vec<_>>()
            .join(" ")
    );
    if !pos.is_consistent() {
        println!("WARNING: pointers violate initial ≤ canonical ≤ indexed ≤ head");
    }
    Ok(())
}

async fn cmd_block(store: &SqliteStorage, hash: &str) -> Result<()> {
    let mut tx = store.begin().await?;
    let entry = tx.block(hash).await?;
    tx.rollback().await?;

    let Some(entry) = entry else {
        bail!("block {hash} is not in the ledger");
    };
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

async fn cmd_entity(
    store: &SqliteStorage,
    id: &str,
    at: Option<&str>,
    as_of: Option<&str>,
) -> Result<()> {
    let mut tx = store.begin().await?;
    let result = match (at, as_of) {
        (Some(hash), _) => entity::get_at_block(tx.as_mut(), id, hash).await,
        (None, Some(hash)) => entity::get_as_of(tx.as_mut(), id, hash).await,
        (None, None) => entity::get_latest(tx.as_mut(), id).await,
    };
    tx.rollback().await?;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn cmd_jobs(store: &SqliteStorage, status: Option<&str>) -> Result<()> {
    let status = status.map(str::parse::<JobStatus>).transpose()?;
    let jobs = store.list(status).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!("{:>6}  {:<10}  {:<9}  {:>8}  KEY / LAST ERROR", "ID", "KIND", "STATUS", "ATTEMPTS");
    for job in jobs {
        println!(
            "{:>6}  {:<10}  {:<9}  {:>8}  {}",
            job.id,
            job.kind,
            job.status,
            job.attempts,
            job.last_error
                .as_deref()
                .or(job.dedupe_key.as_deref())
                .unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_checkpoint_list(store: &SqliteStorage) -> Result<()> {
    let mut tx = store.begin().await?;
    let checkpoints = tx.checkpoints().await?;
    tx.rollback().await?;

    if checkpoints.is_empty() {
        println!("No checkpoints.");
        return Ok(());
    }
    for cp in checkpoints {
        println!(
            "#{:<10} {:<4}  {}  {}",
            cp.block_number, cp.kind, cp.block_hash, cp.content_address
        );
    }
    Ok(())
}

fn checkpoint_manager(store: Arc<SqliteStorage>, blobs: FsContentStore) -> CheckpointManager {
    let defaults = IndexerConfig::default();
    CheckpointManager::new(
        store,
        Arc::new(blobs),
        defaults.checkpoint_interval,
        defaults.full_checkpoint_every,
        Duration::from_millis(defaults.content_store_timeout_ms),
    )
}

async fn cmd_checkpoint_create(
    store: Arc<SqliteStorage>,
    block_number: Option<u64>,
    full: bool,
    blobs: &BlobArgs,
) -> Result<()> {
    let block_number = match block_number {
        Some(n) => n,
        None => {
            let mut tx = store.begin().await?;
            let pos = tx.sync_position().await?;
            tx.rollback().await?;
            pos.context("nothing indexed yet")?.latest_canonical.number
        }
    };

    let content = FsContentStore::open(&blobs.blobs).await?;
    let manager = checkpoint_manager(store, content);
    let kind = full.then_some(CheckpointKind::Full);
    let cp = manager.force_checkpoint(block_number, kind).await?;

    println!("Checkpoint #{} ({}) stored", cp.block_number, cp.kind);
    println!("  address: {}", cp.content_address);
    Ok(())
}

async fn cmd_checkpoint_inspect(
    store: Arc<SqliteStorage>,
    address: &str,
    as_json: bool,
    blobs: &BlobArgs,
) -> Result<()> {
    let content = FsContentStore::open(&blobs.blobs).await?;
    let manager = checkpoint_manager(store, content);
    let snapshot = manager
        .load_snapshot(address)
        .await
        .with_context(|| format!("checkpoint {address} failed verification"))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    println!("{}", snapshot_summary(address, &snapshot));
    Ok(())
}

fn snapshot_summary(address: &str, snapshot: &CheckpointSnapshot) -> String {
    let mut lines = vec![
        format!("Checkpoint {address} (verified)"),
        format!("  block:    {}", snapshot.block),
        format!("  parent:   {}", snapshot.parent_hash),
        format!("  kind:     {}", snapshot.kind),
    ];
    if let Some(base) = &snapshot.base {
        lines.push(format!("  base:     {base}"));
    }
    lines.push(format!("  entities: {}", snapshot.entities.len()));
    for (id, entry) in &snapshot.entities {
        lines.push(format!("    {id:<24} {:<16} #{}", entry.kind, entry.block_number));
    }
    lines.join("\n")
}

async fn cmd_checkpoint_restore(
    store: Arc<SqliteStorage>,
    address: &str,
    blobs: &BlobArgs,
    kinds: &KindArgs,
) -> Result<()> {
    let content = FsContentStore::open(&blobs.blobs).await?;
    let manager = checkpoint_manager(store, content);
    let pos = manager.restore(address, &kinds.registry()).await?;
    println!("Restored to {}", pos.latest_indexed);
    Ok(())
}

async fn cmd_reset_state(store: &SqliteStorage, block_number: u64, kinds: &KindArgs) -> Result<()> {
    let report = admin::reset_to_block(store, &kinds.registry(), block_number).await?;
    println!("Reset to {}", report.block);
    println!("  blocks deleted:      {}", report.deleted.blocks);
    println!("  versions deleted:    {}", report.deleted.versions);
    println!("  checkpoints deleted: {}", report.deleted.checkpoints);
    println!("  entities recomputed: {}", report.entities_recomputed);
    Ok(())
}

fn cmd_info() {
    let defaults = IndexerConfig::default();
    println!("ChainState v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default max reorg depth:     {} blocks", defaults.max_reorg_depth);
    println!("  Default checkpoint interval: every {} canonical blocks", defaults.checkpoint_interval);
    println!("  Full checkpoint every:       {} checkpoints", defaults.full_checkpoint_every);
    println!("  Content store timeout:       {} ms", defaults.content_store_timeout_ms);
    println!("  Workers:                     {}", defaults.queue.workers);
    println!("  Max job retries:             {}", defaults.queue.max_retries);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
    println!("  Content stores:   memory, filesystem");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainstate_core::checkpoint::SnapshotEntry;
    use chainstate_core::types::BlockPtr;

    #[test]
    fn parses_checkpoint_inspect() {
        let cli = Cli::try_parse_from([
            "chainstate",
            "--otlp-endpoint",
            "http://localhost:4318/v1/metrics",
            "checkpoint",
            "inspect",
            "--address",
            "sha256:ab",
            "--blobs",
            "/tmp/blobs",
        ])
        .unwrap();

        assert_eq!(cli.otlp_endpoint.as_deref(), Some("http://localhost:4318/v1/metrics"));
        match cli.command {
            Commands::Checkpoint {
                action:
                    CheckpointAction::Inspect {
                        address,
                        json,
                        blobs,
                    },
            } => {
                assert_eq!(address, "sha256:ab");
                assert!(!json);
                assert_eq!(blobs.blobs, "/tmp/blobs");
            }
            _ => panic!("expected checkpoint inspect"),
        }
    }

    #[test]
    fn summary_lists_entities() {
        let mut entities = std::collections::BTreeMap::new();
        entities.insert(
            "pool-1".to_string(),
            SnapshotEntry {
                kind: "Pool".into(),
                block_hash: "0x9".into(),
                block_number: 9,
                payload: serde_json::json!({ "fee": 3000 }),
            },
        );
        let snapshot = CheckpointSnapshot {
            block: BlockPtr::new("0xc", 12),
            parent_hash: "0xb".into(),
            kind: CheckpointKind::Diff,
            base: Some("sha256:00".into()),
            entities,
        };

        let text = snapshot_summary("sha256:ff", &snapshot);
        assert!(text.starts_with("Checkpoint sha256:ff (verified)"));
        assert!(text.contains("kind:     diff"));
        assert!(text.contains("base:     sha256:00"));
        assert!(text.contains("entities: 1"));
        assert!(text.contains("pool-1"));
        assert!(text.contains("#9"));
    }
}
