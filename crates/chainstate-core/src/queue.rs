//! Persistent job queue — sequences block, event and checkpoint work.
//!
//! Jobs carry an optional dedupe key: enqueuing a key that an active job
//! (queued, running or failed-awaiting-retry) already holds returns that job
//! instead of creating a second one. Failed jobs are retried with
//! exponential backoff until the retry budget runs out, then dead-lettered.
//! Succeeded jobs are deleted; dead jobs stay for inspection.
//!
//! The storage side is the [`JobStore`] trait ([`MemoryJobStore`] here,
//! `SqliteStorage` in `chainstate-storage`); [`JobQueue`] layers the retry
//! policy, wake-ups and metrics on top.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::IndexerError;
use crate::metrics::ChainStateMetrics;
use crate::retry::RetryPolicy;

// ─── Config ───────────────────────────────────────────────────────────────────

/// Job queue and worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Retries allowed after the first failure before a job is dead-lettered.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// How long an idle worker sleeps before polling again.
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 15,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
            poll_interval_ms: 500,
        }
    }
}

// ─── Job types ────────────────────────────────────────────────────────────────

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Block,
    Event,
    Checkpoint,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Event => "event",
            Self::Checkpoint => "checkpoint",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "event" => Ok(Self::Event),
            "checkpoint" => Ok(Self::Checkpoint),
            other => Err(IndexerError::Storage(format!("unknown job kind '{other}'"))),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    /// Failed, waiting for its retry.
    Failed,
    /// Retry budget exhausted or non-retryable error.
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Queued,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Active jobs hold their dedupe key.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(IndexerError::Storage(format!("unknown job status '{other}'"))),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    /// Failed attempts so far.
    pub attempts: u32,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i32,
    /// Unix millis before which the job is not claimed.
    pub run_at: i64,
    pub last_error: Option<String>,
    /// Unix millis.
    pub created_at: i64,
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub priority: i32,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            dedupe_key: None,
            priority: 0,
        }
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Store trait ──────────────────────────────────────────────────────────────

/// Durable job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` unless an active job holds its dedupe key.
    ///
    /// Returns the stored job and whether it was newly inserted. The check
    /// and the insert must be atomic.
    async fn insert_unique(&self, job: &NewJob, now: i64) -> Result<(Job, bool), IndexerError>;

    /// Claim the highest-priority ready job (queued or failed with
    /// `run_at <= now`), marking it running.
    async fn claim_next(&self, now: i64) -> Result<Option<Job>, IndexerError>;

    /// Persist status, attempts, `run_at` and `last_error` of `job`.
    async fn update(&self, job: &Job) -> Result<(), IndexerError>;

    async fn delete(&self, id: u64) -> Result<(), IndexerError>;

    async fn get(&self, id: u64) -> Result<Option<Job>, IndexerError>;

    /// Jobs with the given status (all jobs if `None`), ordered by id.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, IndexerError>;

    /// Put jobs left running by a crashed process back to queued.
    async fn requeue_running(&self) -> Result<u64, IndexerError>;

    /// Delete every queued, running and failed job.
    async fn clear_active(&self) -> Result<u64, IndexerError>;
}

// ─── Memory store ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryJobs {
    next_id: u64,
    jobs: BTreeMap<u64, Job>,
}

/// In-memory [`JobStore`] for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryJobs>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryJobs>, IndexerError> {
        self.inner
            .lock()
            .map_err(|e| IndexerError::Storage(format!("job store poisoned: {e}")))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_unique(&self, job: &NewJob, now: i64) -> Result<(Job, bool), IndexerError> {
        let mut inner = self.lock()?;
        if let Some(key) = &job.dedupe_key {
            if let Some(existing) = inner
                .jobs
                .values()
                .find(|j| j.status.is_active() && j.dedupe_key.as_ref() == Some(key))
            {
                return Ok((existing.clone(), false));
            }
        }
        inner.next_id += 1;
        let stored = Job {
            id: inner.next_id,
            kind: job.kind,
            payload: job.payload.clone(),
            dedupe_key: job.dedupe_key.clone(),
            attempts: 0,
            status: JobStatus::Queued,
            priority: job.priority,
            run_at: now,
            last_error: None,
            created_at: now,
        };
        inner.jobs.insert(stored.id, stored.clone());
        Ok((stored, true))
    }

    async fn claim_next(&self, now: i64) -> Result<Option<Job>, IndexerError> {
        let mut inner = self.lock()?;
        let next = inner
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Queued | JobStatus::Failed) && j.run_at <= now)
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.run_at, j.id))
            .map(|j| j.id);
        Ok(next.and_then(|id| {
            inner.jobs.get_mut(&id).map(|job| {
                job.status = JobStatus::Running;
                job.clone()
            })
        }))
    }

    async fn update(&self, job: &Job) -> Result<(), IndexerError> {
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(IndexerError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn delete(&self, id: u64) -> Result<(), IndexerError> {
        self.lock()?.jobs.remove(&id);
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<Option<Job>, IndexerError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, IndexerError> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect())
    }

    async fn requeue_running(&self) -> Result<u64, IndexerError> {
        let mut inner = self.lock()?;
        let mut n = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Queued;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn clear_active(&self) -> Result<u64, IndexerError> {
        let mut inner = self.lock()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| !j.status.is_active());
        Ok((before - inner.jobs.len()) as u64)
    }
}

// ─── Queue ────────────────────────────────────────────────────────────────────

/// Job queue front-end shared by producers and workers.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    notify: Notify,
    poll_interval: Duration,
    metrics: ChainStateMetrics,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            policy: RetryPolicy::from(config),
            notify: Notify::new(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            metrics: ChainStateMetrics::global(),
        }
    }

    /// Record into `metrics` instead of the global meter.
    pub fn with_metrics(mut self, metrics: ChainStateMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Enqueue a job, or return the active job that already holds its dedupe key.
    pub async fn enqueue(&self, job: NewJob) -> Result<Job, IndexerError> {
        let (stored, inserted) = self.store.insert_unique(&job, now_millis()).await?;
        if inserted {
            self.metrics.record_enqueued(stored.kind);
            tracing::debug!(job_id = stored.id, kind = %stored.kind, key = ?stored.dedupe_key, "job enqueued");
            self.notify.notify_one();
        } else {
            self.metrics.record_deduplicated(stored.kind);
            tracing::debug!(job_id = stored.id, key = ?stored.dedupe_key, "job deduplicated");
        }
        Ok(stored)
    }

    /// Claim the next ready job without waiting.
    pub async fn pull(&self) -> Result<Option<Job>, IndexerError> {
        self.store.claim_next(now_millis()).await
    }

    /// Wait until a job may be ready: an enqueue wake-up or the poll interval.
    pub async fn wait(&self) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    /// Remove a job whose work has been committed.
    pub async fn complete(&self, job: &Job) -> Result<(), IndexerError> {
        self.store.delete(job.id).await?;
        self.metrics.record_completed(job.kind);
        tracing::debug!(job_id = job.id, kind = %job.kind, "job completed");
        Ok(())
    }

    /// Record a failed attempt. Returns the job's new status.
    pub async fn fail(&self, job: &Job, error: &IndexerError) -> Result<JobStatus, IndexerError> {
        let mut job = job.clone();
        job.attempts += 1;
        job.last_error = Some(error.to_string());

        let delay = if error.is_retryable() {
            self.policy.next_delay(job.attempts)
        } else {
            None
        };
        match delay {
            Some(delay) => {
                // Bounded by `max_backoff_ms`.
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                job.status = JobStatus::Failed;
                job.run_at = now_millis().saturating_add(delay_ms);
                self.store.update(&job).await?;
                self.metrics.record_retried(job.kind);
                tracing::warn!(
                    job_id = job.id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    retry_in_ms = delay_ms,
                    error = %error,
                    "Job failed, retrying"
                );
            }
            None => {
                job.status = JobStatus::Dead;
                self.store.update(&job).await?;
                self.metrics.record_dead(job.kind);
                tracing::error!(
                    job_id = job.id,
                    kind = %job.kind,
                    attempts = job.attempts,
                    key = ?job.dedupe_key,
                    error = %error,
                    "Job dead-lettered"
                );
            }
        }
        Ok(job.status)
    }

    /// Requeue jobs a previous process left running.
    pub async fn recover(&self) -> Result<u64, IndexerError> {
        let n = self.store.requeue_running().await?;
        if n > 0 {
            tracing::info!(jobs = n, "Requeued jobs left running by a previous process");
            self.notify.notify_one();
        }
        Ok(n)
    }

    /// Delete every non-terminal job.
    pub async fn reset(&self) -> Result<u64, IndexerError> {
        let n = self.store.clear_active().await?;
        tracing::info!(jobs = n, "Job queue reset");
        Ok(n)
    }

    /// Number of stored jobs per status. Every status is present.
    pub async fn job_counts(&self) -> Result<BTreeMap<JobStatus, u64>, IndexerError> {
        let mut counts: BTreeMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for job in self.store.list(None).await? {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts)
    }

    /// Record the per-status job gauge.
    pub async fn publish_job_counts(&self) -> Result<BTreeMap<JobStatus, u64>, IndexerError> {
        let counts = self.job_counts().await?;
        for (status, count) in &counts {
            self.metrics.record_job_count(*status, *count);
        }
        Ok(counts)
    }
}
