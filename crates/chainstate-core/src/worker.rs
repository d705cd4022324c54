//! Worker pool — a fixed set of tokio tasks draining the job queue.
//!
//! Each worker pulls a job, runs it through the [`JobHandler`] and then
//! completes or fails it. Shutdown is observed between jobs. A fatal error
//! (a reorg below the canonical block) dead-letters its job, stops every
//! worker and is returned from [`WorkerPool::run`].
//!
//! When attached to a [`StateIndexer`] the pool drives its lifecycle state:
//! `Syncing` while running, `Stopping` then `Stopped` on shutdown, `Halted`
//! on a fatal error.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::IndexerError;
use crate::indexer::{IndexerState, StateIndexer};
use crate::queue::{Job, JobQueue};

/// Executes one job. Must be safe to re-run after a crash.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), IndexerError>;
}

/// Runs `workers` tasks against a queue.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    workers: usize,
    indexer: Option<Arc<StateIndexer>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, workers: usize) -> Self {
        Self {
            queue,
            handler,
            workers: workers.max(1),
            indexer: None,
        }
    }

    /// Report lifecycle transitions to `indexer`.
    pub fn with_indexer(mut self, indexer: Arc<StateIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    fn set_state(&self, state: IndexerState) {
        if let Some(indexer) = &self.indexer {
            indexer.set_state(state);
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), or
    /// until a worker hits a fatal error.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), IndexerError> {
        self.queue.recover().await?;
        tracing::info!(workers = self.workers, "Worker pool starting");
        self.set_state(IndexerState::Syncing);

        let (halt_tx, halt_rx) = watch::channel(false);
        let halt_tx = Arc::new(halt_tx);
        let fatal: Arc<Mutex<Option<IndexerError>>> = Arc::new(Mutex::new(None));

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            let shutdown = shutdown.clone();
            let halt_rx = halt_rx.clone();
            let halt_tx = Arc::clone(&halt_tx);
            let fatal = Arc::clone(&fatal);
            handles.push(tokio::spawn(async move {
                if let Some(e) = worker_loop(worker, queue, handler, shutdown, halt_rx).await {
                    if let Ok(mut slot) = fatal.lock() {
                        slot.get_or_insert(e);
                    }
                    let _ = halt_tx.send(true);
                }
            }));
        }

        let mut stop_rx = shutdown.clone();
        let mut joined = Box::pin(futures::future::join_all(handles));
        let results = tokio::select! {
            results = &mut joined => results,
            _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {
                self.set_state(IndexerState::Stopping);
                joined.await
            }
        };
        for result in results {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        let fatal = fatal.lock().ok().and_then(|mut slot| slot.take());
        match fatal {
            Some(e) => {
                self.set_state(IndexerState::Halted);
                tracing::error!(error = %e, "Worker pool halted");
                Err(e)
            }
            None => {
                self.set_state(IndexerState::Stopped);
                tracing::info!("Worker pool stopped");
                Ok(())
            }
        }
    }
}

fn stopping(shutdown: &watch::Receiver<bool>, halt: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || *halt.borrow()
}

/// Returns the fatal error that stopped this worker, if any.
async fn worker_loop(
    worker: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
    mut halt: watch::Receiver<bool>,
) -> Option<IndexerError> {
    while !stopping(&shutdown, &halt) {
        let job = match queue.pull().await {
            Ok(Some(job)) => job,
            Ok(None) => {
                if worker == 0 {
                    if let Err(e) = queue.publish_job_counts().await {
                        tracing::debug!(worker, error = %e, "failed to publish job counts");
                    }
                }
                tokio::select! {
                    _ = queue.wait() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = halt.changed() => {}
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(worker, error = %e, "Failed to pull job");
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };

        tracing::debug!(worker, job_id = job.id, kind = %job.kind, attempt = job.attempts + 1, "running job");
        match handler.handle(&job).await {
            Ok(()) => {
                if let Err(e) = queue.complete(&job).await {
                    tracing::warn!(worker, job_id = job.id, error = %e, "Failed to complete job");
                }
            }
            Err(e) => {
                if let Err(store_err) = queue.fail(&job, &e).await {
                    tracing::warn!(worker, job_id = job.id, error = %store_err, "Failed to record job failure");
                }
                if e.is_fatal() {
                    return Some(e);
                }
            }
        }
    }
    None
}
