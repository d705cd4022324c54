//! ChainState metrics definitions.
//!
//! All metrics use OpenTelemetry conventions and are recorded against a
//! [`Meter`]. Without an installed `MeterProvider` the global meter is a
//! no-op; the `chainstate` CLI installs an OTLP exporter when asked to.
//!
//! | Metric                                  | Type      | Attributes      |
//! |-----------------------------------------|-----------|-----------------|
//! | `chainstate.jobs_enqueued`              | counter   | `kind`          |
//! | `chainstate.jobs_deduplicated`          | counter   | `kind`          |
//! | `chainstate.jobs_completed`             | counter   | `kind`          |
//! | `chainstate.jobs_retried`               | counter   | `kind`          |
//! | `chainstate.jobs_dead`                  | counter   | `kind`          |
//! | `chainstate.jobs`                       | gauge     | `state`         |
//! | `chainstate.last_processed_block`       | gauge     |                 |
//! | `chainstate.block_process_duration_ms`  | histogram |                 |
//! | `chainstate.reorgs`                     | counter   | `type`          |
//! | `chainstate.reorg_depth`                | histogram |                 |
//! | `chainstate.checkpoints`                | counter   | `kind`          |

use std::time::Duration;

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

use crate::checkpoint::CheckpointKind;
use crate::queue::{JobKind, JobStatus};
use crate::reorg::ReorgType;

/// Central metrics handle for ChainState.
#[derive(Clone)]
pub struct ChainStateMetrics {
    pub jobs_enqueued: Counter<u64>,
    pub jobs_deduplicated: Counter<u64>,
    pub jobs_completed: Counter<u64>,
    pub jobs_retried: Counter<u64>,
    pub jobs_dead: Counter<u64>,
    pub jobs: Gauge<u64>,
    pub last_processed_block: Gauge<u64>,
    pub block_process_duration_ms: Histogram<f64>,
    pub reorgs: Counter<u64>,
    pub reorg_depth: Histogram<u64>,
    pub checkpoints: Counter<u64>,
}

impl ChainStateMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            jobs_enqueued: meter
                .u64_counter("chainstate.jobs_enqueued")
                .with_description("Jobs inserted into the queue")
                .build(),
            jobs_deduplicated: meter
                .u64_counter("chainstate.jobs_deduplicated")
                .with_description("Enqueue calls answered with an existing active job")
                .build(),
            jobs_completed: meter
                .u64_counter("chainstate.jobs_completed")
                .with_description("Jobs whose work committed")
                .build(),
            jobs_retried: meter
                .u64_counter("chainstate.jobs_retried")
                .with_description("Failed attempts scheduled for a retry")
                .build(),
            jobs_dead: meter
                .u64_counter("chainstate.jobs_dead")
                .with_description("Jobs dead-lettered after a non-retryable error or exhausted retries")
                .build(),
            jobs: meter
                .u64_gauge("chainstate.jobs")
                .with_description("Jobs in the queue by state")
                .build(),
            last_processed_block: meter
                .u64_gauge("chainstate.last_processed_block")
                .with_description("Number of the most recently completed block")
                .build(),
            block_process_duration_ms: meter
                .f64_histogram("chainstate.block_process_duration_ms")
                .with_description("Time to apply a block or event transaction in milliseconds")
                .build(),
            reorgs: meter
                .u64_counter("chainstate.reorgs")
                .with_description("Resolved chain reorganizations")
                .build(),
            reorg_depth: meter
                .u64_histogram("chainstate.reorg_depth")
                .with_description("Indexed blocks rolled back per reorg")
                .build(),
            checkpoints: meter
                .u64_counter("chainstate.checkpoints")
                .with_description("Checkpoints recorded")
                .build(),
        }
    }

    /// Instruments on the global meter provider.
    pub fn global() -> Self {
        Self::new(&global::meter("chainstate"))
    }

    pub fn record_enqueued(&self, kind: JobKind) {
        self.jobs_enqueued.add(1, &[kind_attr(kind)]);
    }

    pub fn record_deduplicated(&self, kind: JobKind) {
        self.jobs_deduplicated.add(1, &[kind_attr(kind)]);
    }

    pub fn record_completed(&self, kind: JobKind) {
        self.jobs_completed.add(1, &[kind_attr(kind)]);
    }

    pub fn record_retried(&self, kind: JobKind) {
        self.jobs_retried.add(1, &[kind_attr(kind)]);
    }

    pub fn record_dead(&self, kind: JobKind) {
        self.jobs_dead.add(1, &[kind_attr(kind)]);
    }

    pub fn record_job_count(&self, status: JobStatus, count: u64) {
        self.jobs
            .record(count, &[KeyValue::new("state", status.as_str())]);
    }

    pub fn record_apply(&self, elapsed: Duration) {
        self.block_process_duration_ms
            .record(elapsed.as_secs_f64() * 1_000.0, &[]);
    }

    pub fn record_block_completed(&self, number: u64) {
        self.last_processed_block.record(number, &[]);
    }

    pub fn record_reorg(&self, reorg_type: ReorgType, depth: u64) {
        self.reorgs
            .add(1, &[KeyValue::new("type", reorg_type.to_string())]);
        self.reorg_depth.record(depth, &[]);
    }

    pub fn record_checkpoint(&self, kind: CheckpointKind) {
        self.checkpoints
            .add(1, &[KeyValue::new("kind", kind.to_string())]);
    }
}

impl Default for ChainStateMetrics {
    fn default() -> Self {
        Self::global()
    }
}

fn kind_attr(kind: JobKind) -> KeyValue {
    KeyValue::new("kind", kind.as_str())
}
