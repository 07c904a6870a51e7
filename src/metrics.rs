//! Batch and job-level metrics (§4.5).

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;

/// Current phase of an in-flight (or just-completed) batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    PreFetch,
    Storage,
    CacheUpdate,
    Completed,
}

#[derive(Debug, Clone, Default)]
struct PhaseTimestamps {
    pre_fetch_end: Option<Instant>,
    storage_start: Option<Instant>,
    storage_end: Option<Instant>,
    cache_update_start: Option<Instant>,
    cache_update_end: Option<Instant>,
}

struct BatchState {
    sequence: u64,
    phase: Phase,
    started_at: Option<Instant>,
    timestamps: PhaseTimestamps,
}

impl Default for BatchState {
    fn default() -> Self {
        Self {
            sequence: 0,
            phase: Phase::Idle,
            started_at: None,
            timestamps: PhaseTimestamps::default(),
        }
    }
}

/// Job/batch metrics collector. All counters are atomic; phase timestamps
/// are written exclusively by the batch processor, guarded by an
/// `RwLock` since they're a small struct read together as a snapshot.
pub struct Metrics {
    job_started_at: Instant,
    total_blocks_processed: AtomicU64,
    total_addresses_observed: AtomicU64,
    total_failed_blocks: AtomicU64,
    consecutive_failures: AtomicU64,
    total_completed_batches: AtomicU64,
    total_batch_duration_millis: AtomicU64,
    batch: RwLock<BatchState>,
}

/// A point-in-time snapshot, as served by `/batch/status` (§6).
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_blocks_processed: u64,
    pub total_addresses_observed: u64,
    pub total_failed_blocks: u64,
    pub consecutive_failures: u64,
    pub total_completed_batches: u64,
    pub current_batch_sequence: u64,
    pub current_phase: Phase,
    pub blocks_per_sec: f64,
    pub addresses_per_sec: f64,
    pub estimated_seconds_remaining: Option<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            job_started_at: Instant::now(),
            total_blocks_processed: AtomicU64::new(0),
            total_addresses_observed: AtomicU64::new(0),
            total_failed_blocks: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            total_completed_batches: AtomicU64::new(0),
            total_batch_duration_millis: AtomicU64::new(0),
            batch: RwLock::new(BatchState::default()),
        }
    }

    pub async fn start_batch(&self, sequence: u64) {
        let mut batch = self.batch.write().await;
        *batch = BatchState {
            sequence,
            phase: Phase::PreFetch,
            started_at: Some(Instant::now()),
            timestamps: PhaseTimestamps::default(),
        };
    }

    pub async fn enter_phase(&self, phase: Phase) {
        let mut batch = self.batch.write().await;
        let now = Instant::now();
        match (batch.phase, phase) {
            (Phase::PreFetch, Phase::Storage) => {
                batch.timestamps.pre_fetch_end = Some(now);
                batch.timestamps.storage_start = Some(now);
            }
            (Phase::Storage, Phase::CacheUpdate) => {
                batch.timestamps.storage_end = Some(now);
                batch.timestamps.cache_update_start = Some(now);
            }
            (Phase::CacheUpdate, Phase::Completed) => {
                batch.timestamps.cache_update_end = Some(now);
            }
            _ => {}
        }
        batch.phase = phase;
    }

    pub fn record_block_processed(&self) {
        self.total_blocks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_addresses_observed(&self, count: u64) {
        self.total_addresses_observed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_block_failure(&self) {
        self.total_failed_blocks.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub async fn complete_batch(&self) {
        let mut batch = self.batch.write().await;
        if let Some(started) = batch.started_at {
            let elapsed = started.elapsed().as_millis() as u64;
            self.total_batch_duration_millis
                .fetch_add(elapsed, Ordering::Relaxed);
        }
        self.total_completed_batches.fetch_add(1, Ordering::Relaxed);
        batch.phase = Phase::Idle;
        batch.started_at = None;
    }

    pub async fn mark_stopped_or_errored(&self) {
        let mut batch = self.batch.write().await;
        batch.phase = Phase::Idle;
        batch.started_at = None;
    }

    /// Pre-fetch-end must precede storage-start, which must precede
    /// cache-update-start, for every completed batch (§8 property 8).
    pub async fn phase_ordering_holds(&self) -> bool {
        let batch = self.batch.read().await;
        let t = &batch.timestamps;
        match (t.pre_fetch_end, t.storage_start, t.cache_update_start) {
            (Some(a), Some(b), Some(c)) => a <= b && b <= c,
            _ => true,
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let batch = self.batch.read().await;
        let elapsed_job = self.job_started_at.elapsed().as_secs_f64();
        let blocks = self.total_blocks_processed.load(Ordering::Relaxed);
        let addresses = self.total_addresses_observed.load(Ordering::Relaxed);
        let completed = self.total_completed_batches.load(Ordering::Relaxed);

        let blocks_per_sec = if elapsed_job > 0.0 {
            blocks as f64 / elapsed_job
        } else {
            0.0
        };
        let addresses_per_sec = if elapsed_job > 0.0 {
            addresses as f64 / elapsed_job
        } else {
            0.0
        };

        let estimated_seconds_remaining = if completed > 0 {
            let avg_batch_secs = self.total_batch_duration_millis.load(Ordering::Relaxed) as f64
                / 1000.0
                / completed as f64;
            batch.started_at.map(|started| {
                let current_elapsed = started.elapsed().as_secs_f64();
                (avg_batch_secs - current_elapsed).max(0.0)
            })
        } else {
            None
        };

        MetricsSnapshot {
            total_blocks_processed: blocks,
            total_addresses_observed: addresses,
            total_failed_blocks: self.total_failed_blocks.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            total_completed_batches: completed,
            current_batch_sequence: batch.sequence,
            current_phase: batch.phase,
            blocks_per_sec,
            addresses_per_sec,
            estimated_seconds_remaining,
        }
    }

    /// Prometheus-text rendering, for operators who scrape rather than poll.
    pub async fn export(&self) -> String {
        let snapshot = self.snapshot().await;
        format!(
            "# HELP chainwalk_blocks_processed_total Total blocks processed\n\
             # TYPE chainwalk_blocks_processed_total counter\n\
             chainwalk_blocks_processed_total {}\n\
             # HELP chainwalk_addresses_observed_total Total addresses observed\n\
             # TYPE chainwalk_addresses_observed_total counter\n\
             chainwalk_addresses_observed_total {}\n\
             # HELP chainwalk_failed_blocks_total Total failed block fetches\n\
             # TYPE chainwalk_failed_blocks_total counter\n\
             chainwalk_failed_blocks_total {}\n\
             # HELP chainwalk_blocks_per_second Blocks processed per second since job start\n\
             # TYPE chainwalk_blocks_per_second gauge\n\
             chainwalk_blocks_per_second {:.4}\n",
            snapshot.total_blocks_processed,
            snapshot.total_addresses_observed,
            snapshot.total_failed_blocks,
            snapshot.blocks_per_sec,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn phase_transitions_record_ordered_timestamps() {
        let metrics = Metrics::new();
        metrics.start_batch(1).await;
        metrics.enter_phase(Phase::Storage).await;
        metrics.enter_phase(Phase::CacheUpdate).await;
        metrics.enter_phase(Phase::Completed).await;
        assert!(metrics.phase_ordering_holds().await);
    }

    #[tokio::test]
    async fn consecutive_failures_reset_on_success() {
        let metrics = Metrics::new();
        metrics.record_block_failure();
        metrics.record_block_failure();
        assert_eq!(metrics.consecutive_failures(), 2);
        metrics.record_block_success();
        assert_eq!(metrics.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn estimated_remaining_is_none_before_first_batch() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot().await;
        assert!(snapshot.estimated_seconds_remaining.is_none());
    }
}
