//! Periodic driver that invokes the batch processor on a fixed schedule (§5).

use crate::batch::BatchProcessor;
use std::sync::Arc;
use tracing::{error, info};

/// Ticks every `config.batch_schedule` and calls `process_batch` directly —
/// no extra worker thread, the tick itself is the call. A slow batch simply
/// delays the next tick rather than overlapping it, since `process_batch`'s
/// single-flight latch would reject an overlapping call anyway.
pub struct Scheduler {
    processor: Arc<BatchProcessor>,
    interval: tokio::time::Duration,
    enabled: bool,
}

impl Scheduler {
    pub fn new(
        processor: Arc<BatchProcessor>,
        interval: tokio::time::Duration,
        enabled: bool,
    ) -> Self {
        Self {
            processor,
            interval,
            enabled,
        }
    }

    /// Run until `ctrl_c` or `processor.request_stop()` observed. Returns
    /// once a shutdown signal has been received.
    pub async fn run(self) {
        if !self.enabled {
            info!("prefetch scheduler disabled, idling until shutdown");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.processor.is_stop_requested() {
                        continue;
                    }
                    match self.processor.process_batch().await {
                        Ok(outcome) if outcome.skipped => {
                            info!(sequence = outcome.sequence, "batch skipped (already running or stopped)");
                        }
                        Ok(outcome) => {
                            info!(
                                sequence = outcome.sequence,
                                blocks_processed = outcome.blocks_processed,
                                addresses_persisted = outcome.addresses_persisted,
                                "scheduled batch finished"
                            );
                        }
                        Err(e) => error!("scheduled batch failed: {e}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received, stopping scheduler");
                    return;
                }
            }
        }
    }
}
