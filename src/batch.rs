//! Batch processor: the state machine that walks one window of blocks,
//! extracts addresses, and persists them with low write amplification (§4.6).

use crate::bulk_writer::BulkWriter;
use crate::cache::AddressCache;
use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::metrics::{Metrics, Phase};
use crate::rate_limiter::RateLimiter;
use crate::rpc::BlockFetcher;
use crate::store::Store;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Outcome of a single [`BatchProcessor::process_batch`] call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub sequence: u64,
    /// True if another batch was already in flight and this call was a no-op.
    pub skipped: bool,
    /// True if `request_stop` interrupted the pre-fetch phase partway through.
    pub stopped_early: bool,
    pub blocks_processed: usize,
    pub blocks_failed: usize,
    pub addresses_observed: usize,
    pub addresses_persisted: usize,
}

impl BatchOutcome {
    fn skipped(sequence: u64) -> Self {
        Self {
            sequence,
            skipped: true,
            ..Default::default()
        }
    }
}

/// Releases the single-flight latch on every exit path, including early
/// returns via `?` and panics.
struct LatchGuard<'a>(&'a AtomicBool);

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one batch end to end: pre-fetch, storage, cache-update, advance.
/// At most one batch runs at a time, enforced by a lock-free CAS latch
/// rather than an async mutex, so `is_running` never blocks a caller.
pub struct BatchProcessor {
    config: Config,
    store: Arc<dyn Store>,
    fetcher: Arc<dyn BlockFetcher>,
    cache: Arc<AddressCache>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    running: AtomicBool,
    stop_requested: Arc<AtomicBool>,
    sequence: AtomicU64,
}

impl BatchProcessor {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        fetcher: Arc<dyn BlockFetcher>,
        cache: Arc<AddressCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_minute));
        Self {
            config,
            store,
            fetcher,
            cache,
            rate_limiter,
            metrics,
            running: AtomicBool::new(false),
            stop_requested: Arc::new(AtomicBool::new(false)),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the in-flight batch to wind down at the next block boundary.
    /// Scoped to the batch currently running: once it quiesces the flag is
    /// cleared automatically, so the next scheduled or requested batch runs
    /// normally without needing an explicit resume.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn cache(&self) -> &AddressCache {
        &self.cache
    }

    /// Run exactly one batch. Returns `skipped = true` without doing any
    /// work if a batch is already in flight. A stop requested while this
    /// batch runs is cleared once it quiesces, so it never affects the
    /// next call.
    pub async fn process_batch(&self) -> Result<BatchOutcome> {
        let sequence = self.sequence.load(Ordering::Relaxed) + 1;

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(BatchOutcome::skipped(sequence));
        }
        let _latch = LatchGuard(&self.running);
        self.sequence.store(sequence, Ordering::Relaxed);

        let result = self.run_batch(sequence).await;
        match &result {
            Ok(outcome) => {
                info!(
                    sequence,
                    blocks_processed = outcome.blocks_processed,
                    blocks_failed = outcome.blocks_failed,
                    addresses_persisted = outcome.addresses_persisted,
                    stopped_early = outcome.stopped_early,
                    "batch complete"
                );
                if outcome.stopped_early {
                    self.metrics.mark_stopped_or_errored().await;
                }
            }
            Err(e) => {
                warn!(sequence, error = %e, "batch errored");
                self.metrics.mark_stopped_or_errored().await;
            }
        }
        self.stop_requested.store(false, Ordering::Release);
        result
    }

    async fn run_batch(&self, sequence: u64) -> Result<BatchOutcome> {
        self.metrics.start_batch(sequence).await;

        let chain = self
            .store
            .load_chain_by_external_id(&self.config.chain_id)
            .await?
            .ok_or_else(|| IngestError::UnknownChain(self.config.chain_id.clone()))?;

        let start_block = chain.next_block_number as u64;
        let end_block = start_block + self.config.batch_size as u64;

        let prefetch = self.prefetch_phase(start_block, end_block).await?;

        self.metrics.enter_phase(Phase::Storage).await;
        let novel: BTreeSet<String> = prefetch
            .addresses
            .into_iter()
            .filter(|address| !self.cache.check_and_boost(address))
            .collect();

        let bulk_writer = BulkWriter::new(self.store.clone());
        bulk_writer.tune_for_bulk().await;
        let upsert_result = bulk_writer.upsert(&novel, chain.id).await;
        bulk_writer.reset_tuning().await;
        upsert_result?;

        self.metrics.enter_phase(Phase::CacheUpdate).await;
        self.cache.add_all(&novel);
        self.cache.decay_and_evict();

        self.metrics.enter_phase(Phase::Completed).await;
        if !prefetch.stopped_early {
            bulk_writer
                .advance_high_water_mark(chain.id, end_block as i64)
                .await?;
        }
        self.metrics.complete_batch().await;

        let stats = self.cache.stats_snapshot();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            skipped_db_ops = stats.skipped_db_ops,
            cache_size = stats.size,
            "cache performance for batch"
        );

        Ok(BatchOutcome {
            sequence,
            skipped: false,
            stopped_early: prefetch.stopped_early,
            blocks_processed: prefetch.blocks_processed,
            blocks_failed: prefetch.blocks_failed,
            addresses_observed: prefetch.addresses_observed,
            addresses_persisted: novel.len(),
        })
    }

    async fn prefetch_phase(&self, start_block: u64, end_block: u64) -> Result<PrefetchResult> {
        let next_block = Arc::new(AtomicU64::new(start_block));
        let addresses = Arc::new(AsyncMutex::new(BTreeSet::new()));
        let blocks_processed = Arc::new(AtomicU64::new(0));
        let blocks_failed = Arc::new(AtomicU64::new(0));
        let addresses_observed = Arc::new(AtomicU64::new(0));

        let worker_count = self.config.max_concurrent_rpc_calls.max(1);
        let mut handles = Vec::with_capacity(worker_count as usize);

        for _ in 0..worker_count {
            let next_block = next_block.clone();
            let addresses = addresses.clone();
            let blocks_processed = blocks_processed.clone();
            let blocks_failed = blocks_failed.clone();
            let addresses_observed = addresses_observed.clone();
            let fetcher = self.fetcher.clone();
            let rate_limiter = self.rate_limiter.clone();
            let store = self.store.clone();
            let metrics = self.metrics.clone();
            let chain_id = self.config.chain_id.clone();
            let stop_requested = self.stop_requested.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if stop_requested.load(Ordering::Acquire) {
                        break;
                    }
                    let block_number = next_block.fetch_add(1, Ordering::Relaxed);
                    if block_number >= end_block {
                        break;
                    }
                    rate_limiter.acquire().await;
                    metrics.record_block_processed();
                    blocks_processed.fetch_add(1, Ordering::Relaxed);
                    match fetcher.fetch_block(block_number).await {
                        Ok(block) => {
                            metrics.record_block_success();
                            metrics.record_addresses_observed(block.addresses.len() as u64);
                            addresses_observed
                                .fetch_add(block.addresses.len() as u64, Ordering::Relaxed);
                            addresses.lock().await.extend(block.addresses);
                        }
                        Err(e) => {
                            metrics.record_block_failure();
                            blocks_failed.fetch_add(1, Ordering::Relaxed);
                            let status_code = e
                                .failure_class()
                                .map(|c| c.status_code())
                                .unwrap_or("RPC_TRANSPORT_ERROR");
                            if let Err(log_err) = store
                                .insert_failure_log(
                                    &chain_id,
                                    block_number as i64,
                                    status_code,
                                    &e.to_string(),
                                )
                                .await
                            {
                                warn!(block_number, "failed to record failure log: {log_err}");
                            }
                        }
                    }
                }
            }));
        }

        for handle in handles {
            handle.await?;
        }

        let stopped_early = self.is_stop_requested();
        Ok(PrefetchResult {
            addresses: Arc::try_unwrap(addresses).unwrap().into_inner(),
            blocks_processed: blocks_processed.load(Ordering::Relaxed) as usize,
            blocks_failed: blocks_failed.load(Ordering::Relaxed) as usize,
            addresses_observed: addresses_observed.load(Ordering::Relaxed) as usize,
            stopped_early,
        })
    }
}

struct PrefetchResult {
    addresses: BTreeSet<String>,
    blocks_processed: usize,
    blocks_failed: usize,
    addresses_observed: usize,
    stopped_early: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchedBlock;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeFetcher {
        fail_blocks: Vec<u64>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(fail_blocks: Vec<u64>) -> Self {
            Self {
                fail_blocks,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BlockFetcher for FakeFetcher {
        async fn fetch_block(&self, block_number: u64) -> Result<FetchedBlock> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail_blocks.contains(&block_number) {
                return Err(IngestError::NotFound);
            }
            let mut addresses = BTreeSet::new();
            addresses.insert(format!("0x{block_number}"));
            Ok(FetchedBlock {
                block_hash: format!("hash-{block_number}"),
                timestamp: 0,
                tx_count: 1,
                addresses,
            })
        }
    }

    fn test_processor(fail_blocks: Vec<u64>) -> (Arc<MemoryStore>, BatchProcessor) {
        let mut config = Config::for_testing();
        config.batch_size = 5;
        config.max_concurrent_rpc_calls = 2;
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(AddressCache::new(&config));
        let metrics = Arc::new(Metrics::new());
        let fetcher = Arc::new(FakeFetcher::new(fail_blocks));
        let processor = BatchProcessor::new(config, store.clone(), fetcher, cache, metrics);
        (store, processor)
    }

    #[tokio::test]
    async fn full_batch_persists_addresses_and_advances_high_water_mark() {
        let (store, processor) = test_processor(vec![]);
        store.seed_chain("mainnet", "1", 100).await;

        let outcome = processor.process_batch().await.unwrap();
        assert!(!outcome.skipped);
        assert_eq!(outcome.blocks_processed, 5);
        assert_eq!(outcome.blocks_failed, 0);
        assert_eq!(store.address_count().await, 5);

        let chain = store.load_chain_by_external_id("1").await.unwrap().unwrap();
        assert_eq!(chain.next_block_number, 105);
    }

    #[tokio::test]
    async fn failed_blocks_are_logged_and_do_not_abort_the_batch() {
        let (store, processor) = test_processor(vec![101, 103]);
        store.seed_chain("mainnet", "1", 100).await;

        let outcome = processor.process_batch().await.unwrap();
        assert_eq!(outcome.blocks_failed, 2);
        assert_eq!(outcome.blocks_processed, 5);
        assert_eq!(store.failure_logs().await.len(), 2);

        let chain = store.load_chain_by_external_id("1").await.unwrap().unwrap();
        assert_eq!(chain.next_block_number, 105);
    }

    #[tokio::test]
    async fn replaying_the_same_window_is_idempotent() {
        let (store, processor) = test_processor(vec![]);
        store.seed_chain("mainnet", "1", 100).await;
        processor.process_batch().await.unwrap();

        let chain = store.load_chain_by_external_id("1").await.unwrap().unwrap();
        assert_eq!(chain.next_block_number, 105);
        // Rewind and replay the identical window.
        store
            .update_chain_high_water_mark(chain.id, 100)
            .await
            .unwrap();
        processor.process_batch().await.unwrap();

        assert_eq!(store.address_count().await, 5);
    }

    #[tokio::test]
    async fn concurrent_calls_single_flight_and_only_one_runs() {
        let (store, processor) = test_processor(vec![]);
        store.seed_chain("mainnet", "1", 100).await;
        let processor = Arc::new(processor);

        let a = processor.clone();
        let b = processor.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { a.process_batch().await.unwrap() }),
            tokio::spawn(async move { b.process_batch().await.unwrap() }),
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());
        let skipped_count = [&r1, &r2].iter().filter(|o| o.skipped).count();
        assert_eq!(
            skipped_count, 1,
            "exactly one call should be skipped by the single-flight latch"
        );
        assert!(!processor.is_running());
        assert_eq!(store.address_count().await, 5);
    }

    #[tokio::test]
    async fn unknown_chain_errors_without_panicking() {
        let (_, processor) = test_processor(vec![]);
        let result = processor.process_batch().await;
        assert!(matches!(result, Err(IngestError::UnknownChain(_))));
        assert!(!processor.is_running());
    }

    /// A fetcher that pauses on its first call so a test can interleave a
    /// `request_stop` with an in-flight batch deterministically.
    struct PausingFetcher {
        started: tokio::sync::Notify,
        proceed: tokio::sync::Notify,
        calls: AtomicUsize,
    }

    impl PausingFetcher {
        fn new() -> Self {
            Self {
                started: tokio::sync::Notify::new(),
                proceed: tokio::sync::Notify::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BlockFetcher for PausingFetcher {
        async fn fetch_block(&self, block_number: u64) -> Result<FetchedBlock> {
            if self.calls.fetch_add(1, Ordering::Relaxed) == 0 {
                self.started.notify_one();
                self.proceed.notified().await;
            }
            let mut addresses = BTreeSet::new();
            addresses.insert(format!("0x{block_number}"));
            Ok(FetchedBlock {
                block_hash: format!("hash-{block_number}"),
                timestamp: 0,
                tx_count: 1,
                addresses,
            })
        }
    }

    #[tokio::test]
    async fn stop_request_interrupts_the_in_flight_batch_only() {
        let mut config = Config::for_testing();
        config.batch_size = 5;
        config.max_concurrent_rpc_calls = 1;
        let store = Arc::new(MemoryStore::new());
        store.seed_chain("mainnet", "1", 100).await;
        let cache = Arc::new(AddressCache::new(&config));
        let metrics = Arc::new(Metrics::new());
        let fetcher = Arc::new(PausingFetcher::new());
        let processor = Arc::new(BatchProcessor::new(
            config,
            store.clone(),
            fetcher.clone(),
            cache,
            metrics,
        ));

        let running = processor.clone();
        let handle = tokio::spawn(async move { running.process_batch().await.unwrap() });

        fetcher.started.notified().await;
        processor.request_stop();
        fetcher.proceed.notify_waiters();

        let outcome = handle.await.unwrap();
        assert!(outcome.stopped_early);
        assert!(outcome.blocks_processed < 5);
        assert!(
            !processor.is_stop_requested(),
            "stop flag must clear once the interrupted batch quiesces"
        );

        // The next batch is unaffected by the earlier stop request.
        let outcome = processor.process_batch().await.unwrap();
        assert!(!outcome.skipped);
        assert!(!outcome.stopped_early);
        assert_eq!(outcome.blocks_processed, 5);
    }
}
