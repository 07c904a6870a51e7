//! Wallet-address ingestion pipeline: walks a chain via JSON-RPC, extracts
//! addresses, and persists them with low write amplification.

pub mod batch;
pub mod bulk_writer;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod models;
pub mod rate_limiter;
pub mod rpc;
pub mod scheduler;
pub mod store;

pub use config::Config;
pub use error::{IngestError, Result};

use batch::BatchProcessor;
use cache::AddressCache;
use metrics::Metrics;
use rpc::RpcClient;
use scheduler::Scheduler;
use std::sync::Arc;
use store::pg::PgStore;
use tracing::info;

/// Composition root: wires config, store, cache, RPC client, and metrics
/// into a `BatchProcessor`, then drives it via either the scheduler or a
/// single on-demand run.
pub struct App {
    pub processor: Arc<BatchProcessor>,
    pub config: Config,
}

impl App {
    pub async fn connect(config: Config) -> Result<Self> {
        let store = PgStore::connect(&config.database_url).await?;
        store.ensure_schema().await?;
        let store: Arc<dyn store::Store> = Arc::new(store);

        let fetcher: Arc<dyn rpc::BlockFetcher> = Arc::new(RpcClient::new(
            config.rpc_endpoint.clone(),
            config.rpc_timeout,
        ));
        let cache = Arc::new(AddressCache::new(&config));
        let metrics = Arc::new(Metrics::new());

        let processor = Arc::new(BatchProcessor::new(
            config.clone(),
            store,
            fetcher,
            cache,
            metrics,
        ));

        Ok(Self { processor, config })
    }

    /// Run the scheduler and the HTTP surface together until shutdown.
    pub async fn serve(self) -> Result<()> {
        let scheduler = Scheduler::new(
            self.processor.clone(),
            self.config.batch_schedule,
            self.config.prefetch_enabled,
        );

        let http_bind = self.config.http_bind.clone();
        let http_processor = self.processor.clone();
        let http_handle = tokio::spawn(async move {
            if let Err(e) = http::serve(&http_bind, http_processor).await {
                tracing::error!("http surface exited with error: {e}");
            }
        });

        scheduler.run().await;
        http_handle.abort();
        Ok(())
    }

    /// Run exactly one batch and return.
    pub async fn run_once(self) -> Result<batch::BatchOutcome> {
        info!("running a single batch then exiting");
        self.processor.process_batch().await
    }
}
