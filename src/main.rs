//! Chainwalk indexer service entry point

use chainwalk_indexer::{App, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            config.log_filter.clone(),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("chainwalk-indexer starting");
    info!(
        "  database: {}",
        config.database_url.split('@').next_back().unwrap_or("***")
    );
    info!("  rpc:      {}", config.rpc_endpoint);
    info!("  http:     {}", config.http_bind);
    info!("  chain_id: {}", config.chain_id);

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("serve");

    let app = App::connect(config).await?;

    match mode {
        "once" => {
            let outcome = app.run_once().await?;
            info!(
                blocks_processed = outcome.blocks_processed,
                addresses_persisted = outcome.addresses_persisted,
                "single batch finished"
            );
        }
        _ => app.serve().await?,
    }

    Ok(())
}
