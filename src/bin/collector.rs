//! Collector binary: ingest server + queue consumer (C1-C5).

use anyhow::Result;
use skvoz_core::collect;
use skvoz_core::config::CollectorConfig;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,skvoz_collector=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = CollectorConfig::from_env()?;
    init_tracing()?;

    let runtime = tokio::runtime::Handle::current();
    let queue = collect::spawn_queue_thread(config.clone(), runtime);

    tokio::select! {
        result = collect::serve(config.bind_address.clone(), queue) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
