mod cli;

use anyhow::{Context, Result};
use carbonhouse_clickhouse::ClickHouseClient;
use carbonhouse_uploader_core::{Uploader, UploaderOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = cli::parse_args();
    let config = carbonhouse_config::load_config(&args.config_path)
        .with_context(|| format!("failed to load config {}", args.config_path.display()))?;

    let clickhouse = ClickHouseClient::new(config.clickhouse.clone())?;
    clickhouse
        .ping(PING_TIMEOUT)
        .await
        .context("clickhouse ping failed")?;

    let options = UploaderOptions::from_config(&config.upload);
    let uploader = Uploader::new(options, Arc::new(clickhouse));

    let shutdown = CancellationToken::new();
    let signal_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(exc) => error!("signal handler failed: {exc}"),
            }
            shutdown.cancel();
        })
    };

    let result = uploader.run(shutdown).await;
    signal_handle.abort();
    result
}
