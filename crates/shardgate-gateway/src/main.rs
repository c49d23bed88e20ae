//! Shardgate entry point
//!
//! Run with:
//! ```bash
//! SHARDGATE_TOKEN=... cargo run -p shardgate-gateway
//! ```
//!
//! Configuration is loaded from environment variables (and `.env`).

use shardgate_common::{try_init_tracing_with_config, AppError, GatewayConfig, TracingConfig};
use shardgate_gateway::{Gateway, GatewayEvent, HttpBootstrapClient, TungsteniteTransport};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, code = e.code(), "Gateway stopped");
        std::process::exit(e.exit_code());
    }
}

async fn run() -> Result<(), AppError> {
    let config = GatewayConfig::from_env()?;

    if let Err(e) = try_init_tracing_with_config(TracingConfig::for_environment(config.env)) {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    info!(
        env = ?config.env,
        gateway_url = %config.gateway_url,
        compression = ?config.compression,
        total_shards = ?config.sharding.total_shards,
        "Configuration loaded"
    );

    let bootstrap = HttpBootstrapClient::new(&config.api_url, &config.token)
        .map_err(|e| AppError::Gateway(e.to_string()))?;
    let gateway = Gateway::new(config, Arc::new(TungsteniteTransport::new()), Arc::new(bootstrap))
        .map_err(|e| AppError::Gateway(e.to_string()))?;

    let mut events = gateway.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let GatewayEvent::ShardReady { shard_id, total_shards, .. } = event {
                info!(shard_id, total_shards, "Shard online");
            }
        }
    });

    let report = gateway.start().await.map_err(|e| AppError::Gateway(e.to_string()))?;
    info!(launched = report.launched.len(), "All buckets started");

    let signal = tokio::signal::ctrl_c().await;
    info!("Shutting down");
    gateway.shutdown().await;
    reporter.abort();

    match signal {
        Ok(()) => Ok(()),
        Err(e) => Err(AppError::Gateway(format!("signal handler failed: {e}"))),
    }
}
