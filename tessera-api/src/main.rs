//! TESSERA storage node entry point
//!
//! Opens the node, replays its WAL, publishes change events to the broker,
//! runs the consistency sweep and serves the cache management API.

use std::sync::Arc;
use std::time::Duration;

use tessera_api::jobs::{
    consistency_sweep_task, metrics_mirror_task, node_counter_sources, SweepConfig,
};
use tessera_api::telemetry::{init_tracing, TelemetryConfig};
use tessera_api::{create_api_router, ApiConfig, ApiError, ApiResult, AuthConfig};
use tessera_core::constants::DEFAULT_METRICS_MIRROR_INTERVAL_SECS;
use tessera_core::{NodeConfig, StreamConfig, SystemClock};
use tessera_events::{EventPublisher, LmdbStreamBroker};
use tessera_storage::Node;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing(&TelemetryConfig::from_env("tessera-node"))?;

    let node_config = NodeConfig::from_env();
    let stream_config = StreamConfig::from_env();
    stream_config
        .validate()
        .map_err(|e| ApiError::internal_error(format!("Invalid stream configuration: {}", e)))?;
    let api_config = ApiConfig::from_env();
    let auth_config = AuthConfig::from_env();
    auth_config.validate_for_production()?;

    let broker = LmdbStreamBroker::open_path(&api_config.broker_dir, api_config.broker_map_size_mb)
        .map_err(|e| ApiError::internal_error(format!("Failed to open event broker: {}", e)))?;
    let clock = Arc::new(SystemClock);
    let publisher = Arc::new(EventPublisher::new(
        Arc::new(broker),
        &stream_config,
        clock.clone(),
    ));

    let node = Node::open(node_config, publisher.clone(), clock)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to open storage node: {}", e)))?;
    let node = Arc::new(node);

    let recovery = node.recover().await?;
    tracing::info!(
        ctx_committed = recovery.committed,
        ctx_rolled_back = recovery.rolled_back,
        ctx_temp_files_removed = recovery.temp_files_removed,
        "WAL recovery finished"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = tokio::spawn(consistency_sweep_task(
        node.clone(),
        SweepConfig::from_env(),
        shutdown_rx.clone(),
    ));
    let mirror = tokio::spawn(metrics_mirror_task(
        node_counter_sources(&node, &publisher),
        Duration::from_secs(DEFAULT_METRICS_MIRROR_INTERVAL_SECS),
        shutdown_rx,
    ));

    let app = create_api_router(node, Vec::new(), auth_config);

    let addr = api_config.bind_addr()?;
    tracing::info!(%addr, "Starting TESSERA node");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweep.await {
        tracing::warn!(error = %e, "Consistency sweep task ended abnormally");
    }
    if let Err(e) = mirror.await {
        tracing::warn!(error = %e, "Metrics mirror task ended abnormally");
    }
    Ok(())
}
