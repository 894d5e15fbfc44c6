//! TESSERA downstream sync worker
//!
//! Consumes file change events from the broker, applies them idempotently to
//! the downstream cache and redrives entries left pending by crashed or slow
//! consumers. Serves health probes and metrics on its own port.

use std::sync::Arc;
use std::time::Duration;

use tessera_api::jobs::{metrics_mirror_task, CounterSource};
use tessera_api::telemetry::{init_tracing, TelemetryConfig};
use tessera_api::{create_ops_router, ApiError, ApiResult, DownstreamProbe, SyncConfig};
use tessera_core::constants::DEFAULT_METRICS_MIRROR_INTERVAL_SECS;
use tessera_core::{StreamConfig, SystemClock};
use tessera_events::{
    CacheSyncApplier, DownstreamCache, EventSubscriber, LmdbDownstreamCache, LmdbStreamBroker,
};
use tessera_storage::open_env;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing(&TelemetryConfig::from_env("tessera-sync"))?;

    let sync_config = SyncConfig::from_env();
    let stream_config = StreamConfig::from_env();
    stream_config
        .validate()
        .map_err(|e| ApiError::internal_error(format!("Invalid stream configuration: {}", e)))?;

    let broker = LmdbStreamBroker::open_path(&sync_config.broker_dir, sync_config.map_size_mb)
        .map_err(|e| ApiError::internal_error(format!("Failed to open event broker: {}", e)))?;

    let downstream_env = open_env(&sync_config.downstream_dir, sync_config.map_size_mb)
        .map_err(|e| ApiError::internal_error(format!("Failed to open downstream cache: {}", e)))?;
    let downstream: Arc<dyn DownstreamCache> = Arc::new(
        LmdbDownstreamCache::open(&downstream_env).map_err(|e| {
            ApiError::internal_error(format!("Failed to open downstream cache: {}", e))
        })?,
    );

    let applier = CacheSyncApplier::new(downstream.clone(), Arc::new(SystemClock));
    let subscriber = Arc::new(EventSubscriber::new(
        Arc::new(broker),
        applier,
        stream_config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(subscriber.clone().run_consumer(shutdown_rx.clone()));
    let redrive = tokio::spawn(subscriber.clone().run_redrive(shutdown_rx.clone()));

    let sampled = subscriber.clone();
    let mirror = tokio::spawn(metrics_mirror_task(
        vec![CounterSource::new("subscriber", move || {
            let s = sampled.metrics().snapshot();
            vec![
                ("batches", s.batches),
                ("applied", s.applied),
                ("apply_failures", s.apply_failures),
                ("acked", s.acked),
                ("claimed", s.claimed),
                ("poison", s.poison),
                ("broker_errors", s.broker_errors),
                ("tombstones_pruned", s.tombstones_pruned),
            ]
        })],
        Duration::from_secs(DEFAULT_METRICS_MIRROR_INTERVAL_SECS),
        shutdown_rx,
    ));

    let app = create_ops_router(vec![Arc::new(DownstreamProbe(downstream))]);

    let addr = sync_config.bind_addr()?;
    tracing::info!(%addr, "Starting TESSERA sync worker");

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
    for (name, handle) in [("consumer", consumer), ("redrive", redrive), ("mirror", mirror)] {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, task = name, "Background task ended abnormally");
        }
    }
    Ok(())
}
