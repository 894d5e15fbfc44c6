//! Background Jobs
//!
//! - `consistency_sweep`: periodic drift correction and WAL pruning on a node
//! - `metrics_mirror`: copies component counters into the Prometheus registry
//!
//! # Usage
//!
//! ```ignore
//! use tessera_api::jobs::{consistency_sweep_task, SweepConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(consistency_sweep_task(node.clone(), SweepConfig::from_env(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

pub mod consistency_sweep;
pub mod metrics_mirror;

pub use consistency_sweep::{consistency_sweep_task, SweepConfig, SweepMetrics, SweepSnapshot};
pub use metrics_mirror::{metrics_mirror_task, node_counter_sources, CounterSource};
