//! Consistency Sweep Background Task
//!
//! Caches drift from their records when a write crashes between its steps or
//! when an operator edits sidecars by hand. The sweep audits the node on a
//! fixed interval and repairs what it finds:
//!
//! - attribute records with no cache row: incremental rebuild
//! - cache rows with no record, and expired rows: cleanup
//!
//! On a slower interval it drops terminal WAL entries older than the node's
//! retention window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_core::constants::{DEFAULT_SWEEP_INTERVAL_SECS, DEFAULT_WAL_PRUNE_INTERVAL_SECS};
use tessera_storage::Node;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::telemetry::metrics::with_metrics;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often to audit the node (default: 5 minutes)
    pub check_interval: Duration,

    /// How often to prune the WAL (default: 1 hour)
    pub prune_interval: Duration,

    /// Run an incremental rebuild every cycle, even when the audit is clean
    /// (default: false)
    pub always_rebuild: bool,

    /// Remove expired rows when the audit finds any (default: true)
    pub cleanup_expired: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            prune_interval: Duration::from_secs(DEFAULT_WAL_PRUNE_INTERVAL_SECS),
            always_rebuild: false,
            cleanup_expired: true,
        }
    }
}

impl SweepConfig {
    /// Create SweepConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TESSERA_SWEEP_INTERVAL_SECS`: Audit interval (default: 300)
    /// - `TESSERA_WAL_PRUNE_INTERVAL_SECS`: WAL prune interval (default: 3600)
    /// - `TESSERA_SWEEP_ALWAYS_REBUILD`: Rebuild even when clean (default: false)
    /// - `TESSERA_SWEEP_CLEANUP_EXPIRED`: Remove expired rows (default: true)
    pub fn from_env() -> Self {
        let check_interval = Duration::from_secs(
            std::env::var("TESSERA_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );

        let prune_interval = Duration::from_secs(
            std::env::var("TESSERA_WAL_PRUNE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_WAL_PRUNE_INTERVAL_SECS),
        );

        let always_rebuild = std::env::var("TESSERA_SWEEP_ALWAYS_REBUILD")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        let cleanup_expired = std::env::var("TESSERA_SWEEP_CLEANUP_EXPIRED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            check_interval,
            prune_interval,
            always_rebuild,
            cleanup_expired,
        }
    }

    /// Short intervals for local runs.
    pub fn development() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            prune_interval: Duration::from_secs(60),
            always_rebuild: false,
            cleanup_expired: true,
        }
    }

    pub fn production() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            prune_interval: Duration::from_secs(DEFAULT_WAL_PRUNE_INTERVAL_SECS),
            always_rebuild: true,
            cleanup_expired: true,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct SweepMetrics {
    /// Audit cycles completed
    pub sweep_cycles: AtomicU64,

    /// Cycles whose audit found orphans on either side
    pub drift_detected: AtomicU64,

    /// Cache rows created by sweep-triggered rebuilds
    pub rows_repaired: AtomicU64,

    /// Cache rows removed by sweep-triggered cleanups
    pub rows_removed: AtomicU64,

    /// Terminal WAL entries pruned
    pub wal_pruned: AtomicU64,

    pub sweep_errors: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SweepSnapshot {
        SweepSnapshot {
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            drift_detected: self.drift_detected.load(Ordering::Relaxed),
            rows_repaired: self.rows_repaired.load(Ordering::Relaxed),
            rows_removed: self.rows_removed.load(Ordering::Relaxed),
            wal_pruned: self.wal_pruned.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSnapshot {
    pub sweep_cycles: u64,
    pub drift_detected: u64,
    pub rows_repaired: u64,
    pub rows_removed: u64,
    pub wal_pruned: u64,
    pub sweep_errors: u64,
}

impl SweepSnapshot {
    pub fn counters(&self) -> [(&'static str, u64); 6] {
        [
            ("sweep_cycles", self.sweep_cycles),
            ("drift_detected", self.drift_detected),
            ("rows_repaired", self.rows_repaired),
            ("rows_removed", self.rows_removed),
            ("wal_pruned", self.wal_pruned),
            ("sweep_errors", self.sweep_errors),
        ]
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Audit and repair `node` until the shutdown signal is received.
///
/// Both intervals fire immediately on start, so a freshly recovered node is
/// swept once before its first scheduled cycle.
pub async fn consistency_sweep_task(
    node: Arc<Node>,
    config: SweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepMetrics> {
    let metrics = Arc::new(SweepMetrics::new());

    let mut sweep_interval = interval(config.check_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut prune_interval = interval(config.prune_interval);
    prune_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = config.check_interval.as_secs(),
        prune_interval_secs = config.prune_interval.as_secs(),
        always_rebuild = config.always_rebuild,
        "Consistency sweep task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Consistency sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_once(&node, &config, &metrics).await;
            }

            _ = prune_interval.tick() => {
                prune_wal(&node, &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweep_cycles = snapshot.sweep_cycles,
        drift_detected = snapshot.drift_detected,
        rows_repaired = snapshot.rows_repaired,
        rows_removed = snapshot.rows_removed,
        wal_pruned = snapshot.wal_pruned,
        sweep_errors = snapshot.sweep_errors,
        "Consistency sweep task completed"
    );

    metrics
}

/// One audit-and-repair cycle.
pub async fn sweep_once(node: &Node, config: &SweepConfig, metrics: &SweepMetrics) {
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);

    let report = match node.auditor().check().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Consistency audit failed");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    with_metrics(|m| m.record_consistency(&report));

    if !report.is_consistent {
        metrics.drift_detected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            ctx_orphan_cache = report.orphan_cache_count,
            ctx_orphan_attr = report.orphan_attr_count,
            ctx_inconsistency_percentage = report.inconsistency_percentage,
            "Cache drift detected"
        );
    }

    if report.orphan_attr_count > 0 || config.always_rebuild {
        let rebuild = node.rebuild().incremental().await;
        with_metrics(|m| m.record_rebuild(&rebuild));
        metrics
            .rows_repaired
            .fetch_add(rebuild.statistics.entries_created, Ordering::Relaxed);
        if !rebuild.is_clean() {
            metrics
                .sweep_errors
                .fetch_add(rebuild.errors.len() as u64, Ordering::Relaxed);
        }
    }

    let wants_cleanup = report.orphan_cache_count > 0
        || (config.cleanup_expired && report.expired_cache_count > 0);
    if wants_cleanup {
        let cleanup = node.rebuild().cleanup_expired().await;
        metrics
            .rows_removed
            .fetch_add(cleanup.removed, Ordering::Relaxed);
        if !cleanup.errors.is_empty() {
            metrics
                .sweep_errors
                .fetch_add(cleanup.errors.len() as u64, Ordering::Relaxed);
        }
    }

    with_metrics(|m| m.record_counters("sweep", &metrics.snapshot().counters()));
}

fn prune_wal(node: &Node, metrics: &SweepMetrics) {
    match node.store().prune_wal(node.config().wal_retention) {
        Ok(removed) => {
            if removed > 0 {
                tracing::info!(ctx_removed = removed, "Pruned WAL entries");
            }
            metrics.wal_pruned.fetch_add(removed, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::error!(error = %e, "WAL prune failed");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
