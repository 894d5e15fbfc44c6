//! Cache rebuild service.
//!
//! Reconciles the cache table with the attribute store at three granularities:
//!
//! - **full**: truncate, then repopulate from every sidecar
//! - **incremental**: insert rows only for records that have none
//! - **lazy**: refresh one expired or missing row on read
//!
//! plus cleanup of expired and orphaned rows. Every operation takes the
//! node's rebuild lock at its own priority and holds it through a guard, and
//! every run is bounded by the operation timeout. Callers always get a
//! structured result: lock and operation timeouts land in the report's
//! `errors`, and a lazy request that cannot get the lock is skipped so the
//! reader can serve what it already has.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera_core::constants::{CACHE_SCAN_PAGE_SIZE, REBUILD_LOCK_NAME};
use tessera_core::{
    CacheRow, CleanupReport, Clock, FileId, NodeConfig, RebuildOperation, RebuildPriority,
    RebuildReport, RebuildStatistics, TesseraResult,
};

use crate::attr_store::AttributeStore;
use crate::cache_table::CacheTable;
use crate::lock::RebuildLockManager;

// ============================================================================
// SETTINGS
// ============================================================================

/// Timing knobs of the rebuild service, taken from [`NodeConfig`].
#[derive(Debug, Clone)]
pub struct RebuildSettings {
    pub cache_ttl: Duration,
    pub lock_timeout: Duration,
    pub lazy_lock_timeout: Duration,
    pub operation_timeout: Duration,
}

impl From<&NodeConfig> for RebuildSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl,
            lock_timeout: config.lock_timeout,
            lazy_lock_timeout: config.lazy_lock_timeout,
            operation_timeout: config.operation_timeout,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct RebuildMetrics {
    pub full_runs: AtomicU64,
    pub incremental_runs: AtomicU64,
    pub lazy_rebuilds: AtomicU64,
    pub lazy_skipped: AtomicU64,
    pub cleanup_runs: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub operation_timeouts: AtomicU64,
    /// Operations currently mutating the cache under the lock.
    pub in_flight: AtomicU64,
    /// Highest `in_flight` observed. Stays at 1 while the lock works.
    pub peak_in_flight: AtomicU64,
}

impl RebuildMetrics {
    pub fn snapshot(&self) -> RebuildMetricsSnapshot {
        RebuildMetricsSnapshot {
            full_runs: self.full_runs.load(Ordering::Relaxed),
            incremental_runs: self.incremental_runs.load(Ordering::Relaxed),
            lazy_rebuilds: self.lazy_rebuilds.load(Ordering::Relaxed),
            lazy_skipped: self.lazy_skipped.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            operation_timeouts: self.operation_timeouts.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

struct InFlight<'a>(&'a RebuildMetrics);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildMetricsSnapshot {
    pub full_runs: u64,
    pub incremental_runs: u64,
    pub lazy_rebuilds: u64,
    pub lazy_skipped: u64,
    pub cleanup_runs: u64,
    pub lock_timeouts: u64,
    pub operation_timeouts: u64,
    pub peak_in_flight: u64,
}

// ============================================================================
// SERVICE
// ============================================================================

/// Outcome of a lazy rebuild request.
#[derive(Debug, Clone, PartialEq)]
pub enum LazyRebuild {
    /// The row was refreshed from its record.
    Rebuilt(CacheRow),
    /// Another reader refreshed the row while this one waited for the lock.
    AlreadyFresh(CacheRow),
    /// The record no longer exists; any row was removed.
    Removed,
    /// The lock or the operation timed out. Nothing changed.
    Skipped,
}

pub struct CacheRebuildService {
    attrs: AttributeStore,
    cache: Arc<CacheTable>,
    locks: RebuildLockManager,
    clock: Arc<dyn Clock>,
    settings: RebuildSettings,
    metrics: RebuildMetrics,
}

impl CacheRebuildService {
    pub fn new(
        attrs: AttributeStore,
        cache: Arc<CacheTable>,
        locks: RebuildLockManager,
        clock: Arc<dyn Clock>,
        settings: RebuildSettings,
    ) -> Self {
        Self {
            attrs,
            cache,
            locks,
            clock,
            settings,
            metrics: RebuildMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &RebuildMetrics {
        &self.metrics
    }

    pub fn settings(&self) -> &RebuildSettings {
        &self.settings
    }

    /// Truncate the cache table and repopulate it from every record.
    pub async fn full(&self) -> RebuildReport {
        self.metrics.full_runs.fetch_add(1, Ordering::Relaxed);
        self.bulk(RebuildOperation::Full).await
    }

    /// Insert rows for records that have none. Existing rows are untouched.
    pub async fn incremental(&self) -> RebuildReport {
        self.metrics.incremental_runs.fetch_add(1, Ordering::Relaxed);
        self.bulk(RebuildOperation::Incremental).await
    }

    /// Refresh the row of one file from its record.
    ///
    /// Freshness is re-checked after the lock is granted, so concurrent
    /// readers of the same expired row rebuild it once.
    pub async fn lazy(&self, file_id: FileId) -> TesseraResult<LazyRebuild> {
        let _guard = match self
            .locks
            .acquire(
                REBUILD_LOCK_NAME,
                RebuildPriority::Lazy,
                self.settings.lazy_lock_timeout,
            )
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                self.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                self.metrics.lazy_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(ctx_file_id = %file_id, error = %e, "Lazy rebuild skipped");
                return Ok(LazyRebuild::Skipped);
            }
        };
        let _running = self.metrics.enter();

        if let Some(row) = self.cache.get(file_id)? {
            if !row.is_expired(self.clock.now()) {
                return Ok(LazyRebuild::AlreadyFresh(row));
            }
        }

        let record = match tokio::time::timeout(
            self.settings.operation_timeout,
            self.attrs.read(file_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                self.metrics.operation_timeouts.fetch_add(1, Ordering::Relaxed);
                self.metrics.lazy_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(ctx_file_id = %file_id, "Lazy rebuild timed out");
                return Ok(LazyRebuild::Skipped);
            }
        };

        match record {
            Some(record) => {
                let row = CacheRow::from_record(record, self.clock.now(), self.settings.cache_ttl);
                self.cache.upsert(&row)?;
                self.metrics.lazy_rebuilds.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(ctx_file_id = %file_id, "Lazy rebuild refreshed row");
                Ok(LazyRebuild::Rebuilt(row))
            }
            None => {
                if self.cache.delete(file_id)? {
                    tracing::debug!(ctx_file_id = %file_id, "Lazy rebuild removed orphan row");
                }
                Ok(LazyRebuild::Removed)
            }
        }
    }

    /// Delete rows that are expired or have no record behind them.
    pub async fn cleanup_expired(&self) -> CleanupReport {
        let started = Instant::now();
        let mut report = CleanupReport::default();
        self.metrics.cleanup_runs.fetch_add(1, Ordering::Relaxed);

        let _guard = match self
            .locks
            .acquire(
                REBUILD_LOCK_NAME,
                RebuildPriority::Incremental,
                self.settings.lock_timeout,
            )
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                self.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                report.errors.push(e.to_string());
                report.duration_seconds = started.elapsed().as_secs_f64();
                return report;
            }
        };
        let _running = self.metrics.enter();

        let outcome = tokio::time::timeout(
            self.settings.operation_timeout,
            self.run_cleanup(&mut report),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report.errors.push(e.to_string()),
            Err(_) => {
                self.metrics.operation_timeouts.fetch_add(1, Ordering::Relaxed);
                report.errors.push(self.timeout_message());
            }
        }

        report.removed = report.expired_removed + report.orphan_removed;
        report.duration_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            ctx_removed = report.removed,
            ctx_expired_removed = report.expired_removed,
            ctx_orphan_removed = report.orphan_removed,
            ctx_rows_scanned = report.rows_scanned,
            ctx_errors = report.errors.len(),
            "Cache cleanup finished"
        );
        report
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn bulk(&self, operation: RebuildOperation) -> RebuildReport {
        let started = Instant::now();
        let mut report = RebuildReport::new(operation);

        let _guard = match self
            .locks
            .acquire(
                REBUILD_LOCK_NAME,
                operation.priority(),
                self.settings.lock_timeout,
            )
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                self.metrics.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(ctx_operation = operation.as_str(), error = %e, "Rebuild not started");
                report.errors.push(e.to_string());
                report.duration_seconds = started.elapsed().as_secs_f64();
                return report;
            }
        };
        let _running = self.metrics.enter();

        match self.cache.count() {
            Ok(n) => report.statistics.cache_entries_before = n,
            Err(e) => report.errors.push(e.to_string()),
        }

        let RebuildReport {
            statistics, errors, ..
        } = &mut report;
        let outcome = tokio::time::timeout(
            self.settings.operation_timeout,
            self.run_bulk(operation, statistics, errors),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report.errors.push(e.to_string()),
            Err(_) => {
                self.metrics.operation_timeouts.fetch_add(1, Ordering::Relaxed);
                report.errors.push(self.timeout_message());
            }
        }

        match self.cache.count() {
            Ok(n) => report.statistics.cache_entries_after = n,
            Err(e) => report.errors.push(e.to_string()),
        }
        report.duration_seconds = started.elapsed().as_secs_f64();

        tracing::info!(
            ctx_operation = operation.as_str(),
            ctx_attr_files_scanned = report.statistics.attr_files_scanned,
            ctx_entries_created = report.statistics.entries_created,
            ctx_cache_entries_after = report.statistics.cache_entries_after,
            ctx_errors = report.errors.len(),
            ctx_duration_seconds = report.duration_seconds,
            "Cache rebuild finished"
        );
        report
    }

    async fn run_bulk(
        &self,
        operation: RebuildOperation,
        statistics: &mut RebuildStatistics,
        errors: &mut Vec<String>,
    ) -> TesseraResult<()> {
        if operation == RebuildOperation::Full {
            let removed = self.cache.truncate()?;
            tracing::debug!(ctx_removed = removed, "Cache table truncated");
        }

        let mut scan = self.attrs.scan().await?;
        while let Some(file_id) = scan.next_id().await? {
            statistics.attr_files_scanned += 1;

            if operation == RebuildOperation::Incremental && self.cache.contains(file_id)? {
                continue;
            }

            let record = match self.attrs.read(file_id).await {
                Ok(Some(record)) => record,
                // Deleted between the directory listing and the read.
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(ctx_file_id = %file_id, error = %e, "Skipping unreadable sidecar");
                    errors.push(format!("{}: {}", file_id, e));
                    continue;
                }
            };

            let row = CacheRow::from_record(record, self.clock.now(), self.settings.cache_ttl);
            let created = match operation {
                RebuildOperation::Full => self.cache.upsert(&row)?,
                RebuildOperation::Incremental => self.cache.insert_if_absent(&row)?,
            };
            if created {
                statistics.entries_created += 1;
            }
        }
        Ok(())
    }

    async fn run_cleanup(&self, report: &mut CleanupReport) -> TesseraResult<()> {
        let mut cursor = None;
        loop {
            let page = self.cache.scan_page(cursor, CACHE_SCAN_PAGE_SIZE)?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.file_id());
            let exhausted = page.len() < CACHE_SCAN_PAGE_SIZE;

            for row in page {
                report.rows_scanned += 1;
                let file_id = row.file_id();
                if row.is_expired(self.clock.now()) {
                    if self.cache.delete(file_id)? {
                        report.expired_removed += 1;
                    }
                } else if !self.attrs.exists(file_id).await? && self.cache.delete(file_id)? {
                    report.orphan_removed += 1;
                }
            }

            if exhausted {
                break;
            }
        }
        Ok(())
    }

    fn timeout_message(&self) -> String {
        format!(
            "operation timed out after {}s",
            self.settings.operation_timeout.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmdb::open_env;
    use chrono::Utc;
    use tempfile::TempDir;
    use tessera_core::{AttributeRecord, ManualClock};

    const TTL: Duration = Duration::from_secs(3600);

    struct Fixture {
        _dir: TempDir,
        attrs: AttributeStore,
        cache: Arc<CacheTable>,
        locks: RebuildLockManager,
        clock: Arc<ManualClock>,
        service: Arc<CacheRebuildService>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = open_env(dir.path().join("lmdb"), 16).expect("env should open");
        let attrs = AttributeStore::open(dir.path().join("attrs"))
            .await
            .expect("attrs should open");
        let cache = Arc::new(CacheTable::open(&env).expect("cache should open"));
        let locks = RebuildLockManager::new();
        let clock = Arc::new(ManualClock::starting_now());
        let settings = RebuildSettings {
            cache_ttl: TTL,
            lock_timeout: Duration::from_millis(200),
            lazy_lock_timeout: Duration::from_millis(100),
            operation_timeout: Duration::from_secs(10),
        };
        let service = Arc::new(CacheRebuildService::new(
            attrs.clone(),
            cache.clone(),
            locks.clone(),
            clock.clone(),
            settings,
        ));
        Fixture {
            _dir: dir,
            attrs,
            cache,
            locks,
            clock,
            service,
        }
    }

    async fn seed(f: &Fixture, n: usize) -> Vec<AttributeRecord> {
        let mut records = Vec::new();
        for i in 0..n {
            let record = AttributeRecord::new(format!("{i}.bin"), i as u64, "x/y", "ab", Utc::now());
            f.attrs.write_atomic(&record).await.expect("write sidecar");
            records.push(record);
        }
        records
    }

    fn mirror(f: &Fixture, record: &AttributeRecord) {
        f.cache
            .upsert(&CacheRow::from_record(record.clone(), f.clock.now(), TTL))
            .expect("upsert");
    }

    #[tokio::test]
    async fn test_full_rebuild_mirrors_every_record() {
        let f = fixture().await;
        seed(&f, 7).await;
        // Orphan row that a full rebuild must drop.
        let orphan = AttributeRecord::new("ghost.bin", 1, "x/y", "ab", Utc::now());
        mirror(&f, &orphan);

        let report = f.service.full().await;
        assert!(report.is_clean(), "errors: {:?}", report.errors);
        assert_eq!(report.operation_type, RebuildOperation::Full);
        assert_eq!(
            report.statistics,
            RebuildStatistics {
                attr_files_scanned: 7,
                cache_entries_before: 1,
                cache_entries_after: 7,
                entries_created: 7,
            }
        );
        assert_eq!(f.cache.get(orphan.file_id).expect("get"), None);
    }

    #[tokio::test]
    async fn test_incremental_fills_gaps_only() {
        let f = fixture().await;
        let records = seed(&f, 5).await;
        let mut existing = CacheRow::from_record(records[0].clone(), f.clock.now(), TTL);
        existing.record.size = 999;
        f.cache.upsert(&existing).expect("upsert");
        mirror(&f, &records[1]);

        let report = f.service.incremental().await;
        assert!(report.is_clean());
        assert_eq!(report.operation_type, RebuildOperation::Incremental);
        assert_eq!(report.statistics.entries_created, 3);
        assert_eq!(report.statistics.cache_entries_before, 2);
        assert_eq!(report.statistics.cache_entries_after, 5);

        let kept = f.cache.get(records[0].file_id).expect("get").expect("row");
        assert_eq!(kept.record.size, 999);
    }

    #[tokio::test]
    async fn test_corrupt_sidecar_listed_in_errors() {
        let f = fixture().await;
        seed(&f, 2).await;
        let bad = FileId::new();
        std::fs::write(f.attrs.path_for(bad), b"not json").expect("write corrupt");

        let report = f.service.full().await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains(&bad.to_string()));
        assert_eq!(report.statistics.attr_files_scanned, 3);
        assert_eq!(report.statistics.cache_entries_after, 2);
    }

    #[tokio::test]
    async fn test_bulk_lock_timeout_reports_error() {
        let f = fixture().await;
        seed(&f, 1).await;
        let _held = f
            .locks
            .acquire(REBUILD_LOCK_NAME, RebuildPriority::Full, Duration::from_secs(1))
            .await
            .expect("acquire");

        let report = f.service.full().await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("Timed out"));
        assert_eq!(report.statistics, RebuildStatistics::default());
        assert_eq!(f.service.metrics().snapshot().lock_timeouts, 1);
    }

    #[tokio::test]
    async fn test_lazy_rebuilds_expired_row_once() {
        let f = fixture().await;
        let records = seed(&f, 1).await;
        let id = records[0].file_id;
        mirror(&f, &records[0]);
        f.clock.advance(TTL + Duration::from_secs(1));

        let first = f.service.lazy(id).await.expect("lazy");
        let LazyRebuild::Rebuilt(row) = first else {
            panic!("expected rebuild, got {first:?}");
        };
        assert!(!row.is_expired(f.clock.now()));
        assert_eq!(row.cache_updated_at, f.clock.now());

        let second = f.service.lazy(id).await.expect("lazy");
        assert!(matches!(second, LazyRebuild::AlreadyFresh(_)));
        assert_eq!(f.service.metrics().snapshot().lazy_rebuilds, 1);
    }

    #[tokio::test]
    async fn test_lazy_removes_row_without_record() {
        let f = fixture().await;
        let orphan = AttributeRecord::new("ghost.bin", 1, "x/y", "ab", Utc::now());
        mirror(&f, &orphan);
        f.clock.advance(TTL * 2);

        let outcome = f.service.lazy(orphan.file_id).await.expect("lazy");
        assert_eq!(outcome, LazyRebuild::Removed);
        assert_eq!(f.cache.count().expect("count"), 0);
    }

    #[tokio::test]
    async fn test_lazy_skips_when_lock_busy() {
        let f = fixture().await;
        let records = seed(&f, 1).await;
        let _held = f
            .locks
            .acquire(REBUILD_LOCK_NAME, RebuildPriority::Full, Duration::from_secs(1))
            .await
            .expect("acquire");

        let outcome = f.service.lazy(records[0].file_id).await.expect("lazy");
        assert_eq!(outcome, LazyRebuild::Skipped);
        assert_eq!(f.cache.count().expect("count"), 0);
    }

    #[tokio::test]
    async fn test_lazy_waits_behind_full_rebuild() {
        let f = fixture().await;
        let records = seed(&f, 1).await;
        let held = f
            .locks
            .acquire(REBUILD_LOCK_NAME, RebuildPriority::Full, Duration::from_secs(1))
            .await
            .expect("acquire");

        let service = f.service.clone();
        let id = records[0].file_id;
        let lazy = tokio::spawn(async move { service.lazy(id).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.locks.status(REBUILD_LOCK_NAME).queued, 1);
        drop(held);

        let outcome = lazy.await.expect("join").expect("lazy");
        assert!(matches!(outcome, LazyRebuild::Rebuilt(_)));
    }

    #[tokio::test]
    async fn test_concurrent_full_rebuilds_serialize() {
        let f = fixture().await;
        seed(&f, 20).await;

        let a = f.service.clone();
        let b = f.service.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.full().await }),
            tokio::spawn(async move { b.full().await })
        );
        let ra = ra.expect("join a");
        let rb = rb.expect("join b");

        assert!(ra.is_clean() && rb.is_clean());
        assert_eq!(ra.statistics.cache_entries_after, 20);
        assert_eq!(rb.statistics.cache_entries_after, 20);
        assert_eq!(f.service.metrics().snapshot().peak_in_flight, 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_and_orphans() {
        let f = fixture().await;
        let records = seed(&f, 3).await;
        for r in &records {
            mirror(&f, r);
        }
        let orphan = AttributeRecord::new("ghost.bin", 1, "x/y", "ab", Utc::now());
        mirror(&f, &orphan);

        // Age one real row past its TTL.
        let mut stale = CacheRow::from_record(records[0].clone(), f.clock.now(), TTL);
        stale.cache_updated_at = f.clock.now() - chrono::Duration::seconds(7200);
        f.cache.upsert(&stale).expect("upsert stale");

        let report = f.service.cleanup_expired().await;
        assert!(report.errors.is_empty());
        assert_eq!(report.rows_scanned, 4);
        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.orphan_removed, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(f.cache.count().expect("count"), 2);
    }
}
