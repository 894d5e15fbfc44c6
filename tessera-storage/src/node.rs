//! A storage node: attribute store, WAL, cache table, rebuild service and
//! auditor over one data directory.
//!
//! Layout under `data_dir`:
//!
//! ```text
//! attrs/<file_id>.json   sidecars (source of truth)
//! lmdb/                  one environment holding the `wal` and `cache_rows` databases
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tessera_core::constants::{CACHE_SCAN_PAGE_SIZE, REBUILD_LOCK_NAME};
use tessera_core::{
    CacheRow, CacheRowView, Clock, FileId, NodeConfig, RecordMutation, TesseraResult,
};

use crate::attr_store::AttributeStore;
use crate::audit::ConsistencyAuditor;
use crate::cache_table::{CacheQuery, CacheTable};
use crate::lmdb::open_env;
use crate::lock::{LockStatus, RebuildLockManager};
use crate::rebuild::{CacheRebuildService, LazyRebuild, RebuildSettings};
use crate::record_store::{RecordStore, RecoveryReport, WriteOutcome};
use crate::sink::ChangeSink;
use crate::wal::WriteAheadLog;

// ============================================================================
// READ METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct ReadMetrics {
    pub fresh_hits: AtomicU64,
    pub lazy_refreshes: AtomicU64,
    pub stale_served: AtomicU64,
    pub uncached_served: AtomicU64,
    pub not_found: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMetricsSnapshot {
    pub fresh_hits: u64,
    pub lazy_refreshes: u64,
    pub stale_served: u64,
    pub uncached_served: u64,
    pub not_found: u64,
}

impl ReadMetrics {
    pub fn snapshot(&self) -> ReadMetricsSnapshot {
        ReadMetricsSnapshot {
            fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
            lazy_refreshes: self.lazy_refreshes.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            uncached_served: self.uncached_served.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// NODE
// ============================================================================

pub struct Node {
    config: NodeConfig,
    attrs: AttributeStore,
    cache: Arc<CacheTable>,
    store: RecordStore,
    rebuild: CacheRebuildService,
    auditor: ConsistencyAuditor,
    locks: RebuildLockManager,
    clock: Arc<dyn Clock>,
    read_metrics: ReadMetrics,
}

impl Node {
    /// Open (creating if needed) the node's stores.
    ///
    /// Does not replay the WAL; call [`Node::recover`] before serving.
    pub async fn open(
        config: NodeConfig,
        sink: Arc<dyn ChangeSink>,
        clock: Arc<dyn Clock>,
    ) -> TesseraResult<Self> {
        config.validate()?;

        let env = open_env(config.lmdb_dir(), config.lmdb_map_size_mb)?;
        let attrs = AttributeStore::open(config.attrs_dir()).await?;
        let cache = Arc::new(CacheTable::open(&env)?);
        let wal = WriteAheadLog::open(&env)?;
        let locks = RebuildLockManager::new();

        let store = RecordStore::new(
            attrs.clone(),
            wal,
            cache.clone(),
            sink,
            clock.clone(),
            config.cache_ttl,
        );
        let rebuild = CacheRebuildService::new(
            attrs.clone(),
            cache.clone(),
            locks.clone(),
            clock.clone(),
            RebuildSettings::from(&config),
        );
        let auditor = ConsistencyAuditor::new(attrs.clone(), cache.clone(), clock.clone());

        tracing::info!(
            ctx_data_dir = %config.data_dir.display(),
            ctx_cache_ttl_secs = config.cache_ttl.as_secs(),
            "Storage node opened"
        );

        Ok(Self {
            config,
            attrs,
            cache,
            store,
            rebuild,
            auditor,
            locks,
            clock,
            read_metrics: ReadMetrics::default(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn cache(&self) -> &CacheTable {
        &self.cache
    }

    pub fn rebuild(&self) -> &CacheRebuildService {
        &self.rebuild
    }

    pub fn auditor(&self) -> &ConsistencyAuditor {
        &self.auditor
    }

    pub fn read_metrics(&self) -> &ReadMetrics {
        &self.read_metrics
    }

    pub fn lock_status(&self) -> LockStatus {
        self.locks.status(REBUILD_LOCK_NAME)
    }

    pub async fn recover(&self) -> TesseraResult<RecoveryReport> {
        self.store.recover().await
    }

    pub async fn write(
        &self,
        mutation: RecordMutation,
        actor: Option<&str>,
    ) -> TesseraResult<WriteOutcome> {
        self.store.write(mutation, actor).await
    }

    /// Read a row through the cache.
    ///
    /// Fresh rows are served as-is. An expired or missing row is lazily
    /// rebuilt first; if that cannot happen (lock contention, timeout,
    /// failure) the reader gets the stale row, or the record itself when no
    /// row exists.
    pub async fn get(&self, file_id: FileId) -> TesseraResult<Option<CacheRowView>> {
        let now = self.clock.now();
        let existing = self.cache.get(file_id)?;
        if let Some(row) = &existing {
            if !row.is_expired(now) {
                self.read_metrics.fresh_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(row.view(now)));
            }
        }

        match self.rebuild.lazy(file_id).await {
            Ok(LazyRebuild::Rebuilt(row)) | Ok(LazyRebuild::AlreadyFresh(row)) => {
                self.read_metrics
                    .lazy_refreshes
                    .fetch_add(1, Ordering::Relaxed);
                Ok(Some(row.view(self.clock.now())))
            }
            Ok(LazyRebuild::Removed) => {
                self.read_metrics.not_found.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Ok(LazyRebuild::Skipped) => self.best_available(file_id, existing).await,
            Err(e) => {
                tracing::warn!(ctx_file_id = %file_id, error = %e, "Lazy rebuild failed");
                self.best_available(file_id, existing).await
            }
        }
    }

    /// Node-local search over cached rows.
    pub fn query(&self, query: &CacheQuery) -> TesseraResult<Vec<CacheRowView>> {
        let now = self.clock.now();
        Ok(self
            .cache
            .query(query, now, CACHE_SCAN_PAGE_SIZE)?
            .iter()
            .map(|row| row.view(now))
            .collect())
    }

    /// Whether both stores answer.
    pub async fn ready(&self) -> TesseraResult<()> {
        self.cache.count()?;
        self.attrs.exists(FileId::new()).await?;
        Ok(())
    }

    async fn best_available(
        &self,
        file_id: FileId,
        existing: Option<CacheRow>,
    ) -> TesseraResult<Option<CacheRowView>> {
        let now = self.clock.now();
        if let Some(row) = existing {
            self.read_metrics.stale_served.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(row.view(now)));
        }
        match self.attrs.read(file_id).await? {
            Some(record) => {
                self.read_metrics
                    .uncached_served
                    .fetch_add(1, Ordering::Relaxed);
                Ok(Some(
                    CacheRow::from_record(record, now, self.config.cache_ttl).view(now),
                ))
            }
            None => {
                self.read_metrics.not_found.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }
}
