//! TESSERA Storage - Node-Local Persistence and Cache Consistency
//!
//! Owns everything a storage node keeps on disk:
//!
//! - [`attr_store`]: one JSON sidecar per record, replaced atomically
//! - [`wal`]: LMDB write-ahead log protecting every mutation
//! - [`cache_table`]: LMDB query cache keyed by file id
//! - [`lock`]: named priority lock serializing rebuilds
//! - [`rebuild`]: full, incremental and lazy cache reconciliation
//! - [`audit`]: read-only consistency check between sidecars and cache
//! - [`node`]: the assembled node with the lazy read path
//!
//! Committed mutations are announced through a [`ChangeSink`]; the events
//! crate provides the broker-backed implementation.

pub mod attr_store;
pub mod audit;
pub mod cache_table;
pub mod lmdb;
pub mod lock;
pub mod node;
pub mod rebuild;
pub mod record_store;
pub mod sink;
pub mod wal;

pub use attr_store::{AttrScan, AttributeStore};
pub use audit::ConsistencyAuditor;
pub use cache_table::{CacheQuery, CacheTable, CacheTableStats, CacheTableStatsSnapshot};
pub use lmdb::{open_database, open_env, LmdbError};
pub use lock::{LockStatus, RebuildGuard, RebuildLockManager};
pub use node::{Node, ReadMetrics, ReadMetricsSnapshot};
pub use rebuild::{
    CacheRebuildService, LazyRebuild, RebuildMetrics, RebuildMetricsSnapshot, RebuildSettings,
};
pub use record_store::{RecordStore, RecoveryReport, WriteOutcome};
pub use sink::{ChangeSink, NoopSink};
pub use wal::{WalCounts, WriteAheadLog};
