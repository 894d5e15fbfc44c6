//! Constants for TESSERA
//!
//! Default values for node and stream configuration. Every value here can be
//! overridden through the corresponding `TESSERA_*` environment variable.

// ============================================================================
// CACHE TABLE
// ============================================================================

/// Default cache row TTL in seconds (24 hours)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;

/// Default LMDB map size for node-local tables, in megabytes
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 1024;

/// Page size used when streaming over the cache table
pub const CACHE_SCAN_PAGE_SIZE: usize = 512;

// ============================================================================
// REBUILD LOCK
// ============================================================================

/// Name of the per-node rebuild lock
pub const REBUILD_LOCK_NAME: &str = "cache_rebuild";

/// How long full and incremental rebuilds wait for the lock (seconds)
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// How long a lazy rebuild waits before serving stale data (milliseconds)
pub const DEFAULT_LAZY_LOCK_TIMEOUT_MS: u64 = 500;

/// Upper bound on a single rebuild run (seconds)
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// WRITE-AHEAD LOG
// ============================================================================

/// Terminal WAL entries older than this are pruned (seconds, 7 days)
pub const DEFAULT_WAL_RETENTION_SECS: u64 = 604_800;

// ============================================================================
// EVENT STREAM
// ============================================================================

/// Default stream carrying file change events
pub const DEFAULT_STREAM_NAME: &str = "tessera:file-events";

/// Default consumer group of the downstream cache service
pub const DEFAULT_CONSUMER_GROUP: &str = "downstream-cache-sync";

/// Maximum number of entries kept in the stream
pub const DEFAULT_STREAM_MAX_LEN: usize = 10_000;

/// Entries older than this are trimmed (seconds, 24 hours)
pub const DEFAULT_STREAM_RETENTION_SECS: u64 = 86_400;

/// Entries read per consumer batch
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// How long a batch read blocks waiting for new entries (milliseconds)
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 1_000;

/// Pending entries idle longer than this are claimed for redrive (seconds)
pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 60;

/// Interval between redrive scans (seconds)
pub const DEFAULT_REDRIVE_INTERVAL_SECS: u64 = 30;

/// First reconnect delay after a broker failure (milliseconds)
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Reconnect delay ceiling (milliseconds)
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Delivery count at which a pending entry is reported as poison
pub const DEFAULT_POISON_THRESHOLD: u32 = 10;

// ============================================================================
// BACKGROUND SWEEP
// ============================================================================

/// Interval between consistency sweeps (seconds)
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Interval between WAL prune passes (seconds)
pub const DEFAULT_WAL_PRUNE_INTERVAL_SECS: u64 = 3_600;

/// Interval at which component counters are exported to Prometheus (seconds)
pub const DEFAULT_METRICS_MIRROR_INTERVAL_SECS: u64 = 15;
