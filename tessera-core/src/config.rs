//! Node and stream configuration.
//!
//! Both structs follow the same pattern: `Default` carries the values from
//! [`crate::constants`], `from_env()` overrides them from `TESSERA_*`
//! variables, and `validate()` rejects combinations that cannot work.

use crate::constants::*;
use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// NODE CONFIGURATION
// ============================================================================

/// Configuration of one storage node: attribute store, WAL and cache table.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory. Sidecars live in `<data_dir>/attrs`, LMDB in `<data_dir>/lmdb`.
    pub data_dir: PathBuf,

    /// Cache row TTL before a read triggers a lazy rebuild (default: 24h)
    pub cache_ttl: Duration,

    /// Lock wait for full and incremental rebuilds (default: 30s)
    pub lock_timeout: Duration,

    /// Lock wait for lazy rebuilds before stale data is served (default: 500ms)
    pub lazy_lock_timeout: Duration,

    /// Upper bound on a single rebuild run (default: 10min)
    pub operation_timeout: Duration,

    /// Retention of terminal WAL entries (default: 7 days)
    pub wal_retention: Duration,

    /// LMDB map size in megabytes (default: 1024)
    pub lmdb_map_size_mb: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            lazy_lock_timeout: Duration::from_millis(DEFAULT_LAZY_LOCK_TIMEOUT_MS),
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            wal_retention: Duration::from_secs(DEFAULT_WAL_RETENTION_SECS),
            lmdb_map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
        }
    }
}

impl NodeConfig {
    /// Configuration rooted at `data_dir` with default tuning.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Create NodeConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TESSERA_DATA_DIR`: Node data directory (default: ./data)
    /// - `TESSERA_CACHE_TTL_SECS`: Cache row TTL (default: 86400)
    /// - `TESSERA_LOCK_TIMEOUT_SECS`: Rebuild lock wait (default: 30)
    /// - `TESSERA_LAZY_LOCK_TIMEOUT_MS`: Lazy rebuild lock wait (default: 500)
    /// - `TESSERA_OPERATION_TIMEOUT_SECS`: Rebuild run bound (default: 600)
    /// - `TESSERA_WAL_RETENTION_SECS`: Terminal WAL entry retention (default: 604800)
    /// - `TESSERA_LMDB_MAP_SIZE_MB`: LMDB map size (default: 1024)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("TESSERA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cache_ttl: Duration::from_secs(
                std::env::var("TESSERA_CACHE_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_CACHE_TTL_SECS),
            ),
            lock_timeout: Duration::from_secs(
                std::env::var("TESSERA_LOCK_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
            ),
            lazy_lock_timeout: Duration::from_millis(
                std::env::var("TESSERA_LAZY_LOCK_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_LAZY_LOCK_TIMEOUT_MS),
            ),
            operation_timeout: Duration::from_secs(
                std::env::var("TESSERA_OPERATION_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECS),
            ),
            wal_retention: Duration::from_secs(
                std::env::var("TESSERA_WAL_RETENTION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_WAL_RETENTION_SECS),
            ),
            lmdb_map_size_mb: std::env::var("TESSERA_LMDB_MAP_SIZE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_LMDB_MAP_SIZE_MB),
        }
    }

    pub fn attrs_dir(&self) -> PathBuf {
        self.data_dir.join("attrs")
    }

    pub fn lmdb_dir(&self) -> PathBuf {
        self.data_dir.join("lmdb")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "data_dir".to_string(),
            });
        }
        // Cache rows store their TTL in whole seconds.
        if self.cache_ttl < Duration::from_secs(1) {
            return Err(ConfigError::InvalidValue {
                field: "cache_ttl".to_string(),
                value: format!("{:?}", self.cache_ttl),
                reason: "must be at least one second".to_string(),
            });
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "lock_timeout".to_string(),
                value: "0".to_string(),
                reason: "rebuilds need a non-zero lock wait".to_string(),
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "operation_timeout".to_string(),
                value: "0".to_string(),
                reason: "rebuilds need a non-zero run bound".to_string(),
            });
        }
        if self.lmdb_map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// STREAM CONFIGURATION
// ============================================================================

/// Configuration shared by the publisher and the downstream subscriber.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream carrying file change events
    pub stream: String,

    /// Consumer group of the downstream service
    pub group: String,

    /// Name of this consumer inside the group
    pub consumer: String,

    /// Maximum number of entries retained (default: 10,000)
    pub max_len: usize,

    /// Maximum age of retained entries (default: 24h)
    pub retention: Duration,

    /// Entries per batch read (default: 10)
    pub batch_size: usize,

    /// Blocking read timeout (default: 1s)
    pub block_timeout: Duration,

    /// Idle time after which a pending entry is claimed (default: 60s)
    pub idle_threshold: Duration,

    /// Interval between redrive scans (default: 30s)
    pub redrive_interval: Duration,

    /// First reconnect delay (default: 100ms)
    pub initial_backoff: Duration,

    /// Reconnect delay ceiling (default: 30s)
    pub max_backoff: Duration,

    /// Delivery count at which an entry is logged as poison (default: 10)
    pub poison_threshold: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream: DEFAULT_STREAM_NAME.to_string(),
            group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer: format!("consumer-{}", std::process::id()),
            max_len: DEFAULT_STREAM_MAX_LEN,
            retention: Duration::from_secs(DEFAULT_STREAM_RETENTION_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            block_timeout: Duration::from_millis(DEFAULT_BLOCK_TIMEOUT_MS),
            idle_threshold: Duration::from_secs(DEFAULT_IDLE_THRESHOLD_SECS),
            redrive_interval: Duration::from_secs(DEFAULT_REDRIVE_INTERVAL_SECS),
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            poison_threshold: DEFAULT_POISON_THRESHOLD,
        }
    }
}

impl StreamConfig {
    /// Create StreamConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TESSERA_STREAM`: Stream name (default: tessera:file-events)
    /// - `TESSERA_CONSUMER_GROUP`: Consumer group (default: downstream-cache-sync)
    /// - `TESSERA_CONSUMER_NAME`: Consumer name (default: consumer-<pid>)
    /// - `TESSERA_STREAM_MAX_LEN`: Retained entries (default: 10000)
    /// - `TESSERA_STREAM_RETENTION_SECS`: Retained age (default: 86400)
    /// - `TESSERA_BATCH_SIZE`: Entries per read (default: 10)
    /// - `TESSERA_BLOCK_TIMEOUT_MS`: Blocking read timeout (default: 1000)
    /// - `TESSERA_IDLE_THRESHOLD_SECS`: Redrive idle threshold (default: 60)
    /// - `TESSERA_REDRIVE_INTERVAL_SECS`: Redrive scan interval (default: 30)
    /// - `TESSERA_INITIAL_BACKOFF_MS`: First reconnect delay (default: 100)
    /// - `TESSERA_MAX_BACKOFF_MS`: Reconnect delay ceiling (default: 30000)
    /// - `TESSERA_POISON_THRESHOLD`: Poison delivery count (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stream: std::env::var("TESSERA_STREAM").unwrap_or(defaults.stream),
            group: std::env::var("TESSERA_CONSUMER_GROUP").unwrap_or(defaults.group),
            consumer: std::env::var("TESSERA_CONSUMER_NAME").unwrap_or(defaults.consumer),
            max_len: std::env::var("TESSERA_STREAM_MAX_LEN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_STREAM_MAX_LEN),
            retention: Duration::from_secs(
                std::env::var("TESSERA_STREAM_RETENTION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_STREAM_RETENTION_SECS),
            ),
            batch_size: std::env::var("TESSERA_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            block_timeout: Duration::from_millis(
                std::env::var("TESSERA_BLOCK_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BLOCK_TIMEOUT_MS),
            ),
            idle_threshold: Duration::from_secs(
                std::env::var("TESSERA_IDLE_THRESHOLD_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_IDLE_THRESHOLD_SECS),
            ),
            redrive_interval: Duration::from_secs(
                std::env::var("TESSERA_REDRIVE_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_REDRIVE_INTERVAL_SECS),
            ),
            initial_backoff: Duration::from_millis(
                std::env::var("TESSERA_INITIAL_BACKOFF_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(
                std::env::var("TESSERA_MAX_BACKOFF_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            ),
            poison_threshold: std::env::var("TESSERA_POISON_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_POISON_THRESHOLD),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("stream", &self.stream),
            ("group", &self.group),
            ("consumer", &self.consumer),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: field.to_string(),
                });
            }
        }
        if self.max_len == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_len".to_string(),
                value: "0".to_string(),
                reason: "stream must retain at least one entry".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::InvalidValue {
                field: "initial_backoff".to_string(),
                value: format!("{:?}", self.initial_backoff),
                reason: "must not exceed max_backoff".to_string(),
            });
        }
        Ok(())
    }
}
