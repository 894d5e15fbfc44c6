//! Server Configuration
//!
//! Bind addresses and broker locations for the two server binaries, loaded
//! from environment variables with development defaults.

use std::net::SocketAddr;
use std::path::PathBuf;

use tessera_core::constants::DEFAULT_LMDB_MAP_SIZE_MB;

use crate::error::{ApiError, ApiResult};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_bind_addr(host: &str, port: u16) -> ApiResult<SocketAddr> {
    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}

// ============================================================================
// NODE SERVER
// ============================================================================

/// Configuration for `tessera-node`.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_host: String,
    pub port: u16,

    /// LMDB environment of the event broker. Shared with `tessera-sync` on
    /// the same host.
    pub broker_dir: PathBuf,

    pub broker_map_size_mb: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 3000,
            broker_dir: PathBuf::from("./data/broker"),
            broker_map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
        }
    }
}

impl ApiConfig {
    /// Environment variables:
    /// - `TESSERA_API_BIND`: listen host (default: 0.0.0.0)
    /// - `PORT` or `TESSERA_API_PORT`: listen port (default: 3000)
    /// - `TESSERA_BROKER_DIR`: broker LMDB directory (default: ./data/broker)
    /// - `TESSERA_BROKER_MAP_SIZE_MB`: broker map size (default: 1024)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = std::env::var("PORT")
            .ok()
            .or_else(|| std::env::var("TESSERA_API_PORT").ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        Self {
            bind_host: std::env::var("TESSERA_API_BIND").unwrap_or(defaults.bind_host),
            port,
            broker_dir: std::env::var("TESSERA_BROKER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.broker_dir),
            broker_map_size_mb: env_or("TESSERA_BROKER_MAP_SIZE_MB", defaults.broker_map_size_mb),
        }
    }

    pub fn bind_addr(&self) -> ApiResult<SocketAddr> {
        parse_bind_addr(&self.bind_host, self.port)
    }
}

// ============================================================================
// SYNC SERVICE
// ============================================================================

/// Configuration for `tessera-sync`, the downstream cache service.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Host of the health and metrics listener
    pub bind_host: String,
    pub port: u16,
    pub broker_dir: PathBuf,
    pub downstream_dir: PathBuf,
    pub map_size_mb: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 3001,
            broker_dir: PathBuf::from("./data/broker"),
            downstream_dir: PathBuf::from("./data/downstream"),
            map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
        }
    }
}

impl SyncConfig {
    /// Environment variables:
    /// - `TESSERA_SYNC_BIND` / `TESSERA_SYNC_PORT`: health and metrics listener
    /// - `TESSERA_BROKER_DIR`: broker LMDB directory
    /// - `TESSERA_DOWNSTREAM_DIR`: downstream cache LMDB directory
    /// - `TESSERA_SYNC_MAP_SIZE_MB`: map size for both environments
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_host: std::env::var("TESSERA_SYNC_BIND").unwrap_or(defaults.bind_host),
            port: env_or("TESSERA_SYNC_PORT", defaults.port),
            broker_dir: std::env::var("TESSERA_BROKER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.broker_dir),
            downstream_dir: std::env::var("TESSERA_DOWNSTREAM_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.downstream_dir),
            map_size_mb: env_or("TESSERA_SYNC_MAP_SIZE_MB", defaults.map_size_mb),
        }
    }

    pub fn bind_addr(&self) -> ApiResult<SocketAddr> {
        parse_bind_addr(&self.bind_host, self.port)
    }
}
