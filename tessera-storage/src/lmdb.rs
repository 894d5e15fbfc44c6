//! LMDB environment handling shared by the node-local tables.
//!
//! One environment per node holds several named databases (the WAL and the
//! cache table). All values are JSON; keys are raw bytes chosen so that LMDB's
//! lexicographic order is the iteration order each table needs.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_core::{StorageError, TesseraError};

/// Named databases a single node environment may hold.
pub const MAX_NAMED_DBS: u32 = 8;

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for TesseraError {
    fn from(e: LmdbError) -> Self {
        match e {
            LmdbError::Serialization(reason) | LmdbError::Deserialization(reason) => {
                TesseraError::Storage(StorageError::Serialization { reason })
            }
            other => TesseraError::Storage(StorageError::TransactionFailed {
                reason: other.to_string(),
            }),
        }
    }
}

/// Open (creating if needed) an LMDB environment at `path`.
///
/// # Errors
///
/// Returns an error if:
/// - The directory cannot be created
/// - LMDB environment cannot be opened
pub fn open_env<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Env, LmdbError> {
    std::fs::create_dir_all(&path)?;

    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size_mb * 1024 * 1024)
            .max_dbs(MAX_NAMED_DBS)
            .open(path.as_ref())
    }
    .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

    Ok(env)
}

/// Create or open a named database inside `env`.
pub fn open_database(env: &Env, name: &str) -> Result<Database<Bytes, Bytes>, LmdbError> {
    let mut wtxn = env
        .write_txn()
        .map_err(|e| LmdbError::Transaction(e.to_string()))?;

    let db: Database<Bytes, Bytes> = env
        .create_database(&mut wtxn, Some(name))
        .map_err(|e| LmdbError::DbOpen(e.to_string()))?;

    wtxn.commit()
        .map_err(|e| LmdbError::Transaction(e.to_string()))?;

    Ok(db)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LmdbError> {
    serde_json::to_vec(value).map_err(|e| LmdbError::Serialization(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_env_and_named_databases() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = open_env(dir.path(), 16).expect("env should open");
        let a = open_database(&env, "a").expect("db a should open");
        let b = open_database(&env, "b").expect("db b should open");

        let mut wtxn = env.write_txn().expect("write txn");
        a.put(&mut wtxn, b"k", b"1").expect("put a");
        b.put(&mut wtxn, b"k", b"2").expect("put b");
        wtxn.commit().expect("commit");

        let rtxn = env.read_txn().expect("read txn");
        assert_eq!(a.get(&rtxn, b"k").expect("get a"), Some(&b"1"[..]));
        assert_eq!(b.get(&rtxn, b"k").expect("get b"), Some(&b"2"[..]));
    }

    #[test]
    fn test_decode_error_maps_to_serialization() {
        let err = decode::<serde_json::Value>(b"{not json").expect_err("should fail");
        let err: TesseraError = err.into();
        assert!(matches!(
            err,
            TesseraError::Storage(StorageError::Serialization { .. })
        ));
    }
}
