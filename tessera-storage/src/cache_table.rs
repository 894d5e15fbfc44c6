//! Node-local query cache table.
//!
//! A derived, queryable mirror of the attribute store kept in the
//! `cache_rows` LMDB database. Keys are the 16 raw bytes of the file id, which
//! makes the table hold at most one row per file and lets scans resume after a
//! given id without re-reading earlier rows.
//!
//! Single-row reads and writes are atomic at the LMDB layer and need no lock.
//! Bulk reconciliation goes through the rebuild service, which serializes
//! itself with the rebuild lock.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use heed::types::Bytes;
use heed::{Database, Env};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{CacheRow, FileId, TesseraResult, Timestamp};

use crate::lmdb::{decode, encode, open_database, LmdbError};

const CACHE_DB_NAME: &str = "cache_rows";

/// Filter for node-local search over cached rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheQuery {
    pub content_type: Option<String>,
    pub created_by: Option<String>,
    /// Case-insensitive substring of `filename` or `original_filename`.
    pub filename_contains: Option<String>,
    pub metadata_key: Option<String>,
    /// Only checked when `metadata_key` is set.
    pub metadata_value: Option<Value>,
    /// Include rows whose TTL has passed.
    #[serde(default = "default_true")]
    pub include_expired: bool,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl CacheQuery {
    pub fn matches(&self, row: &CacheRow, now: Timestamp) -> bool {
        let record = &row.record;
        if let Some(content_type) = &self.content_type {
            if &record.content_type != content_type {
                return false;
            }
        }
        if let Some(created_by) = &self.created_by {
            if record.created_by.as_ref() != Some(created_by) {
                return false;
            }
        }
        if let Some(needle) = &self.filename_contains {
            let needle = needle.to_lowercase();
            if !record.filename.to_lowercase().contains(&needle)
                && !record.original_filename.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if let Some(key) = &self.metadata_key {
            match (record.metadata.get(key), &self.metadata_value) {
                (None, _) => return false,
                (Some(actual), Some(expected)) if actual != expected => return false,
                _ => {}
            }
        }
        if !self.include_expired && row.is_expired(now) {
            return false;
        }
        true
    }
}

/// Hit/miss counters for single-row lookups.
#[derive(Debug, Default)]
pub struct CacheTableStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl CacheTableStats {
    pub fn snapshot(&self) -> CacheTableStatsSnapshot {
        CacheTableStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheTableStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
}

pub struct CacheTable {
    env: Env,
    db: Database<Bytes, Bytes>,
    stats: CacheTableStats,
}

impl CacheTable {
    /// Open the `cache_rows` database inside a node environment.
    pub fn open(env: &Env) -> Result<Self, LmdbError> {
        let db = open_database(env, CACHE_DB_NAME)?;
        Ok(Self {
            env: env.clone(),
            db,
            stats: CacheTableStats::default(),
        })
    }

    pub fn stats(&self) -> &CacheTableStats {
        &self.stats
    }

    pub fn get(&self, file_id: FileId) -> TesseraResult<Option<CacheRow>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        match self
            .db
            .get(&rtxn, file_id.as_bytes())
            .map_err(|e| LmdbError::Transaction(e.to_string()))?
        {
            Some(bytes) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(decode(bytes)?))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub fn contains(&self, file_id: FileId) -> TesseraResult<bool> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        Ok(self
            .db
            .get(&rtxn, file_id.as_bytes())
            .map_err(|e| LmdbError::Transaction(e.to_string()))?
            .is_some())
    }

    /// Insert or replace the row. Returns `true` if the row was new.
    pub fn upsert(&self, row: &CacheRow) -> TesseraResult<bool> {
        let bytes = encode(row)?;
        let key = row.file_id();

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let is_new = self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(|e| LmdbError::Transaction(e.to_string()))?
            .is_none();
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        Ok(is_new)
    }

    /// Insert the row only if no row exists for its file. Returns `true` if inserted.
    pub fn insert_if_absent(&self, row: &CacheRow) -> TesseraResult<bool> {
        let bytes = encode(row)?;
        let key = row.file_id();

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        if self
            .db
            .get(&wtxn, key.as_bytes())
            .map_err(|e| LmdbError::Transaction(e.to_string()))?
            .is_some()
        {
            return Ok(false);
        }
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        Ok(true)
    }

    /// Delete the row. Returns `true` if it existed.
    pub fn delete(&self, file_id: FileId) -> TesseraResult<bool> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let deleted = self
            .db
            .delete(&mut wtxn, file_id.as_bytes())
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        Ok(deleted)
    }

    /// Remove every row. Returns the number removed.
    pub fn truncate(&self) -> TesseraResult<u64> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let removed = self
            .db
            .len(&wtxn)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        self.db
            .clear(&mut wtxn)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        Ok(removed)
    }

    pub fn count(&self) -> TesseraResult<u64> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        Ok(self
            .db
            .len(&rtxn)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?)
    }

    /// Up to `limit` rows in key order, strictly after `after`.
    ///
    /// Each page uses its own short read transaction, so callers can await
    /// between pages without pinning an LMDB snapshot.
    pub fn scan_page(&self, after: Option<FileId>, limit: usize) -> TesseraResult<Vec<CacheRow>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        let lower: Bound<&[u8]> = match &after {
            Some(id) => Bound::Excluded(&id.as_bytes()[..]),
            None => Bound::Unbounded,
        };
        let range = (lower, Bound::<&[u8]>::Unbounded);
        let iter = self
            .db
            .range(&rtxn, &range)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        let mut rows = Vec::with_capacity(limit.min(1024));
        for result in iter.take(limit) {
            let (_, bytes) = result.map_err(|e| LmdbError::Transaction(e.to_string()))?;
            rows.push(decode(bytes)?);
        }
        Ok(rows)
    }

    /// Rows matching `query`, in key order, after applying offset and limit.
    pub fn query(
        &self,
        query: &CacheQuery,
        now: Timestamp,
        page_size: usize,
    ) -> TesseraResult<Vec<CacheRow>> {
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut skipped = 0usize;
        let mut matched = Vec::new();
        let mut cursor = None;

        loop {
            let page = self.scan_page(cursor, page_size)?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.file_id());
            let exhausted = page.len() < page_size;

            for row in page {
                if !query.matches(&row, now) {
                    continue;
                }
                if skipped < query.offset {
                    skipped += 1;
                    continue;
                }
                matched.push(row);
                if matched.len() >= limit {
                    return Ok(matched);
                }
            }

            if exhausted {
                break;
            }
        }
        Ok(matched)
    }
}
