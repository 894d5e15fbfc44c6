//! Downstream cache: the subscriber's copy of record attributes.
//!
//! Every stored row remembers the stream entry that produced it. Upserts go
//! through [`supersedes`], so replaying an event, or an older event arriving
//! after a newer one, leaves the row untouched.
//!
//! A delete removes the row and leaves a [`Tombstone`] naming the deleting
//! entry. Upserts from entries at or before the tombstone are stale, so a
//! redelivered create cannot bring a deleted row back. Tombstones are pruned
//! once the stream can no longer redeliver what they guard against.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, RwTxn};
use serde::{Deserialize, Serialize};
use tessera_core::{ApplyError, AttributeRecord, FileId, Timestamp};
use tessera_storage::lmdb::{decode, encode};
use tessera_storage::{open_database, LmdbError};
use tokio::sync::RwLock;

use crate::stream::StreamId;

const DOWNSTREAM_DB_NAME: &str = "downstream_rows";
const TOMBSTONE_DB_NAME: &str = "downstream_tombstones";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamRow {
    pub record: AttributeRecord,
    pub source_event_id: StreamId,
    pub synced_at: Timestamp,
}

impl DownstreamRow {
    pub fn file_id(&self) -> FileId {
        self.record.file_id
    }
}

/// Marker left by a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub file_id: FileId,
    /// Stream entry of the delete.
    pub source_event_id: StreamId,
    /// When the delete was applied; drives pruning.
    pub deleted_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// The stored row is from the same or a newer version, or a later delete
    /// removed it.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// No row was stored. The tombstone is still recorded.
    AlreadyAbsent,
    /// The stored row comes from an entry after the delete.
    Stale,
}

/// Whether `incoming` should replace `stored`.
///
/// Newer record versions win; for the same version the later stream entry
/// wins, and an equal entry id is a replay.
pub fn supersedes(incoming: &DownstreamRow, stored: &DownstreamRow) -> bool {
    match incoming.record.updated_at.cmp(&stored.record.updated_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => incoming.source_event_id > stored.source_event_id,
    }
}

/// Whether `incoming` was published after the delete behind `tombstone`.
pub fn outlives(incoming: &DownstreamRow, tombstone: &Tombstone) -> bool {
    incoming.source_event_id > tombstone.source_event_id
}

fn upsert_allowed(
    row: &DownstreamRow,
    stored: Option<&DownstreamRow>,
    tombstone: Option<&Tombstone>,
) -> bool {
    tombstone.map_or(true, |t| outlives(row, t)) && stored.map_or(true, |s| supersedes(row, s))
}

/// The tombstone to keep after applying `incoming` over `existing`.
fn later_tombstone(incoming: Tombstone, existing: Option<Tombstone>) -> Tombstone {
    match existing {
        Some(existing) if existing.source_event_id >= incoming.source_event_id => existing,
        _ => incoming,
    }
}

#[async_trait]
pub trait DownstreamCache: Send + Sync {
    /// Store `row` unless the current row supersedes it or a later delete
    /// removed it.
    async fn upsert_versioned(&self, row: DownstreamRow) -> Result<UpsertOutcome, ApplyError>;

    /// Hard delete, recording `tombstone`. A row written by a later entry is
    /// kept.
    async fn delete(&self, tombstone: Tombstone) -> Result<DeleteOutcome, ApplyError>;

    async fn get(&self, file_id: FileId) -> Result<Option<DownstreamRow>, ApplyError>;

    async fn tombstone(&self, file_id: FileId) -> Result<Option<Tombstone>, ApplyError>;

    /// Drop tombstones recorded before `cutoff`. Returns how many went.
    async fn prune_tombstones(&self, cutoff: Timestamp) -> Result<u64, ApplyError>;

    /// All rows whose record has `checksum`. Checksums are not unique.
    async fn find_by_checksum(&self, checksum: &str) -> Result<Vec<DownstreamRow>, ApplyError>;

    async fn len(&self) -> Result<u64, ApplyError>;
}

fn backend(e: impl std::fmt::Display) -> ApplyError {
    ApplyError::Backend {
        reason: e.to_string(),
    }
}

// ============================================================================
// IN-MEMORY
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<FileId, DownstreamRow>,
    tombstones: HashMap<FileId, Tombstone>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDownstreamCache {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryDownstreamCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownstreamCache for InMemoryDownstreamCache {
    async fn upsert_versioned(&self, row: DownstreamRow) -> Result<UpsertOutcome, ApplyError> {
        let mut tables = self.tables.write().await;
        let file_id = row.file_id();
        if !upsert_allowed(&row, tables.rows.get(&file_id), tables.tombstones.get(&file_id)) {
            return Ok(UpsertOutcome::Stale);
        }
        tables.tombstones.remove(&file_id);
        tables.rows.insert(file_id, row);
        Ok(UpsertOutcome::Applied)
    }

    async fn delete(&self, tombstone: Tombstone) -> Result<DeleteOutcome, ApplyError> {
        let mut tables = self.tables.write().await;
        let file_id = tombstone.file_id;
        if let Some(stored) = tables.rows.get(&file_id) {
            if stored.source_event_id > tombstone.source_event_id {
                return Ok(DeleteOutcome::Stale);
            }
        }
        let kept = later_tombstone(tombstone, tables.tombstones.remove(&file_id));
        tables.tombstones.insert(file_id, kept);
        Ok(match tables.rows.remove(&file_id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::AlreadyAbsent,
        })
    }

    async fn get(&self, file_id: FileId) -> Result<Option<DownstreamRow>, ApplyError> {
        Ok(self.tables.read().await.rows.get(&file_id).cloned())
    }

    async fn tombstone(&self, file_id: FileId) -> Result<Option<Tombstone>, ApplyError> {
        Ok(self.tables.read().await.tombstones.get(&file_id).cloned())
    }

    async fn prune_tombstones(&self, cutoff: Timestamp) -> Result<u64, ApplyError> {
        let mut tables = self.tables.write().await;
        let before = tables.tombstones.len();
        tables.tombstones.retain(|_, t| t.deleted_at >= cutoff);
        Ok((before - tables.tombstones.len()) as u64)
    }

    async fn find_by_checksum(&self, checksum: &str) -> Result<Vec<DownstreamRow>, ApplyError> {
        let mut found: Vec<DownstreamRow> = self
            .tables
            .read()
            .await
            .rows
            .values()
            .filter(|row| row.record.checksum == checksum)
            .cloned()
            .collect();
        found.sort_by_key(|row| row.file_id());
        Ok(found)
    }

    async fn len(&self) -> Result<u64, ApplyError> {
        Ok(self.tables.read().await.rows.len() as u64)
    }
}

// ============================================================================
// LMDB
// ============================================================================

/// Durable downstream cache keyed by file id.
#[derive(Debug, Clone)]
pub struct LmdbDownstreamCache {
    env: Env,
    db: Database<Bytes, Bytes>,
    tombstones: Database<Bytes, Bytes>,
}

impl LmdbDownstreamCache {
    pub fn open(env: &Env) -> Result<Self, LmdbError> {
        Ok(Self {
            env: env.clone(),
            db: open_database(env, DOWNSTREAM_DB_NAME)?,
            tombstones: open_database(env, TOMBSTONE_DB_NAME)?,
        })
    }

    fn row_in(&self, txn: &RwTxn<'_>, file_id: FileId) -> Result<Option<DownstreamRow>, ApplyError> {
        self.db
            .get(txn, file_id.as_bytes())
            .map_err(backend)?
            .map(|bytes| decode(bytes).map_err(backend))
            .transpose()
    }

    fn tombstone_in(&self, txn: &RwTxn<'_>, file_id: FileId) -> Result<Option<Tombstone>, ApplyError> {
        self.tombstones
            .get(txn, file_id.as_bytes())
            .map_err(backend)?
            .map(|bytes| decode(bytes).map_err(backend))
            .transpose()
    }
}

#[async_trait]
impl DownstreamCache for LmdbDownstreamCache {
    async fn upsert_versioned(&self, row: DownstreamRow) -> Result<UpsertOutcome, ApplyError> {
        let key = row.file_id();
        let bytes = encode(&row).map_err(backend)?;

        // Compare and write in one transaction.
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        let stored = self.row_in(&wtxn, key)?;
        let tombstone = self.tombstone_in(&wtxn, key)?;
        if !upsert_allowed(&row, stored.as_ref(), tombstone.as_ref()) {
            return Ok(UpsertOutcome::Stale);
        }
        if tombstone.is_some() {
            self.tombstones
                .delete(&mut wtxn, key.as_bytes())
                .map_err(backend)?;
        }
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(UpsertOutcome::Applied)
    }

    async fn delete(&self, tombstone: Tombstone) -> Result<DeleteOutcome, ApplyError> {
        let key = tombstone.file_id;
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        if let Some(stored) = self.row_in(&wtxn, key)? {
            if stored.source_event_id > tombstone.source_event_id {
                return Ok(DeleteOutcome::Stale);
            }
        }
        let kept = later_tombstone(tombstone, self.tombstone_in(&wtxn, key)?);
        let bytes = encode(&kept).map_err(backend)?;
        self.tombstones
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(backend)?;
        let deleted = self.db.delete(&mut wtxn, key.as_bytes()).map_err(backend)?;
        wtxn.commit().map_err(backend)?;
        Ok(if deleted {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::AlreadyAbsent
        })
    }

    async fn get(&self, file_id: FileId) -> Result<Option<DownstreamRow>, ApplyError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        self.db
            .get(&rtxn, file_id.as_bytes())
            .map_err(backend)?
            .map(|bytes| decode(bytes).map_err(backend))
            .transpose()
    }

    async fn tombstone(&self, file_id: FileId) -> Result<Option<Tombstone>, ApplyError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        self.tombstones
            .get(&rtxn, file_id.as_bytes())
            .map_err(backend)?
            .map(|bytes| decode(bytes).map_err(backend))
            .transpose()
    }

    async fn prune_tombstones(&self, cutoff: Timestamp) -> Result<u64, ApplyError> {
        let mut wtxn = self.env.write_txn().map_err(backend)?;
        let mut expired = Vec::new();
        for result in self.tombstones.iter(&wtxn).map_err(backend)? {
            let (key, bytes) = result.map_err(backend)?;
            let tombstone: Tombstone = decode(bytes).map_err(backend)?;
            if tombstone.deleted_at < cutoff {
                expired.push(key.to_vec());
            }
        }
        for key in &expired {
            self.tombstones.delete(&mut wtxn, key).map_err(backend)?;
        }
        wtxn.commit().map_err(backend)?;
        Ok(expired.len() as u64)
    }

    async fn find_by_checksum(&self, checksum: &str) -> Result<Vec<DownstreamRow>, ApplyError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        let mut found = Vec::new();
        for result in self.db.iter(&rtxn).map_err(backend)? {
            let (_, bytes) = result.map_err(backend)?;
            let row: DownstreamRow = decode(bytes).map_err(backend)?;
            if row.record.checksum == checksum {
                found.push(row);
            }
        }
        Ok(found)
    }

    async fn len(&self) -> Result<u64, ApplyError> {
        let rtxn = self.env.read_txn().map_err(backend)?;
        self.db.len(&rtxn).map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;
    use tessera_storage::open_env;

    fn row(record: &AttributeRecord, event: StreamId) -> DownstreamRow {
        DownstreamRow {
            record: record.clone(),
            source_event_id: event,
            synced_at: Utc::now(),
        }
    }

    fn tombstone(file_id: FileId, event: StreamId) -> Tombstone {
        Tombstone {
            file_id,
            source_event_id: event,
            deleted_at: Utc::now(),
        }
    }

    fn record(checksum: &str) -> AttributeRecord {
        AttributeRecord::new("a.bin", 3, "application/octet-stream", checksum, Utc::now())
    }

    #[test]
    fn test_supersedes_orders_by_version_then_event() {
        let v1 = record("aa");
        let mut v2 = v1.clone();
        v2.updated_at = v1.updated_at + ChronoDuration::seconds(1);

        let old = row(&v1, StreamId::new(10, 0));
        assert!(supersedes(&row(&v2, StreamId::new(5, 0)), &old));
        assert!(!supersedes(&row(&v1, StreamId::new(10, 0)), &old));
        assert!(supersedes(&row(&v1, StreamId::new(11, 0)), &old));
        assert!(!supersedes(&old, &row(&v2, StreamId::new(1, 0))));
    }

    async fn exercise(cache: &dyn DownstreamCache) {
        let v1 = record("aa");
        let mut v2 = v1.clone();
        v2.updated_at = v1.updated_at + ChronoDuration::seconds(1);
        v2.checksum = "bb".to_string();

        assert_eq!(
            cache.upsert_versioned(row(&v1, StreamId::new(1, 0))).await.expect("upsert"),
            UpsertOutcome::Applied
        );
        assert_eq!(
            cache.upsert_versioned(row(&v2, StreamId::new(2, 0))).await.expect("upsert"),
            UpsertOutcome::Applied
        );
        // Late delivery of the older version.
        assert_eq!(
            cache.upsert_versioned(row(&v1, StreamId::new(1, 0))).await.expect("upsert"),
            UpsertOutcome::Stale
        );
        let stored = cache.get(v1.file_id).await.expect("get").expect("row exists");
        assert_eq!(stored.record.checksum, "bb");

        let other = record("bb");
        cache
            .upsert_versioned(row(&other, StreamId::new(3, 0)))
            .await
            .expect("upsert");
        assert_eq!(cache.find_by_checksum("bb").await.expect("find").len(), 2);
        assert!(cache.find_by_checksum("aa").await.expect("find").is_empty());
        assert_eq!(cache.len().await.expect("len"), 2);

        assert_eq!(
            cache
                .delete(tombstone(v1.file_id, StreamId::new(4, 0)))
                .await
                .expect("delete"),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            cache
                .delete(tombstone(v1.file_id, StreamId::new(4, 0)))
                .await
                .expect("delete absent"),
            DeleteOutcome::AlreadyAbsent
        );
        assert!(cache.get(v1.file_id).await.expect("get").is_none());
    }

    async fn exercise_tombstones(cache: &dyn DownstreamCache) {
        let v1 = record("aa");
        let file_id = v1.file_id;
        cache
            .upsert_versioned(row(&v1, StreamId::new(1, 0)))
            .await
            .expect("upsert");
        cache
            .delete(tombstone(file_id, StreamId::new(2, 0)))
            .await
            .expect("delete");

        // Retried create from before the delete.
        assert_eq!(
            cache.upsert_versioned(row(&v1, StreamId::new(1, 0))).await.expect("upsert"),
            UpsertOutcome::Stale
        );
        assert!(cache.get(file_id).await.expect("get").is_none());

        // An older delete arriving late keeps the later tombstone.
        cache
            .delete(tombstone(file_id, StreamId::new(1, 5)))
            .await
            .expect("late delete");
        assert_eq!(
            cache
                .tombstone(file_id)
                .await
                .expect("tombstone")
                .map(|t| t.source_event_id),
            Some(StreamId::new(2, 0))
        );

        // A create published after the delete re-creates the row.
        let mut v2 = v1.clone();
        v2.updated_at = v1.updated_at + ChronoDuration::seconds(1);
        assert_eq!(
            cache.upsert_versioned(row(&v2, StreamId::new(3, 0))).await.expect("upsert"),
            UpsertOutcome::Applied
        );
        assert!(cache.tombstone(file_id).await.expect("tombstone").is_none());

        // Redelivery of the earlier delete does not remove the newer row.
        assert_eq!(
            cache
                .delete(tombstone(file_id, StreamId::new(2, 0)))
                .await
                .expect("redelivered delete"),
            DeleteOutcome::Stale
        );
        assert!(cache.get(file_id).await.expect("get").is_some());

        let other = FileId::new();
        cache
            .delete(tombstone(other, StreamId::new(5, 0)))
            .await
            .expect("delete absent");
        assert_eq!(cache.prune_tombstones(Utc::now() - ChronoDuration::hours(1)).await.expect("prune"), 0);
        assert_eq!(cache.prune_tombstones(Utc::now() + ChronoDuration::seconds(1)).await.expect("prune"), 1);
        assert!(cache.tombstone(other).await.expect("tombstone").is_none());
    }

    #[tokio::test]
    async fn test_in_memory_cache() {
        exercise(&InMemoryDownstreamCache::new()).await;
    }

    #[tokio::test]
    async fn test_lmdb_cache() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = open_env(dir.path(), 16).expect("env should open");
        let cache = LmdbDownstreamCache::open(&env).expect("cache should open");
        exercise(&cache).await;
    }

    #[tokio::test]
    async fn test_in_memory_tombstones_block_resurrection() {
        exercise_tombstones(&InMemoryDownstreamCache::new()).await;
    }

    #[tokio::test]
    async fn test_lmdb_tombstones_block_resurrection() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = open_env(dir.path(), 16).expect("env should open");
        let cache = LmdbDownstreamCache::open(&env).expect("cache should open");
        exercise_tombstones(&cache).await;
    }

    #[tokio::test]
    async fn test_lmdb_tombstones_survive_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let v1 = record("aa");
        {
            let env = open_env(dir.path(), 16).expect("env should open");
            let cache = LmdbDownstreamCache::open(&env).expect("cache should open");
            cache
                .delete(tombstone(v1.file_id, StreamId::new(2, 0)))
                .await
                .expect("delete");
        }
        let env = open_env(dir.path(), 16).expect("env should reopen");
        let cache = LmdbDownstreamCache::open(&env).expect("cache should open");
        assert_eq!(
            cache.upsert_versioned(row(&v1, StreamId::new(1, 0))).await.expect("upsert"),
            UpsertOutcome::Stale
        );
    }
}
