//! LMDB-backed write-ahead log.
//!
//! Entries are keyed by their UUIDv7 transaction id, so a cursor walks them in
//! creation order. Status transitions rewrite the entry in place.

use heed::types::Bytes;
use heed::{Database, Env};
use tessera_core::{DurabilityError, TesseraResult, Timestamp, WalEntry, WalStatus};
use uuid::Uuid;

use crate::lmdb::{decode, encode, open_database, LmdbError};

const WAL_DB_NAME: &str = "wal";

/// Per-status counts of logged entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalCounts {
    pub pending: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
}

pub struct WriteAheadLog {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl WriteAheadLog {
    /// Open the `wal` database inside a node environment.
    pub fn open(env: &Env) -> Result<Self, LmdbError> {
        let db = open_database(env, WAL_DB_NAME)?;
        Ok(Self {
            env: env.clone(),
            db,
        })
    }

    /// Durably record a new entry.
    pub fn append(&self, entry: &WalEntry) -> Result<(), DurabilityError> {
        self.put(entry).map_err(|e| DurabilityError::WalAppendFailed {
            transaction_id: entry.transaction_id,
            reason: e.to_string(),
        })
    }

    /// Move an entry to `status`, returning the updated entry.
    pub fn transition(
        &self,
        transaction_id: Uuid,
        status: WalStatus,
        error: Option<String>,
        now: Timestamp,
    ) -> Result<WalEntry, DurabilityError> {
        let fail = |reason: String| DurabilityError::WalCommitFailed {
            transaction_id,
            reason,
        };

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| fail(e.to_string()))?;

        let current: WalEntry = match self
            .db
            .get(&wtxn, transaction_id.as_bytes())
            .map_err(|e| fail(e.to_string()))?
        {
            Some(bytes) => decode(bytes).map_err(|e| fail(e.to_string()))?,
            None => return Err(fail("entry not found".to_string())),
        };

        let next = current.with_status(status, error, now);
        let bytes = encode(&next).map_err(|e| fail(e.to_string()))?;
        self.db
            .put(&mut wtxn, transaction_id.as_bytes(), &bytes)
            .map_err(|e| fail(e.to_string()))?;
        wtxn.commit().map_err(|e| fail(e.to_string()))?;

        Ok(next)
    }

    pub fn get(&self, transaction_id: Uuid) -> TesseraResult<Option<WalEntry>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        match self
            .db
            .get(&rtxn, transaction_id.as_bytes())
            .map_err(|e| LmdbError::Transaction(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Pending entries in creation order.
    pub fn pending(&self) -> TesseraResult<Vec<WalEntry>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        let mut pending = Vec::new();
        for result in iter {
            let (_, bytes) = result.map_err(|e| LmdbError::Transaction(e.to_string()))?;
            let entry: WalEntry = decode(bytes)?;
            if entry.status == WalStatus::Pending {
                pending.push(entry);
            }
        }
        Ok(pending)
    }

    pub fn counts(&self) -> TesseraResult<WalCounts> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        let mut counts = WalCounts::default();
        for result in iter {
            let (_, bytes) = result.map_err(|e| LmdbError::Transaction(e.to_string()))?;
            let entry: WalEntry = decode(bytes)?;
            match entry.status {
                WalStatus::Pending => counts.pending += 1,
                WalStatus::Committed => counts.committed += 1,
                WalStatus::RolledBack => counts.rolled_back += 1,
                WalStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Delete terminal entries last touched before `cutoff`. Pending entries
    /// are never pruned.
    pub fn prune(&self, cutoff: Timestamp) -> TesseraResult<u64> {
        let stale: Vec<Vec<u8>> = {
            let rtxn = self
                .env
                .read_txn()
                .map_err(|e| LmdbError::Transaction(e.to_string()))?;
            let iter = self
                .db
                .iter(&rtxn)
                .map_err(|e| LmdbError::Transaction(e.to_string()))?;

            let mut keys = Vec::new();
            for result in iter {
                let (key, bytes) = result.map_err(|e| LmdbError::Transaction(e.to_string()))?;
                let entry: WalEntry = decode(bytes)?;
                if entry.status.is_terminal() && entry.updated_at < cutoff {
                    keys.push(key.to_vec());
                }
            }
            keys
        };

        if stale.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        let mut removed = 0u64;
        for key in &stale {
            if self
                .db
                .delete(&mut wtxn, key)
                .map_err(|e| LmdbError::Transaction(e.to_string()))?
            {
                removed += 1;
            }
        }
        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;

        Ok(removed)
    }

    fn put(&self, entry: &WalEntry) -> Result<(), LmdbError> {
        let bytes = encode(entry)?;
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        self.db
            .put(&mut wtxn, entry.transaction_id.as_bytes(), &bytes)
            .map_err(|e| LmdbError::Transaction(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| LmdbError::Transaction(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmdb::open_env;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;
    use tessera_core::{AttributeRecord, FileId, WalOperation};

    fn wal() -> (TempDir, WriteAheadLog) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = open_env(dir.path(), 16).expect("env should open");
        let wal = WriteAheadLog::open(&env).expect("wal should open");
        (dir, wal)
    }

    fn entry(op: WalOperation) -> WalEntry {
        let now = Utc::now();
        let record = AttributeRecord::new("x.bin", 1, "text/plain", "aa", now);
        WalEntry::pending(op, record.file_id, Some(record), now)
    }

    #[test]
    fn test_append_and_commit() {
        let (_dir, wal) = wal();
        let e = entry(WalOperation::Create);
        wal.append(&e).expect("append should succeed");
        assert_eq!(wal.pending().expect("pending").len(), 1);

        let committed = wal
            .transition(e.transaction_id, WalStatus::Committed, None, Utc::now())
            .expect("commit should succeed");
        assert_eq!(committed.status, WalStatus::Committed);
        assert!(wal.pending().expect("pending").is_empty());
        assert_eq!(
            wal.get(e.transaction_id).expect("get").map(|e| e.status),
            Some(WalStatus::Committed)
        );
    }

    #[test]
    fn test_transition_unknown_entry_fails() {
        let (_dir, wal) = wal();
        let err = wal
            .transition(Uuid::now_v7(), WalStatus::Committed, None, Utc::now())
            .expect_err("unknown entry");
        assert!(matches!(err, DurabilityError::WalCommitFailed { .. }));
    }

    #[test]
    fn test_pending_in_creation_order() {
        let (_dir, wal) = wal();
        let first = entry(WalOperation::Create);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = WalEntry::pending(WalOperation::Delete, FileId::new(), None, Utc::now());
        wal.append(&second).expect("append second");
        wal.append(&first).expect("append first");

        let pending = wal.pending().expect("pending");
        let ids: Vec<Uuid> = pending.iter().map(|e| e.transaction_id).collect();
        assert_eq!(ids, vec![first.transaction_id, second.transaction_id]);
    }

    #[test]
    fn test_prune_keeps_pending_and_recent() {
        let (_dir, wal) = wal();
        let now = Utc::now();
        let old = entry(WalOperation::Create);
        let recent = entry(WalOperation::Update);
        let pending = entry(WalOperation::Delete);
        for e in [&old, &recent, &pending] {
            wal.append(e).expect("append");
        }
        wal.transition(old.transaction_id, WalStatus::Committed, None, now - Duration::days(8))
            .expect("commit old");
        wal.transition(recent.transaction_id, WalStatus::Failed, Some("x".into()), now)
            .expect("fail recent");

        let removed = wal.prune(now - Duration::days(7)).expect("prune");
        assert_eq!(removed, 1);
        let counts = wal.counts().expect("counts");
        assert_eq!(
            counts,
            WalCounts {
                pending: 1,
                committed: 0,
                rolled_back: 0,
                failed: 1
            }
        );
    }
}
