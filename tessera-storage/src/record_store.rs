//! WAL-protected write path over the attribute store.
//!
//! Every mutation follows the same order:
//!
//! 1. append a pending WAL entry
//! 2. atomically replace (or remove) the sidecar
//! 3. mark the entry committed
//! 4. mirror the change into the local cache table
//! 5. emit a change event
//!
//! Mutations of one file id run one at a time, from the existence check or
//! read through the event emission. Different ids proceed in parallel.
//!
//! A failure in step 2 marks the entry failed and leaves the cache alone.
//! Failures after step 3 never fail the write: the cache heals through lazy
//! and incremental rebuilds, and events are best-effort.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tessera_core::{
    AttributeRecord, CacheRow, Clock, DurabilityError, FileEvent, FileId, RecordMutation,
    StorageError, TesseraResult, WalEntry, WalOperation, WalStatus,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::attr_store::{AttrScan, AttributeStore};
use crate::cache_table::CacheTable;
use crate::sink::ChangeSink;
use crate::wal::{WalCounts, WriteAheadLog};

/// Result of a committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub transaction_id: Uuid,
    pub operation: WalOperation,
    pub file_id: FileId,
    /// Committed record. `None` after a delete.
    pub record: Option<AttributeRecord>,
}

/// Result of startup replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: u64,
    pub rolled_back: u64,
    pub temp_files_removed: u64,
}

/// Per-file-id write locks. Entries exist only while someone holds or
/// waits on them.
#[derive(Default)]
struct FileLocks {
    slots: DashMap<FileId, Arc<Mutex<()>>>,
}

impl FileLocks {
    async fn lock(&self, file_id: FileId) -> FileWriteGuard<'_> {
        let slot = self.slots.entry(file_id).or_default().clone();
        FileWriteGuard {
            guard: Some(slot.lock_owned().await),
            locks: self,
            file_id,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}

struct FileWriteGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a FileLocks,
    file_id: FileId,
}

impl Drop for FileWriteGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The shard is write-locked here, so no new waiter can clone the slot.
        self.locks
            .slots
            .remove_if(&self.file_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}

pub struct RecordStore {
    attrs: AttributeStore,
    file_locks: FileLocks,
    wal: WriteAheadLog,
    cache: Arc<CacheTable>,
    sink: Arc<dyn ChangeSink>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
}

impl RecordStore {
    pub fn new(
        attrs: AttributeStore,
        wal: WriteAheadLog,
        cache: Arc<CacheTable>,
        sink: Arc<dyn ChangeSink>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            attrs,
            file_locks: FileLocks::default(),
            wal,
            cache,
            sink,
            clock,
            cache_ttl,
        }
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn read_record(&self, file_id: FileId) -> TesseraResult<Option<AttributeRecord>> {
        self.attrs.read(file_id).await
    }

    pub async fn exists(&self, file_id: FileId) -> TesseraResult<bool> {
        self.attrs.exists(file_id).await
    }

    /// Streaming scan over stored record ids.
    pub async fn list_ids(&self) -> TesseraResult<AttrScan> {
        self.attrs.scan().await
    }

    pub async fn record_count(&self) -> TesseraResult<u64> {
        self.attrs.count().await
    }

    pub fn wal_counts(&self) -> TesseraResult<WalCounts> {
        self.wal.counts()
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Apply a mutation durably, then mirror and announce it.
    ///
    /// # Errors
    ///
    /// - `Validation` if a created or patched record is malformed
    /// - `Storage::AlreadyExists` when creating an id that is already stored
    /// - `Storage::NotFound` when updating or deleting a missing record
    /// - `Durability` if the WAL append or the sidecar write fails; the cache
    ///   is untouched in that case
    ///
    /// Concurrent writes to the same id are serialized.
    pub async fn write(
        &self,
        mutation: RecordMutation,
        actor: Option<&str>,
    ) -> TesseraResult<WriteOutcome> {
        let file_id = mutation.file_id();
        let operation = mutation.operation();
        let _serialized = self.file_locks.lock(file_id).await;
        let now = self.clock.now();

        let payload = match mutation {
            RecordMutation::Create(mut record) => {
                if record.created_by.is_none() {
                    record.created_by = actor.map(str::to_string);
                }
                record.validate()?;
                if self.attrs.exists(file_id).await? {
                    return Err(StorageError::AlreadyExists { file_id }.into());
                }
                Some(record)
            }
            RecordMutation::Update { patch, .. } => {
                let current = self
                    .attrs
                    .read(file_id)
                    .await?
                    .ok_or(StorageError::NotFound { file_id })?;
                let next = patch.apply(&current, now);
                next.validate()?;
                Some(next)
            }
            RecordMutation::Delete { .. } => {
                if !self.attrs.exists(file_id).await? {
                    return Err(StorageError::NotFound { file_id }.into());
                }
                None
            }
        };

        let entry = WalEntry::pending(operation, file_id, payload.clone(), now);
        self.wal.append(&entry)?;

        let applied = match &payload {
            Some(record) => self.attrs.write_atomic(record).await,
            None => self.attrs.remove(file_id).await.map(|_| ()),
        };
        if let Err(e) = applied {
            self.mark_failed(&entry, &e);
            return Err(e.into());
        }

        self.wal.transition(
            entry.transaction_id,
            WalStatus::Committed,
            None,
            self.clock.now(),
        )?;

        tracing::info!(
            ctx_transaction_id = %entry.transaction_id,
            ctx_file_id = %file_id,
            ctx_operation = %operation,
            ctx_actor = actor.unwrap_or("-"),
            "Record mutation committed"
        );

        self.after_commit(operation, file_id, payload.as_ref()).await;

        Ok(WriteOutcome {
            transaction_id: entry.transaction_id,
            operation,
            file_id,
            record: payload,
        })
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    /// Resolve every pending WAL entry and remove stray temp files.
    ///
    /// An entry commits if the sidecar on disk already holds its intended end
    /// state (for a delete: the sidecar is absent), otherwise it rolls back.
    /// Committed entries re-sync their cache row and re-emit their event.
    pub async fn recover(&self) -> TesseraResult<RecoveryReport> {
        let mut report = RecoveryReport {
            temp_files_removed: self.attrs.cleanup_temp_files().await?,
            ..RecoveryReport::default()
        };

        for entry in self.wal.pending()? {
            let _serialized = self.file_locks.lock(entry.file_id).await;
            let on_disk = match self.attrs.read(entry.file_id).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        ctx_transaction_id = %entry.transaction_id,
                        ctx_file_id = %entry.file_id,
                        error = %e,
                        "Unreadable sidecar during WAL replay"
                    );
                    self.wal.transition(
                        entry.transaction_id,
                        WalStatus::RolledBack,
                        Some(e.to_string()),
                        self.clock.now(),
                    )?;
                    report.rolled_back += 1;
                    continue;
                }
            };

            let reflected = match entry.operation {
                WalOperation::Delete => on_disk.is_none(),
                WalOperation::Create | WalOperation::Update => {
                    entry.payload.is_some() && on_disk == entry.payload
                }
            };

            if reflected {
                self.wal.transition(
                    entry.transaction_id,
                    WalStatus::Committed,
                    None,
                    self.clock.now(),
                )?;
                report.committed += 1;
                self.after_commit(entry.operation, entry.file_id, entry.payload.as_ref())
                    .await;
            } else {
                self.wal.transition(
                    entry.transaction_id,
                    WalStatus::RolledBack,
                    Some("sidecar does not reflect the logged end state".to_string()),
                    self.clock.now(),
                )?;
                report.rolled_back += 1;
            }
        }

        tracing::info!(
            ctx_committed = report.committed,
            ctx_rolled_back = report.rolled_back,
            ctx_temp_files_removed = report.temp_files_removed,
            "WAL replay complete"
        );
        Ok(report)
    }

    /// Drop terminal WAL entries older than `retention`.
    pub fn prune_wal(&self, retention: Duration) -> TesseraResult<u64> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let removed = self.wal.prune(cutoff)?;
        if removed > 0 {
            tracing::debug!(ctx_removed = removed, "Pruned WAL entries");
        }
        Ok(removed)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn after_commit(
        &self,
        operation: WalOperation,
        file_id: FileId,
        record: Option<&AttributeRecord>,
    ) {
        let now = self.clock.now();

        let synced = match record {
            Some(record) => self
                .cache
                .upsert(&CacheRow::from_record(record.clone(), now, self.cache_ttl))
                .map(|_| ()),
            None => self.cache.delete(file_id).map(|_| ()),
        };
        if let Err(e) = synced {
            tracing::warn!(
                ctx_file_id = %file_id,
                ctx_operation = %operation,
                error = %e,
                "Cache row sync failed after commit"
            );
        }

        let event = match (operation, record) {
            (WalOperation::Create, Some(record)) => FileEvent::created(record.clone(), now),
            (WalOperation::Update, Some(record)) => FileEvent::updated(record.clone(), now),
            _ => FileEvent::deleted(file_id, now),
        };
        self.sink.emit(event).await;
    }

    fn mark_failed(&self, entry: &WalEntry, cause: &DurabilityError) {
        if let Err(e) = self.wal.transition(
            entry.transaction_id,
            WalStatus::Failed,
            Some(cause.to_string()),
            self.clock.now(),
        ) {
            tracing::error!(
                ctx_transaction_id = %entry.transaction_id,
                error = %e,
                "Failed to mark WAL entry failed"
            );
        }
        tracing::error!(
            ctx_transaction_id = %entry.transaction_id,
            ctx_file_id = %entry.file_id,
            ctx_operation = %entry.operation,
            error = %cause,
            "Record mutation not durable"
        );
    }
}
