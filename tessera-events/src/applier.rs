//! Applies change events to the downstream cache.
//!
//! Applying the same entry any number of times leaves the cache in the state
//! of applying it once; the subscriber relies on this for at-least-once
//! delivery. Deletes leave tombstones, so a create redelivered after its
//! delete stays deleted.

use std::sync::Arc;
use std::time::Duration;

use tessera_core::{ApplyError, Clock, FileEvent, FileEventType};

use crate::downstream::{DeleteOutcome, DownstreamCache, DownstreamRow, Tombstone, UpsertOutcome};
use crate::stream::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Upserted,
    /// Same or newer version already stored, or superseded by a delete (or,
    /// for a delete, by a later create).
    SkippedStale,
    Deleted,
    /// Delete of a row that was not there.
    AlreadyAbsent,
}

#[derive(Clone)]
pub struct CacheSyncApplier {
    cache: Arc<dyn DownstreamCache>,
    clock: Arc<dyn Clock>,
}

impl CacheSyncApplier {
    pub fn new(cache: Arc<dyn DownstreamCache>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    pub fn cache(&self) -> &Arc<dyn DownstreamCache> {
        &self.cache
    }

    /// Apply the event stored at stream entry `id`.
    ///
    /// # Errors
    ///
    /// Malformed events and downstream failures return [`ApplyError`]; the
    /// caller leaves the entry pending.
    pub async fn apply(&self, id: StreamId, event: &FileEvent) -> Result<ApplyOutcome, ApplyError> {
        let outcome = match event.event_type {
            FileEventType::Created | FileEventType::Updated => {
                let record = event
                    .snapshot
                    .clone()
                    .ok_or_else(|| ApplyError::MissingSnapshot {
                        event_id: id.to_string(),
                        event_type: event.event_type.to_string(),
                    })?;
                if record.file_id != event.file_id {
                    return Err(ApplyError::FileIdMismatch {
                        event_id: id.to_string(),
                        expected: event.file_id,
                        got: record.file_id,
                    });
                }
                let row = DownstreamRow {
                    record,
                    source_event_id: id,
                    synced_at: self.clock.now(),
                };
                match self.cache.upsert_versioned(row).await? {
                    UpsertOutcome::Applied => ApplyOutcome::Upserted,
                    UpsertOutcome::Stale => ApplyOutcome::SkippedStale,
                }
            }
            FileEventType::Deleted => {
                let tombstone = Tombstone {
                    file_id: event.file_id,
                    source_event_id: id,
                    deleted_at: self.clock.now(),
                };
                match self.cache.delete(tombstone).await? {
                    DeleteOutcome::Deleted => ApplyOutcome::Deleted,
                    DeleteOutcome::AlreadyAbsent => ApplyOutcome::AlreadyAbsent,
                    DeleteOutcome::Stale => ApplyOutcome::SkippedStale,
                }
            }
        };

        tracing::debug!(
            ctx_event_id = %id,
            ctx_event_type = %event.event_type,
            ctx_file_id = %event.file_id,
            ctx_outcome = ?outcome,
            "Applied change event"
        );
        Ok(outcome)
    }

    /// Drop tombstones older than `retention`.
    pub async fn prune_tombstones(&self, retention: Duration) -> Result<u64, ApplyError> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        self.cache.prune_tombstones(cutoff).await
    }
}

impl std::fmt::Debug for CacheSyncApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSyncApplier").finish_non_exhaustive()
    }
}
