//! LMDB-backed stream broker.
//!
//! Entries live in one database keyed by `<stream> 0x00 <id big-endian>`, so a
//! range over a stream's prefix walks it in id order. Per-stream metadata
//! (last id, length and every group's [`GroupState`]) is a single JSON value
//! in a second database. Each broker operation is one write transaction,
//! which serializes appends, deliveries and claims across every process
//! sharing the environment.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tessera_core::{BrokerError, Clock, FileEvent, SystemClock};
use tessera_storage::lmdb::{decode, encode};
use tessera_storage::{open_database, open_env, LmdbError};
use tokio::sync::Notify;

use crate::broker::{group_missing, StreamBroker};
use crate::group::GroupState;
use crate::stream::{
    Claimed, GroupStart, PendingEntry, StreamBatch, StreamEntry, StreamId, TrimPolicy,
};

const ENTRIES_DB_NAME: &str = "stream_entries";
const META_DB_NAME: &str = "stream_meta";

/// How often a blocked reader re-checks for entries appended by another
/// process sharing the environment.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamMeta {
    last_id: StreamId,
    length: u64,
    groups: BTreeMap<String, GroupState>,
}

fn storage(e: impl Display) -> BrokerError {
    BrokerError::Storage {
        reason: e.to_string(),
    }
}

fn entry_key(stream: &str, id: StreamId) -> Vec<u8> {
    let mut key = Vec::with_capacity(stream.len() + 17);
    key.extend_from_slice(stream.as_bytes());
    key.push(0);
    key.extend_from_slice(&id.to_bytes());
    key
}

/// Exclusive upper bound of a stream's key range.
fn stream_end(stream: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(stream.len() + 1);
    key.extend_from_slice(stream.as_bytes());
    key.push(1);
    key
}

fn id_from_key(stream: &str, key: &[u8]) -> Option<StreamId> {
    key.get(stream.len() + 1..).and_then(StreamId::from_bytes)
}

#[derive(Debug, Clone)]
pub struct LmdbStreamBroker {
    env: Env,
    entries: Database<Bytes, Bytes>,
    meta: Database<Bytes, Bytes>,
    appended: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl LmdbStreamBroker {
    /// Open the broker databases inside an existing environment.
    pub fn open(env: &Env, clock: Arc<dyn Clock>) -> Result<Self, LmdbError> {
        Ok(Self {
            env: env.clone(),
            entries: open_database(env, ENTRIES_DB_NAME)?,
            meta: open_database(env, META_DB_NAME)?,
            appended: Arc::new(Notify::new()),
            clock,
        })
    }

    /// Open (creating if needed) a dedicated broker environment at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, LmdbError> {
        let env = open_env(path, map_size_mb)?;
        Self::open(&env, Arc::new(SystemClock))
    }

    fn load_meta(&self, txn: &RoTxn<'_>, stream: &str) -> Result<Option<StreamMeta>, BrokerError> {
        self.meta
            .get(txn, stream.as_bytes())
            .map_err(storage)?
            .map(|bytes| decode(bytes).map_err(storage))
            .transpose()
    }

    fn store_meta(
        &self,
        wtxn: &mut RwTxn<'_>,
        stream: &str,
        meta: &StreamMeta,
    ) -> Result<(), BrokerError> {
        let bytes = encode(meta).map_err(storage)?;
        self.meta
            .put(wtxn, stream.as_bytes(), &bytes)
            .map_err(storage)
    }

    /// Keys of entries at the head of `stream` that `trim` evicts.
    fn trim_candidates(
        &self,
        txn: &RoTxn<'_>,
        stream: &str,
        length: u64,
        trim: &TrimPolicy,
    ) -> Result<Vec<Vec<u8>>, BrokerError> {
        let now = self.clock.now();
        let excess = trim
            .max_len
            .map(|max| length.saturating_sub(max as u64))
            .unwrap_or(0);
        let lower = entry_key(stream, StreamId::ZERO);
        let upper = stream_end(stream);
        let range = (
            Bound::Included(lower.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );

        let mut doomed = Vec::new();
        for result in self.entries.range(txn, &range).map_err(storage)? {
            let (key, _) = result.map_err(storage)?;
            let over_length = (doomed.len() as u64) < excess;
            let expired = id_from_key(stream, key)
                .map(|id| trim.is_expired(id, now))
                .unwrap_or(true);
            if !over_length && !expired {
                break;
            }
            doomed.push(key.to_vec());
        }
        Ok(doomed)
    }

    /// Oldest id still retained in `stream`.
    fn first_retained(&self, txn: &RoTxn<'_>, stream: &str) -> Result<Option<StreamId>, BrokerError> {
        let lower = entry_key(stream, StreamId::ZERO);
        let upper = stream_end(stream);
        let range = (
            Bound::Included(lower.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );
        let mut iter = self.entries.range(txn, &range).map_err(storage)?;
        match iter.next() {
            Some(result) => {
                let (key, _) = result.map_err(storage)?;
                Ok(id_from_key(stream, key))
            }
            None => Ok(None),
        }
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let now = self.clock.now();
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let mut meta = self
            .load_meta(&wtxn, stream)?
            .ok_or_else(|| group_missing(stream, group))?;
        let state = meta
            .groups
            .get_mut(group)
            .ok_or_else(|| group_missing(stream, group))?;

        let lower = entry_key(stream, state.last_delivered);
        let upper = stream_end(stream);
        let range = (
            Bound::Excluded(lower.as_slice()),
            Bound::Excluded(upper.as_slice()),
        );
        let mut fresh = Vec::new();
        for result in self.entries.range(&wtxn, &range).map_err(storage)?.take(count) {
            let (key, bytes) = result.map_err(storage)?;
            let Some(id) = id_from_key(stream, key) else {
                continue;
            };
            fresh.push(StreamEntry {
                id,
                event: decode(bytes).map_err(storage)?,
            });
        }

        if fresh.is_empty() {
            return Ok(fresh);
        }
        let ids: Vec<StreamId> = fresh.iter().map(|e| e.id).collect();
        state.deliver(&ids, consumer, now);
        self.store_meta(&mut wtxn, stream, &meta)?;
        wtxn.commit().map_err(storage)?;
        Ok(fresh)
    }
}

#[async_trait]
impl StreamBroker for LmdbStreamBroker {
    async fn append(
        &self,
        stream: &str,
        event: &FileEvent,
        trim: &TrimPolicy,
    ) -> Result<StreamId, BrokerError> {
        let now = self.clock.now();
        let bytes = encode(event).map_err(storage)?;

        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let mut meta = self.load_meta(&wtxn, stream)?.unwrap_or_default();
        let id = StreamId::next_after(meta.last_id, now);
        self.entries
            .put(&mut wtxn, &entry_key(stream, id), &bytes)
            .map_err(storage)?;
        meta.last_id = id;
        meta.length += 1;

        let doomed = self.trim_candidates(&wtxn, stream, meta.length, trim)?;
        for key in &doomed {
            self.entries.delete(&mut wtxn, key).map_err(storage)?;
        }
        meta.length = meta.length.saturating_sub(doomed.len() as u64);

        self.store_meta(&mut wtxn, stream, &meta)?;
        wtxn.commit().map_err(storage)?;

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, BrokerError> {
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let mut meta = self.load_meta(&wtxn, stream)?.unwrap_or_default();
        if meta.groups.contains_key(group) {
            return Ok(false);
        }
        let after = match start {
            GroupStart::Beginning => StreamId::ZERO,
            GroupStart::Latest => meta.last_id,
        };
        meta.groups
            .insert(group.to_string(), GroupState::starting_after(after));
        self.store_meta(&mut wtxn, stream, &meta)?;
        wtxn.commit().map_err(storage)?;
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, BrokerError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.deliver_new(stream, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(vec![StreamBatch {
                    stream: stream.to_string(),
                    entries,
                }]);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake = deadline.min(now + POLL_INTERVAL);
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, BrokerError> {
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let mut meta = self
            .load_meta(&wtxn, stream)?
            .ok_or_else(|| group_missing(stream, group))?;
        let acked = meta
            .groups
            .get_mut(group)
            .ok_or_else(|| group_missing(stream, group))?
            .ack(ids);
        if acked > 0 {
            self.store_meta(&mut wtxn, stream, &meta)?;
            wtxn.commit().map_err(storage)?;
        }
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let now = self.clock.now();
        let rtxn = self.env.read_txn().map_err(storage)?;
        let meta = self
            .load_meta(&rtxn, stream)?
            .ok_or_else(|| group_missing(stream, group))?;
        let state = meta
            .groups
            .get(group)
            .ok_or_else(|| group_missing(stream, group))?;
        Ok(state.pending_entries(count, now))
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Claimed>, BrokerError> {
        let now = self.clock.now();
        let mut wtxn = self.env.write_txn().map_err(storage)?;
        let mut meta = self
            .load_meta(&wtxn, stream)?
            .ok_or_else(|| group_missing(stream, group))?;
        let first = self.first_retained(&wtxn, stream)?;
        let state = meta
            .groups
            .get_mut(group)
            .ok_or_else(|| group_missing(stream, group))?;

        // Trimming only ever removes from the head.
        let ids = state.claim_idle(consumer, min_idle, count, now, |id| {
            first.map(|first| id >= first).unwrap_or(false)
        });

        let mut claimed = Vec::with_capacity(ids.len());
        for (id, delivery_count) in ids {
            let Some(bytes) = self
                .entries
                .get(&wtxn, &entry_key(stream, id))
                .map_err(storage)?
            else {
                continue;
            };
            claimed.push(Claimed {
                id,
                event: decode(bytes).map_err(storage)?,
                delivery_count,
            });
        }

        self.store_meta(&mut wtxn, stream, &meta)?;
        wtxn.commit().map_err(storage)?;
        Ok(claimed)
    }

    async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
        let rtxn = self.env.read_txn().map_err(storage)?;
        Ok(self
            .load_meta(&rtxn, stream)?
            .map(|meta| meta.length)
            .unwrap_or(0))
    }
}
