//! TESSERA Test Utilities
//!
//! Shared test infrastructure for the TESSERA workspace:
//! - Proptest generators for records, mutations and events
//! - Fixtures: records, a node in a temporary directory
//! - A recording change sink
//! - Fault-injecting broker and downstream cache wrappers

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

// Re-export core types for convenience
pub use tessera_core::{
    compute_checksum, AttributeRecord, BrokerError, Clock, FileEvent, FileEventType, FileId,
    ManualClock, MetadataPatch, NodeConfig, RecordMutation, StreamConfig, SystemClock,
    TesseraError, TesseraResult, Timestamp,
};
pub use tessera_events::{
    Claimed, DeleteOutcome, DownstreamCache, DownstreamRow, GroupStart, InMemoryDownstreamCache,
    InMemoryStreamBroker, PendingEntry, StreamBatch, StreamBroker, StreamId, Tombstone,
    TrimPolicy, UpsertOutcome,
};
pub use tessera_storage::{ChangeSink, Node, NoopSink};

use tessera_core::ApplyError;

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    /// A valid record named `filename` with content derived from the name.
    pub fn record(filename: &str, now: Timestamp) -> AttributeRecord {
        AttributeRecord::new(
            filename,
            filename.len() as u64 * 128,
            "application/octet-stream",
            compute_checksum(filename.as_bytes()),
            now,
        )
    }

    /// A record with a creator and one metadata entry.
    pub fn tagged_record(filename: &str, creator: &str, tag: &str, now: Timestamp) -> AttributeRecord {
        record(filename, now)
            .with_creator(creator)
            .with_metadata("tag", serde_json::Value::String(tag.to_string()))
    }

    /// Node config rooted at `dir` with short lock waits.
    pub fn node_config(dir: &TempDir) -> NodeConfig {
        NodeConfig {
            lock_timeout: Duration::from_secs(2),
            lazy_lock_timeout: Duration::from_millis(50),
            operation_timeout: Duration::from_secs(30),
            lmdb_map_size_mb: 64,
            ..NodeConfig::with_data_dir(dir.path())
        }
    }

    /// Stream config with short timeouts for tests.
    pub fn stream_config(consumer: &str) -> StreamConfig {
        StreamConfig {
            consumer: consumer.to_string(),
            block_timeout: Duration::from_millis(20),
            idle_threshold: Duration::from_millis(50),
            redrive_interval: Duration::from_millis(25),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(40),
            ..StreamConfig::default()
        }
    }
}

/// A node in its own temporary directory. The directory lives as long as
/// this value.
pub struct TempNode {
    pub dir: TempDir,
    pub node: Arc<Node>,
}

impl TempNode {
    pub async fn open(sink: Arc<dyn ChangeSink>, clock: Arc<dyn Clock>) -> TesseraResult<Self> {
        let dir = TempDir::new().map_err(|e| {
            TesseraError::from(tessera_core::StorageError::Io {
                path: "tempdir".to_string(),
                reason: e.to_string(),
            })
        })?;
        let node = Node::open(fixtures::node_config(&dir), sink, clock).await?;
        Ok(Self {
            dir,
            node: Arc::new(node),
        })
    }

    /// A node that discards change events.
    pub async fn quiet() -> TesseraResult<Self> {
        Self::open(Arc::new(NoopSink), Arc::new(SystemClock)).await
    }
}

// ============================================================================
// RECORDING SINK
// ============================================================================

/// Change sink that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FileEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FileEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn event_types(&self) -> Vec<FileEventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

#[async_trait]
impl ChangeSink for RecordingSink {
    async fn emit(&self, event: FileEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Broker wrapper that fails every call while switched off.
pub struct FlakyBroker {
    inner: Arc<dyn StreamBroker>,
    down: AtomicBool,
}

impl FlakyBroker {
    pub fn new(inner: Arc<dyn StreamBroker>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable {
                reason: "injected outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StreamBroker for FlakyBroker {
    async fn append(
        &self,
        stream: &str,
        event: &FileEvent,
        trim: &TrimPolicy,
    ) -> Result<StreamId, BrokerError> {
        self.check()?;
        self.inner.append(stream, event, trim).await
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, BrokerError> {
        self.check()?;
        self.inner.ensure_group(stream, group, start).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, BrokerError> {
        self.check()?;
        self.inner
            .read_group(stream, group, consumer, count, block)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, BrokerError> {
        self.check()?;
        self.inner.ack(stream, group, ids).await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        self.check()?;
        self.inner.pending(stream, group, count).await
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Claimed>, BrokerError> {
        self.check()?;
        self.inner
            .claim_idle(stream, group, consumer, min_idle, count)
            .await
    }

    async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
        self.check()?;
        self.inner.len(stream).await
    }
}

/// Downstream cache whose next `n` upserts fail.
#[derive(Debug, Default)]
pub struct FlakyDownstreamCache {
    inner: InMemoryDownstreamCache,
    failures_left: AtomicU32,
}

impl FlakyDownstreamCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryDownstreamCache {
        &self.inner
    }
}

#[async_trait]
impl DownstreamCache for FlakyDownstreamCache {
    async fn upsert_versioned(&self, row: DownstreamRow) -> Result<UpsertOutcome, ApplyError> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ApplyError::Backend {
                reason: "injected downstream failure".to_string(),
            });
        }
        self.inner.upsert_versioned(row).await
    }

    async fn delete(&self, tombstone: Tombstone) -> Result<DeleteOutcome, ApplyError> {
        self.inner.delete(tombstone).await
    }

    async fn get(&self, file_id: FileId) -> Result<Option<DownstreamRow>, ApplyError> {
        self.inner.get(file_id).await
    }

    async fn tombstone(&self, file_id: FileId) -> Result<Option<Tombstone>, ApplyError> {
        self.inner.tombstone(file_id).await
    }

    async fn prune_tombstones(&self, cutoff: Timestamp) -> Result<u64, ApplyError> {
        self.inner.prune_tombstones(cutoff).await
    }

    async fn find_by_checksum(&self, checksum: &str) -> Result<Vec<DownstreamRow>, ApplyError> {
        self.inner.find_by_checksum(checksum).await
    }

    async fn len(&self) -> Result<u64, ApplyError> {
        self.inner.len().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    /// Timestamps between 2020 and 2030, millisecond precision.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800_000i64..1_893_456_000_000i64).prop_map(|ms| {
            Utc.timestamp_millis_opt(ms)
                .single()
                .unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_filename() -> impl Strategy<Value = String> {
        ("[a-z][a-z0-9_-]{0,20}", prop::sample::select(vec!["bin", "txt", "png", "json"]))
            .prop_map(|(stem, ext)| format!("{}.{}", stem, ext))
    }

    pub fn arb_content_type() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "application/octet-stream",
            "text/plain",
            "image/png",
            "application/json",
        ])
        .prop_map(str::to_string)
    }

    pub fn arb_metadata_value() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            any::<bool>().prop_map(serde_json::Value::Bool),
            any::<i32>().prop_map(serde_json::Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(serde_json::Value::String),
        ]
    }

    /// A valid record with up to three metadata entries.
    pub fn arb_record() -> impl Strategy<Value = AttributeRecord> {
        (
            arb_filename(),
            0u64..10_000_000,
            arb_content_type(),
            prop::collection::vec(any::<u8>(), 0..64),
            arb_timestamp(),
            prop::option::of("[a-z]{3,10}"),
            prop::collection::btree_map("[a-z]{1,8}", arb_metadata_value(), 0..3),
        )
            .prop_map(
                |(filename, size, content_type, content, now, creator, metadata)| {
                    let mut record =
                        AttributeRecord::new(filename, size, content_type, compute_checksum(&content), now);
                    record.created_by = creator;
                    record.metadata = metadata;
                    record
                },
            )
    }

    pub fn arb_patch() -> impl Strategy<Value = MetadataPatch> {
        (
            prop::collection::btree_map("[a-z]{1,8}", arb_metadata_value(), 0..3),
            prop::collection::vec("[a-z]{1,8}", 0..2),
            prop::option::of(arb_filename()),
            prop::option::of(arb_content_type()),
        )
            .prop_map(|(set, remove, original_filename, content_type)| MetadataPatch {
                set,
                remove,
                original_filename,
                content_type,
            })
    }

    /// A change history over `pool` file ids, in commit order.
    ///
    /// Each step touches one id: an absent id is created, a present one is
    /// updated or deleted. Every step is one second after the previous one,
    /// so `updated_at` grows with each version of a file, re-creates
    /// included.
    pub fn arb_history(
        pool: usize,
        steps: std::ops::Range<usize>,
    ) -> impl Strategy<Value = Vec<FileEvent>> {
        (
            prop::collection::vec(arb_record(), pool.max(1)),
            arb_timestamp(),
            prop::collection::vec((0..pool.max(1), 0u8..3, 0u64..10_000), steps),
        )
            .prop_map(|(bases, start, steps)| {
                let mut live: Vec<Option<AttributeRecord>> = vec![None; bases.len()];
                let mut events = Vec::with_capacity(steps.len());
                for (i, (slot, kind, size)) in steps.into_iter().enumerate() {
                    let at = start + chrono::Duration::seconds(i as i64 + 1);
                    match (live[slot].take(), kind) {
                        (None, _) => {
                            let mut record = bases[slot].clone();
                            record.created_at = at;
                            record.updated_at = at;
                            record.size = size;
                            events.push(FileEvent::created(record.clone(), at));
                            live[slot] = Some(record);
                        }
                        (Some(record), 0) => {
                            events.push(FileEvent::deleted(record.file_id, at));
                        }
                        (Some(mut record), _) => {
                            record.updated_at = at;
                            record.size = size;
                            events.push(FileEvent::updated(record.clone(), at));
                            live[slot] = Some(record);
                        }
                    }
                }
                events
            })
    }

    /// Final state per file id after applying `history` once, in order.
    pub fn in_order_state(
        history: &[FileEvent],
    ) -> std::collections::BTreeMap<FileId, Option<AttributeRecord>> {
        let mut state = std::collections::BTreeMap::new();
        for event in history {
            let row = match event.event_type {
                FileEventType::Deleted => None,
                FileEventType::Created | FileEventType::Updated => event.snapshot.clone(),
            };
            state.insert(event.file_id, row);
        }
        state
    }
}
