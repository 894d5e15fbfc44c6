//! In-process stream broker.
//!
//! All streams live behind one mutex; every operation, including claims, is a
//! single critical section. Blocking reads park on a [`Notify`] that appends
//! signal. Suitable for tests and for running publisher and subscriber inside
//! one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::{BrokerError, Clock, FileEvent, SystemClock, Timestamp};
use tokio::sync::Notify;

use crate::broker::{group_missing, StreamBroker};
use crate::group::GroupState;
use crate::stream::{
    Claimed, GroupStart, PendingEntry, StreamBatch, StreamEntry, StreamId, TrimPolicy,
};

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<StreamId, FileEvent>,
    last_id: StreamId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn trim(&mut self, policy: &TrimPolicy, now: Timestamp) -> u64 {
        let mut removed = 0u64;
        if let Some(max_len) = policy.max_len {
            while self.entries.len() > max_len {
                self.entries.pop_first();
                removed += 1;
            }
        }
        while let Some((id, _)) = self.entries.first_key_value() {
            if !policy.is_expired(*id, now) {
                break;
            }
            self.entries.pop_first();
            removed += 1;
        }
        removed
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryStreamBroker {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    appended: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStreamBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Broker whose ids, retention and idle times follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            appended: Arc::new(Notify::new()),
            clock,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let now = self.clock.now();
        let mut streams = self.table();
        let StreamState {
            entries, groups, ..
        } = streams
            .get_mut(stream)
            .ok_or_else(|| group_missing(stream, group))?;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| group_missing(stream, group))?;

        let fresh: Vec<StreamEntry> = entries
            .range((
                std::ops::Bound::Excluded(state.last_delivered),
                std::ops::Bound::Unbounded,
            ))
            .take(count)
            .map(|(id, event)| StreamEntry {
                id: *id,
                event: event.clone(),
            })
            .collect();

        let ids: Vec<StreamId> = fresh.iter().map(|e| e.id).collect();
        state.deliver(&ids, consumer, now);
        Ok(fresh)
    }
}

#[async_trait]
impl StreamBroker for InMemoryStreamBroker {
    async fn append(
        &self,
        stream: &str,
        event: &FileEvent,
        trim: &TrimPolicy,
    ) -> Result<StreamId, BrokerError> {
        let now = self.clock.now();
        let id = {
            let mut streams = self.table();
            let state = streams.entry(stream.to_string()).or_default();
            let id = StreamId::next_after(state.last_id, now);
            state.entries.insert(id, event.clone());
            state.last_id = id;
            state.trim(trim, now);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, BrokerError> {
        let mut streams = self.table();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        let after = match start {
            GroupStart::Beginning => StreamId::ZERO,
            GroupStart::Latest => state.last_id,
        };
        state
            .groups
            .insert(group.to_string(), GroupState::starting_after(after));
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
            // Register interest before checking, so an append in between is not missed.
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
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, BrokerError> {
        let mut streams = self.table();
        let state = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| group_missing(stream, group))?;
        Ok(state.ack(ids))
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let now = self.clock.now();
        let streams = self.table();
        let state = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
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
        let mut streams = self.table();
        let StreamState {
            entries, groups, ..
        } = streams
            .get_mut(stream)
            .ok_or_else(|| group_missing(stream, group))?;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| group_missing(stream, group))?;

        let claimed = state.claim_idle(consumer, min_idle, count, now, |id| {
            entries.contains_key(&id)
        });
        Ok(claimed
            .into_iter()
            .filter_map(|(id, delivery_count)| {
                entries.get(&id).map(|event| Claimed {
                    id,
                    event: event.clone(),
                    delivery_count,
                })
            })
            .collect())
    }

    async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
        Ok(self
            .table()
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;
    use tessera_core::{FileId, ManualClock};

    const STREAM: &str = "files";
    const GROUP: &str = "sync";

    fn event() -> FileEvent {
        FileEvent::deleted(FileId::new(), Utc::now())
    }

    async fn append_n(broker: &InMemoryStreamBroker, n: usize) -> Vec<StreamId> {
        let mut ids = Vec::new();
        for _ in 0..n {
            ids.push(
                broker
                    .append(STREAM, &event(), &TrimPolicy::unbounded())
                    .await
                    .expect("append should succeed"),
            );
        }
        ids
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let broker = InMemoryStreamBroker::with_clock(Arc::new(ManualClock::starting_now()));
        let ids = append_n(&broker, 5).await;
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent_and_creates_stream() {
        let broker = InMemoryStreamBroker::new();
        assert!(broker
            .ensure_group(STREAM, GROUP, GroupStart::Beginning)
            .await
            .expect("create"));
        assert!(!broker
            .ensure_group(STREAM, GROUP, GroupStart::Beginning)
            .await
            .expect("exists"));
        assert_eq!(broker.len(STREAM).await.expect("len"), 0);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let broker = InMemoryStreamBroker::new();
        let err = broker
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .expect_err("no group");
        assert!(matches!(err, BrokerError::GroupMissing { .. }));
    }

    #[tokio::test]
    async fn test_read_delivers_each_entry_once_then_ack() {
        let broker = InMemoryStreamBroker::new();
        broker
            .ensure_group(STREAM, GROUP, GroupStart::Beginning)
            .await
            .expect("group");
        let ids = append_n(&broker, 3).await;

        let batches = broker
            .read_group(STREAM, GROUP, "c1", 2, Duration::ZERO)
            .await
            .expect("read");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].stream, STREAM);
        assert_eq!(batches[0].entries.len(), 2);

        let rest = broker
            .read_group(STREAM, GROUP, "c2", 10, Duration::ZERO)
            .await
            .expect("read");
        assert_eq!(rest[0].entries.len(), 1);
        assert_eq!(rest[0].entries[0].id, ids[2]);

        assert_eq!(broker.pending(STREAM, GROUP, 10).await.expect("pending").len(), 3);
        assert_eq!(broker.ack(STREAM, GROUP, &ids).await.expect("ack"), 3);
        assert!(broker.pending(STREAM, GROUP, 10).await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn test_latest_start_skips_existing_entries() {
        let broker = InMemoryStreamBroker::new();
        append_n(&broker, 2).await;
        broker
            .ensure_group(STREAM, GROUP, GroupStart::Latest)
            .await
            .expect("group");
        let batches = broker
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .expect("read");
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let broker = InMemoryStreamBroker::new();
        broker
            .ensure_group(STREAM, GROUP, GroupStart::Beginning)
            .await
            .expect("group");

        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .read_group(STREAM, GROUP, "c1", 10, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        append_n(&broker, 1).await;

        let batches = reader.await.expect("join").expect("read");
        assert_eq!(batches[0].entries.len(), 1);
    }

    #[tokio::test]
    async fn test_trim_by_length_and_age() {
        let clock = Arc::new(ManualClock::starting_now());
        let broker = InMemoryStreamBroker::with_clock(clock.clone());
        let policy = TrimPolicy {
            max_len: Some(3),
            retention: Some(Duration::from_secs(60)),
        };
        for _ in 0..5 {
            broker.append(STREAM, &event(), &policy).await.expect("append");
        }
        assert_eq!(broker.len(STREAM).await.expect("len"), 3);

        clock.advance(Duration::from_secs(61));
        broker.append(STREAM, &event(), &policy).await.expect("append");
        assert_eq!(broker.len(STREAM).await.expect("len"), 1);
    }

    #[tokio::test]
    async fn test_claims_are_disjoint() {
        let clock = Arc::new(ManualClock::starting_now());
        let broker = InMemoryStreamBroker::with_clock(clock.clone());
        broker
            .ensure_group(STREAM, GROUP, GroupStart::Beginning)
            .await
            .expect("group");
        append_n(&broker, 6).await;
        broker
            .read_group(STREAM, GROUP, "crashed", 10, Duration::ZERO)
            .await
            .expect("read");
        clock.advance(Duration::from_secs(120));

        let idle = Duration::from_secs(60);
        let (a, b) = tokio::join!(
            broker.claim_idle(STREAM, GROUP, "a", idle, 4),
            broker.claim_idle(STREAM, GROUP, "b", idle, 4)
        );
        let a = a.expect("claim a");
        let b = b.expect("claim b");
        assert_eq!(a.len() + b.len(), 6);
        let ids_a: HashSet<StreamId> = a.iter().map(|c| c.id).collect();
        assert!(b.iter().all(|c| !ids_a.contains(&c.id)));
        assert!(a.iter().chain(b.iter()).all(|c| c.delivery_count == 2));
    }

    #[tokio::test]
    async fn test_claim_drops_trimmed_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let broker = InMemoryStreamBroker::with_clock(clock.clone());
        broker
            .ensure_group(STREAM, GROUP, GroupStart::Beginning)
            .await
            .expect("group");
        append_n(&broker, 2).await;
        broker
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .expect("read");

        let policy = TrimPolicy {
            max_len: Some(1),
            retention: None,
        };
        broker.append(STREAM, &event(), &policy).await.expect("append");
        clock.advance(Duration::from_secs(120));

        let claimed = broker
            .claim_idle(STREAM, GROUP, "c2", Duration::from_secs(60), 10)
            .await
            .expect("claim");
        assert!(claimed.is_empty());
        assert!(broker.pending(STREAM, GROUP, 10).await.expect("pending").is_empty());
    }
}
