//! Consumer group bookkeeping shared by every broker backend.
//!
//! Pure state: no I/O, no locking. Backends load a [`GroupState`], mutate it
//! inside their own critical section (a mutex or a single LMDB write
//! transaction) and store it back, which is what makes claims atomic.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::Timestamp;

use crate::stream::{PendingEntry, StreamId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInfo {
    pub consumer: String,
    pub delivery_count: u64,
    pub first_delivered_at: Timestamp,
    pub last_delivered_at: Timestamp,
}

impl PendingInfo {
    fn idle(&self, now: Timestamp) -> Duration {
        (now - self.last_delivered_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    /// Highest id ever delivered to any consumer of the group.
    pub last_delivered: StreamId,
    /// Delivered but not yet acknowledged, group-wide.
    pub pending: BTreeMap<StreamId, PendingInfo>,
}

impl GroupState {
    pub fn starting_after(last_delivered: StreamId) -> Self {
        Self {
            last_delivered,
            pending: BTreeMap::new(),
        }
    }

    /// Record first delivery of `ids` to `consumer`.
    pub fn deliver(&mut self, ids: &[StreamId], consumer: &str, now: Timestamp) {
        for id in ids {
            self.pending.insert(
                *id,
                PendingInfo {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    first_delivered_at: now,
                    last_delivered_at: now,
                },
            );
            if *id > self.last_delivered {
                self.last_delivered = *id;
            }
        }
    }

    /// Remove `ids` from the pending set. Returns how many were pending.
    pub fn ack(&mut self, ids: &[StreamId]) -> u64 {
        ids.iter()
            .filter(|id| self.pending.remove(*id).is_some())
            .count() as u64
    }

    /// Up to `count` pending entries in id order.
    pub fn pending_entries(&self, count: usize, now: Timestamp) -> Vec<PendingEntry> {
        self.pending
            .iter()
            .take(count)
            .map(|(id, info)| PendingEntry {
                id: *id,
                consumer: info.consumer.clone(),
                idle: info.idle(now),
                delivery_count: info.delivery_count,
            })
            .collect()
    }

    /// Transfer up to `count` entries idle for at least `min_idle` to
    /// `consumer`, bumping their delivery counts.
    ///
    /// Pending ids for which `exists` is false were trimmed from the stream;
    /// they are dropped from the pending set instead of claimed. Returns the
    /// claimed ids with their new delivery counts.
    pub fn claim_idle(
        &mut self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
        now: Timestamp,
        exists: impl Fn(StreamId) -> bool,
    ) -> Vec<(StreamId, u64)> {
        let mut claimed = Vec::new();
        let mut trimmed = Vec::new();

        for (id, info) in self.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if info.idle(now) < min_idle {
                continue;
            }
            if !exists(*id) {
                trimmed.push(*id);
                continue;
            }
            info.consumer = consumer.to_string();
            info.delivery_count += 1;
            info.last_delivered_at = now;
            claimed.push((*id, info.delivery_count));
        }

        for id in trimmed {
            self.pending.remove(&id);
        }
        claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn ids(n: u64) -> Vec<StreamId> {
        (1..=n).map(|i| StreamId::new(i, 0)).collect()
    }

    #[test]
    fn test_deliver_and_ack() {
        let now = Utc::now();
        let mut group = GroupState::default();
        group.deliver(&ids(3), "c1", now);
        assert_eq!(group.last_delivered, StreamId::new(3, 0));
        assert_eq!(group.pending.len(), 3);

        assert_eq!(group.ack(&[StreamId::new(2, 0), StreamId::new(9, 0)]), 1);
        assert_eq!(group.pending.len(), 2);
        assert_eq!(group.ack(&[StreamId::new(2, 0)]), 0);
    }

    #[test]
    fn test_claim_respects_idle_threshold() {
        let start = Utc::now();
        let mut group = GroupState::default();
        group.deliver(&ids(2), "c1", start);

        let early = group.claim_idle("c2", Duration::from_secs(60), 10, start, |_| true);
        assert!(early.is_empty());

        let later = start + ChronoDuration::seconds(61);
        let claimed = group.claim_idle("c2", Duration::from_secs(60), 10, later, |_| true);
        assert_eq!(
            claimed,
            vec![(StreamId::new(1, 0), 2), (StreamId::new(2, 0), 2)]
        );
        assert!(group.pending.values().all(|p| p.consumer == "c2"));

        // Claiming resets idle time.
        let again = group.claim_idle("c3", Duration::from_secs(60), 10, later, |_| true);
        assert!(again.is_empty());
    }

    #[test]
    fn test_claim_honours_count_and_drops_trimmed() {
        let start = Utc::now();
        let later = start + ChronoDuration::seconds(120);
        let mut group = GroupState::default();
        group.deliver(&ids(4), "c1", start);

        let claimed = group.claim_idle("c2", Duration::from_secs(60), 1, later, |id| id.ms != 1);
        assert_eq!(claimed, vec![(StreamId::new(2, 0), 2)]);
        assert!(!group.pending.contains_key(&StreamId::new(1, 0)));
        assert_eq!(group.pending.len(), 3);
    }

    #[test]
    fn test_pending_entries_report_idle() {
        let start = Utc::now();
        let mut group = GroupState::default();
        group.deliver(&ids(2), "c1", start);
        let entries = group.pending_entries(1, start + ChronoDuration::seconds(5));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].idle, Duration::from_secs(5));
        assert_eq!(entries[0].consumer, "c1");
    }

    #[test]
    fn test_group_state_json_roundtrip_keeps_pending_keys() {
        let mut group = GroupState::default();
        group.deliver(&ids(2), "c1", Utc::now());
        let json = serde_json::to_string(&group).expect("serialize");
        assert!(json.contains("\"1-0\""));
        let back: GroupState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, group);
    }
}
