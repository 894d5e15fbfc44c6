//! Stream ids, entries and the two read result shapes.
//!
//! A consumer batch read and a pending-entry claim return different shapes:
//! [`StreamBatch`] groups entries under their stream, [`Claimed`] is a flat
//! entry carrying its delivery count. They are separate types so neither can
//! be handled as the other.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tessera_core::{BrokerError, FileEvent, StreamConfig, Timestamp};

// ============================================================================
// STREAM ID
// ============================================================================

/// Broker-assigned entry id, `<millis>-<seq>`, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Id for an entry appended at `now` after `last`. Never goes backwards,
    /// even if the clock does.
    pub fn next_after(last: StreamId, now: Timestamp) -> Self {
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        if now_ms > last.ms {
            Self::new(now_ms, 0)
        } else {
            Self::new(last.ms, last.seq + 1)
        }
    }

    /// Big-endian bytes, so byte order matches id order.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.ms.to_be_bytes());
        out[8..].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let mut ms = [0u8; 8];
        let mut seq = [0u8; 8];
        ms.copy_from_slice(&bytes[..8]);
        seq.copy_from_slice(&bytes[8..]);
        Some(Self::new(u64::from_be_bytes(ms), u64::from_be_bytes(seq)))
    }

    /// Milliseconds between this id's timestamp and `now`.
    pub fn age_ms(&self, now: Timestamp) -> u64 {
        u64::try_from(now.timestamp_millis())
            .unwrap_or(0)
            .saturating_sub(self.ms)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BrokerError::InvalidId {
            value: s.to_string(),
        };
        let (ms, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self::new(
            ms.parse().map_err(|_| invalid())?,
            seq.parse().map_err(|_| invalid())?,
        ))
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// READ RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub event: FileEvent,
}

/// Entries delivered to a consumer by a batch read, grouped by stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// A pending entry taken over from the group by a claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed {
    pub id: StreamId,
    pub event: FileEvent,
    /// Deliveries including this claim.
    pub delivery_count: u64,
}

/// One delivered-but-unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    pub id: StreamId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

// ============================================================================
// POLICIES
// ============================================================================

/// Bounds enforced by the broker on every append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimPolicy {
    pub max_len: Option<usize>,
    pub retention: Option<Duration>,
}

impl TrimPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_len: None,
            retention: None,
        }
    }

    /// Whether an entry with id `id` falls outside the retention window.
    pub fn is_expired(&self, id: StreamId, now: Timestamp) -> bool {
        match self.retention {
            Some(retention) => u128::from(id.age_ms(now)) > retention.as_millis(),
            None => false,
        }
    }
}

impl From<&StreamConfig> for TrimPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_len: Some(config.max_len),
            retention: Some(config.retention),
        }
    }
}

/// Where a newly created group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver everything still in the stream.
    Beginning,
    /// Deliver only entries appended after creation.
    Latest,
}
