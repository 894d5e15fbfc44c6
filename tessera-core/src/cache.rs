//! Derived cache rows and their freshness.

use crate::identity::{FileId, Timestamp};
use crate::record::AttributeRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Node-local, queryable mirror of an [`AttributeRecord`].
///
/// Rows are keyed by `file_id`, so the table holds at most one row per file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub record: AttributeRecord,
    pub cache_updated_at: Timestamp,
    pub cache_ttl_secs: u64,
}

impl CacheRow {
    pub fn from_record(record: AttributeRecord, now: Timestamp, ttl: Duration) -> Self {
        Self {
            record,
            cache_updated_at: now,
            cache_ttl_secs: ttl.as_secs(),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.record.file_id
    }

    /// Time since the row was last refreshed. Clock skew reads as zero.
    pub fn age(&self, now: Timestamp) -> Duration {
        (now - self.cache_updated_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// `now - cache_updated_at > ttl`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.age(now) > Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn view(&self, now: Timestamp) -> CacheRowView {
        CacheRowView {
            record: self.record.clone(),
            cache_updated_at: self.cache_updated_at,
            cache_ttl: self.cache_ttl_secs,
            cache_expired: self.is_expired(now),
        }
    }
}

/// Row as served to readers, with the computed `cache_expired` flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheRowView {
    #[serde(flatten)]
    pub record: AttributeRecord,
    pub cache_updated_at: Timestamp,
    pub cache_ttl: u64,
    pub cache_expired: bool,
}
