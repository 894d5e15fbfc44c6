//! Change events emitted after a record mutation commits.

use crate::identity::{FileId, Timestamp};
use crate::record::AttributeRecord;
use crate::wal::WalOperation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventType {
    Created,
    Updated,
    Deleted,
}

impl FileEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventType::Created => "created",
            FileEventType::Updated => "updated",
            FileEventType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for FileEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<WalOperation> for FileEventType {
    fn from(op: WalOperation) -> Self {
        match op {
            WalOperation::Create => FileEventType::Created,
            WalOperation::Update => FileEventType::Updated,
            WalOperation::Delete => FileEventType::Deleted,
        }
    }
}

/// Immutable description of a committed change.
///
/// The broker assigns the event id on append; it is not part of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEvent {
    pub event_type: FileEventType,
    pub file_id: FileId,
    /// Committed record. `None` for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<AttributeRecord>,
    pub emitted_at: Timestamp,
}

impl FileEvent {
    pub fn created(record: AttributeRecord, emitted_at: Timestamp) -> Self {
        Self {
            event_type: FileEventType::Created,
            file_id: record.file_id,
            snapshot: Some(record),
            emitted_at,
        }
    }

    pub fn updated(record: AttributeRecord, emitted_at: Timestamp) -> Self {
        Self {
            event_type: FileEventType::Updated,
            file_id: record.file_id,
            snapshot: Some(record),
            emitted_at,
        }
    }

    pub fn deleted(file_id: FileId, emitted_at: Timestamp) -> Self {
        Self {
            event_type: FileEventType::Deleted,
            file_id,
            snapshot: None,
            emitted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_event_type_from_operation() {
        assert_eq!(FileEventType::from(WalOperation::Create), FileEventType::Created);
        assert_eq!(FileEventType::from(WalOperation::Update), FileEventType::Updated);
        assert_eq!(FileEventType::from(WalOperation::Delete), FileEventType::Deleted);
    }

    #[test]
    fn test_deleted_event_omits_snapshot() {
        let event = FileEvent::deleted(FileId::new(), Utc::now());
        let value = serde_json::to_value(&event).expect("event serializes");
        assert_eq!(value["event_type"], "deleted");
        assert!(value.get("snapshot").is_none());
    }

    #[test]
    fn test_created_event_carries_record() {
        let record = AttributeRecord::new("a.bin", 3, "text/plain", "ff", Utc::now());
        let event = FileEvent::created(record.clone(), Utc::now());
        assert_eq!(event.file_id, record.file_id);
        assert_eq!(event.snapshot, Some(record));
    }
}
