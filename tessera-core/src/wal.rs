//! Write-ahead log entries.

use crate::identity::{FileId, Timestamp};
use crate::record::AttributeRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of mutation a WAL entry protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for WalOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WalOperation::Create => "create",
            WalOperation::Update => "update",
            WalOperation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a WAL entry.
///
/// `Pending` is the only non-terminal state. Recovery resolves every pending
/// entry to `Committed` or `RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    Pending,
    Committed,
    RolledBack,
    Failed,
}

impl WalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WalStatus::Pending)
    }
}

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// UUIDv7, so entries sort by creation time.
    pub transaction_id: Uuid,
    pub operation: WalOperation,
    pub status: WalStatus,
    pub file_id: FileId,
    /// Intended end state of the record. `None` for deletes.
    pub payload: Option<AttributeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WalEntry {
    pub fn pending(
        operation: WalOperation,
        file_id: FileId,
        payload: Option<AttributeRecord>,
        now: Timestamp,
    ) -> Self {
        Self {
            transaction_id: Uuid::now_v7(),
            operation,
            status: WalStatus::Pending,
            file_id,
            payload,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: WalStatus, error: Option<String>, now: Timestamp) -> Self {
        self.status = status;
        self.error = error;
        self.updated_at = now;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_pending_entry_defaults() {
        let now = Utc::now();
        let entry = WalEntry::pending(WalOperation::Delete, FileId::new(), None, now);
        assert_eq!(entry.status, WalStatus::Pending);
        assert!(!entry.status.is_terminal());
        assert_eq!(entry.created_at, entry.updated_at);
    }

    #[test]
    fn test_status_transition_keeps_identity() {
        let now = Utc::now();
        let entry = WalEntry::pending(WalOperation::Update, FileId::new(), None, now);
        let txid = entry.transaction_id;
        let failed = entry.with_status(WalStatus::Failed, Some("rename failed".to_string()), now);
        assert_eq!(failed.transaction_id, txid);
        assert!(failed.status.is_terminal());
        assert_eq!(failed.error.as_deref(), Some("rename failed"));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&WalStatus::RolledBack).expect("serializes");
        assert_eq!(json, "\"rolled_back\"");
    }
}
