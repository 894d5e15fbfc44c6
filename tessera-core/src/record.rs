//! Attribute records: the durable, canonical metadata of a stored file.

use crate::error::ValidationError;
use crate::identity::{FileId, Timestamp};
use crate::wal::WalOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// ATTRIBUTE RECORD
// ============================================================================

/// Canonical metadata for one stored object.
///
/// Persisted as a pretty-printed JSON sidecar next to the blob. Every cache
/// in the system is derived from this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub file_id: FileId,
    /// Name under which the blob is stored.
    pub filename: String,
    /// Name supplied by the uploader.
    pub original_filename: String,
    pub size: u64,
    pub content_type: String,
    /// Lowercase hex SHA-256 of the content. Not unique across files.
    pub checksum: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AttributeRecord {
    /// Create a record with a fresh id and both timestamps set to `now`.
    pub fn new(
        filename: impl Into<String>,
        size: u64,
        content_type: impl Into<String>,
        checksum: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        let filename = filename.into();
        Self {
            file_id: FileId::new(),
            original_filename: filename.clone(),
            filename,
            size,
            content_type: content_type.into(),
            checksum: checksum.into(),
            created_at: now,
            updated_at: now,
            created_by: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_original_filename(mut self, name: impl Into<String>) -> Self {
        self.original_filename = name.into();
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.created_by = Some(creator.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check the fields a sidecar must always carry.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.filename.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "filename".to_string(),
            });
        }
        if self.filename.contains('/') || self.filename.contains('\\') {
            return Err(ValidationError::InvalidValue {
                field: "filename".to_string(),
                reason: "must not contain path separators".to_string(),
            });
        }
        if self.checksum.is_empty() || !self.checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ValidationError::InvalidValue {
                field: "checksum".to_string(),
                reason: "must be a non-empty hex digest".to_string(),
            });
        }
        if self.updated_at < self.created_at {
            return Err(ValidationError::InvalidValue {
                field: "updated_at".to_string(),
                reason: "must not precede created_at".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// MUTATIONS
// ============================================================================

/// Partial update of a record's mutable fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    /// Metadata keys to insert or overwrite.
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
    /// Metadata keys to remove. Applied after `set`.
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set.insert(key.into(), value);
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.remove.push(key.into());
        self
    }

    pub fn rename(mut self, original_filename: impl Into<String>) -> Self {
        self.original_filename = Some(original_filename.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.remove.is_empty()
            && self.original_filename.is_none()
            && self.content_type.is_none()
    }

    /// Produce the patched record. `updated_at` moves to `now`, never backwards.
    pub fn apply(&self, record: &AttributeRecord, now: Timestamp) -> AttributeRecord {
        let mut next = record.clone();
        for (key, value) in &self.set {
            next.metadata.insert(key.clone(), value.clone());
        }
        for key in &self.remove {
            next.metadata.remove(key);
        }
        if let Some(name) = &self.original_filename {
            next.original_filename = name.clone();
        }
        if let Some(content_type) = &self.content_type {
            next.content_type = content_type.clone();
        }
        next.updated_at = now.max(record.updated_at);
        next
    }
}

/// A change requested against the attribute store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RecordMutation {
    Create(AttributeRecord),
    Update { file_id: FileId, patch: MetadataPatch },
    Delete { file_id: FileId },
}

impl RecordMutation {
    pub fn file_id(&self) -> FileId {
        match self {
            RecordMutation::Create(record) => record.file_id,
            RecordMutation::Update { file_id, .. } | RecordMutation::Delete { file_id } => *file_id,
        }
    }

    pub fn operation(&self) -> WalOperation {
        match self {
            RecordMutation::Create(_) => WalOperation::Create,
            RecordMutation::Update { .. } => WalOperation::Update,
            RecordMutation::Delete { .. } => WalOperation::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid timestamp")
    }

    fn record() -> AttributeRecord {
        AttributeRecord::new("blob-1.bin", 42, "application/pdf", "abc123", t0())
            .with_original_filename("report.pdf")
            .with_creator("alice")
            .with_metadata("description", json!("quarterly report"))
    }

    #[test]
    fn test_new_record_validates() {
        assert!(record().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut r = record();
        r.filename = "  ".to_string();
        assert!(matches!(
            r.validate(),
            Err(ValidationError::RequiredFieldMissing { .. })
        ));

        let mut r = record();
        r.filename = "../escape".to_string();
        assert!(r.validate().is_err());

        let mut r = record();
        r.checksum = "not-hex!".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_patch_sets_then_removes() {
        let later = t0() + Duration::seconds(30);
        let patch = MetadataPatch::new()
            .set("description", json!("revised"))
            .set("tag", json!("x"))
            .remove("tag")
            .rename("final.pdf");
        let next = patch.apply(&record(), later);

        assert_eq!(next.metadata.get("description"), Some(&json!("revised")));
        assert!(!next.metadata.contains_key("tag"));
        assert_eq!(next.original_filename, "final.pdf");
        assert_eq!(next.updated_at, later);
        assert_eq!(next.created_at, t0());
    }

    #[test]
    fn test_patch_never_moves_updated_at_backwards() {
        let r = record();
        let earlier = t0() - Duration::seconds(10);
        let next = MetadataPatch::new().set("k", json!(1)).apply(&r, earlier);
        assert_eq!(next.updated_at, r.updated_at);
    }

    #[test]
    fn test_sidecar_json_shape() {
        let value = serde_json::to_value(record()).expect("record serializes");
        assert_eq!(value["filename"], "blob-1.bin");
        assert_eq!(value["original_filename"], "report.pdf");
        assert_eq!(value["metadata"]["description"], "quarterly report");
        assert_eq!(value["created_by"], "alice");
    }

    #[test]
    fn test_mutation_accessors() {
        let r = record();
        let id = r.file_id;
        assert_eq!(RecordMutation::Create(r).operation(), WalOperation::Create);
        let delete = RecordMutation::Delete { file_id: id };
        assert_eq!(delete.file_id(), id);
        assert_eq!(delete.operation(), WalOperation::Delete);
    }
}
