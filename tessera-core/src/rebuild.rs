//! Rebuild priorities and the reports produced by rebuild and audit runs.

use crate::identity::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority of a rebuild lock request. Higher values are granted first.
///
/// Manually triggered rebuilds are full rebuilds and use [`RebuildPriority::Full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildPriority {
    Lazy = 0,
    Incremental = 1,
    Full = 2,
}

impl fmt::Display for RebuildPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebuildPriority::Lazy => "lazy",
            RebuildPriority::Incremental => "incremental",
            RebuildPriority::Full => "full",
        };
        f.write_str(s)
    }
}

/// Kind of rebuild a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildOperation {
    Full,
    Incremental,
}

impl RebuildOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildOperation::Full => "full",
            RebuildOperation::Incremental => "incremental",
        }
    }

    pub fn priority(&self) -> RebuildPriority {
        match self {
            RebuildOperation::Full => RebuildPriority::Full,
            RebuildOperation::Incremental => RebuildPriority::Incremental,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildStatistics {
    pub attr_files_scanned: u64,
    pub cache_entries_before: u64,
    pub cache_entries_after: u64,
    pub entries_created: u64,
}

/// Result of a full or incremental rebuild.
///
/// Rebuilds always produce a report. Failures (lock timeout, operation
/// timeout, unreadable sidecars) are listed in `errors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub operation_type: RebuildOperation,
    pub duration_seconds: f64,
    pub statistics: RebuildStatistics,
    pub errors: Vec<String>,
}

impl RebuildReport {
    pub fn new(operation_type: RebuildOperation) -> Self {
        Self {
            operation_type,
            duration_seconds: 0.0,
            statistics: RebuildStatistics::default(),
            errors: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of removing expired and orphaned cache rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Total rows deleted.
    pub removed: u64,
    pub expired_removed: u64,
    pub orphan_removed: u64,
    pub rows_scanned: u64,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
}

/// Read-only comparison of the attribute store against the cache table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub total_attr: u64,
    pub total_cache: u64,
    pub orphan_cache_count: u64,
    pub orphan_attr_count: u64,
    pub expired_cache_count: u64,
    pub is_consistent: bool,
    pub inconsistency_percentage: f64,
    pub checked_at: Timestamp,
}

impl ConsistencyReport {
    /// Assemble a report, deriving `is_consistent` and the percentage.
    ///
    /// The percentage is taken over the union of both id sets
    /// (`total_attr + orphan_cache`), rounded to two decimals.
    pub fn from_counts(
        total_attr: u64,
        total_cache: u64,
        orphan_cache_count: u64,
        orphan_attr_count: u64,
        expired_cache_count: u64,
        checked_at: Timestamp,
    ) -> Self {
        let union = total_attr + orphan_cache_count;
        let inconsistency_percentage = if union == 0 {
            0.0
        } else {
            let raw = (orphan_cache_count + orphan_attr_count) as f64 * 100.0 / union as f64;
            (raw * 100.0).round() / 100.0
        };
        Self {
            total_attr,
            total_cache,
            orphan_cache_count,
            orphan_attr_count,
            expired_cache_count,
            is_consistent: orphan_cache_count == 0 && orphan_attr_count == 0,
            inconsistency_percentage,
            checked_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_priority_ordering() {
        assert!(RebuildPriority::Full > RebuildPriority::Incremental);
        assert!(RebuildPriority::Incremental > RebuildPriority::Lazy);
    }

    #[test]
    fn test_report_operation_type_serialization() {
        let report = RebuildReport::new(RebuildOperation::Full);
        let value = serde_json::to_value(&report).expect("report serializes");
        assert_eq!(value["operation_type"], "full");
        assert_eq!(value["statistics"]["entries_created"], 0);
        assert!(value["errors"].as_array().map(|a| a.is_empty()).unwrap_or(false));
    }

    #[test]
    fn test_consistency_empty_stores() {
        let report = ConsistencyReport::from_counts(0, 0, 0, 0, 0, Utc::now());
        assert!(report.is_consistent);
        assert_eq!(report.inconsistency_percentage, 0.0);
    }

    #[test]
    fn test_consistency_percentage_over_union() {
        // 3 records, 2 mirrored, plus 1 orphan row: union of 4 ids, 2 disagree.
        let report = ConsistencyReport::from_counts(3, 3, 1, 1, 0, Utc::now());
        assert!(!report.is_consistent);
        assert_eq!(report.inconsistency_percentage, 50.0);
    }

    #[test]
    fn test_consistency_percentage_rounding() {
        let report = ConsistencyReport::from_counts(3, 2, 0, 1, 0, Utc::now());
        assert_eq!(report.inconsistency_percentage, 33.33);
    }

    #[test]
    fn test_expired_rows_do_not_break_consistency() {
        let report = ConsistencyReport::from_counts(5, 5, 0, 0, 5, Utc::now());
        assert!(report.is_consistent);
    }
}
