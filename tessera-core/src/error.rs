//! Error types for TESSERA operations

use crate::identity::FileId;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors (LMDB tables and sidecar files).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found: {file_id}")]
    NotFound { file_id: FileId },

    #[error("Record already exists: {file_id}")]
    AlreadyExists { file_id: FileId },

    #[error("I/O failed on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Corrupt record at {path}: {reason}")]
    CorruptRecord { path: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// A mutation could not be made durable. Nothing was applied to the cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DurabilityError {
    #[error("Atomic write failed for {file_id}: {reason}")]
    AtomicWriteFailed { file_id: FileId, reason: String },

    #[error("WAL append failed for transaction {transaction_id}: {reason}")]
    WalAppendFailed { transaction_id: Uuid, reason: String },

    #[error("WAL commit failed for transaction {transaction_id}: {reason}")]
    WalCommitFailed { transaction_id: Uuid, reason: String },
}

/// Rebuild lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited_ms}ms waiting for lock {name} at priority {priority}")]
    Timeout {
        name: String,
        priority: String,
        waited_ms: u64,
    },
}

/// Log broker errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Consumer group {group} does not exist on stream {stream}")]
    GroupMissing { stream: String, group: String },

    #[error("Invalid stream id: {value}")]
    InvalidId { value: String },

    #[error("Broker storage failure: {reason}")]
    Storage { reason: String },
}

/// Event application errors. The event stays pending and is retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Event {event_id} ({event_type}) carries no record snapshot")]
    MissingSnapshot { event_id: String, event_type: String },

    #[error("Event {event_id} targets {expected} but its snapshot is for {got}")]
    FileIdMismatch {
        event_id: String,
        expected: FileId,
        got: FileId,
    },

    #[error("Downstream cache failure: {reason}")]
    Backend { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for all TESSERA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TesseraError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Durability failure: {0}")]
    Durability(#[from] DurabilityError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Apply failure: {0}")]
    Apply(#[from] ApplyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias for TESSERA operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================
