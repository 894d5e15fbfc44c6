//! TESSERA Core - Registry Data Types
//!
//! Pure data structures shared by every crate in the workspace: attribute
//! records, derived cache rows, write-ahead log entries, change events,
//! rebuild/consistency reports, errors, configuration and the clock seam.
//! This crate performs no I/O.

pub mod cache;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod identity;
pub mod rebuild;
pub mod record;
pub mod wal;

pub use cache::{CacheRow, CacheRowView};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NodeConfig, StreamConfig};
pub use error::{
    ApplyError, BrokerError, ConfigError, DurabilityError, LockError, StorageError,
    TesseraError, TesseraResult, ValidationError,
};
pub use event::{FileEvent, FileEventType};
pub use identity::{compute_checksum, FileId, Timestamp};
pub use rebuild::{
    CleanupReport, ConsistencyReport, RebuildOperation, RebuildPriority, RebuildReport,
    RebuildStatistics,
};
pub use record::{AttributeRecord, MetadataPatch, RecordMutation};
pub use wal::{WalEntry, WalOperation, WalStatus};
