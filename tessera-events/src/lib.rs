//! TESSERA Events - Change Log and Downstream Cache Sync
//!
//! Carries committed record changes from storage nodes to a downstream cache:
//!
//! - [`broker`]: the [`StreamBroker`] contract (ordered log + consumer groups)
//! - [`memory`] / [`lmdb`]: in-process and durable broker backends
//! - [`publisher`]: best-effort publishing, plugged into the record store as
//!   its change sink
//! - [`subscriber`]: consumer and redrive loops with reconnect backoff
//! - [`applier`] / [`downstream`]: idempotent, version-guarded application
//!
//! Delivery is at-least-once; the applier makes repeats harmless.

pub mod applier;
pub mod broker;
pub mod downstream;
pub mod group;
pub mod lmdb;
pub mod memory;
pub mod publisher;
pub mod stream;
pub mod subscriber;

pub use applier::{ApplyOutcome, CacheSyncApplier};
pub use broker::StreamBroker;
pub use downstream::{
    outlives, supersedes, DeleteOutcome, DownstreamCache, DownstreamRow, InMemoryDownstreamCache,
    LmdbDownstreamCache, Tombstone, UpsertOutcome,
};
pub use group::{GroupState, PendingInfo};
pub use lmdb::LmdbStreamBroker;
pub use memory::InMemoryStreamBroker;
pub use publisher::{EventPublisher, PublisherMetrics, PublisherMetricsSnapshot};
pub use stream::{
    Claimed, GroupStart, PendingEntry, StreamBatch, StreamEntry, StreamId, TrimPolicy,
};
pub use subscriber::{
    Backoff, BatchOutcome, EventSubscriber, RedriveOutcome, SubscriberMetrics,
    SubscriberMetricsSnapshot,
};
