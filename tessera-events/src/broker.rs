//! Durable ordered log with consumer groups.
//!
//! Models the subset of a Redis-Streams-class broker the registry needs:
//! trimmed appends, idempotent group creation, blocking group reads addressed
//! to a consumer, acknowledgement, a group-wide pending view and atomic
//! claiming of idle pending entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::{BrokerError, FileEvent};

use crate::stream::{Claimed, GroupStart, PendingEntry, StreamBatch, StreamId, TrimPolicy};

#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append an event and apply `trim`. Returns the assigned id.
    async fn append(
        &self,
        stream: &str,
        event: &FileEvent,
        trim: &TrimPolicy,
    ) -> Result<StreamId, BrokerError>;

    /// Create `group` on `stream`, creating the stream if needed.
    ///
    /// Returns `false` if the group already existed, which is not an error.
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, BrokerError>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting up
    /// to `block` for at least one. Delivered entries become pending.
    ///
    /// Returns no batches when nothing arrived in time.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, BrokerError>;

    /// Acknowledge entries. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, BrokerError>;

    /// Group-wide pending entries, oldest first.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError>;

    /// Atomically transfer up to `count` pending entries idle for at least
    /// `min_idle` to `consumer`. Each entry is claimed by at most one caller.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Claimed>, BrokerError>;

    /// Entries currently retained in `stream`. Zero if it does not exist.
    async fn len(&self, stream: &str) -> Result<u64, BrokerError>;
}

#[async_trait]
impl<T: StreamBroker + ?Sized> StreamBroker for Arc<T> {
    async fn append(
        &self,
        stream: &str,
        event: &FileEvent,
        trim: &TrimPolicy,
    ) -> Result<StreamId, BrokerError> {
        (**self).append(stream, event, trim).await
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<bool, BrokerError> {
        (**self).ensure_group(stream, group, start).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, BrokerError> {
        (**self)
            .read_group(stream, group, consumer, count, block)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, BrokerError> {
        (**self).ack(stream, group, ids).await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        (**self).pending(stream, group, count).await
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Claimed>, BrokerError> {
        (**self)
            .claim_idle(stream, group, consumer, min_idle, count)
            .await
    }

    async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
        (**self).len(stream).await
    }
}

pub(crate) fn group_missing(stream: &str, group: &str) -> BrokerError {
    BrokerError::GroupMissing {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}
