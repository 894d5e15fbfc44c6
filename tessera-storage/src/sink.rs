//! Change sink: where committed mutations are announced.
//!
//! The record store calls [`ChangeSink::emit`] only after the WAL entry is
//! committed and the local cache row is updated. Implementations must not
//! fail the caller; a publisher that cannot reach its broker logs and moves on.

use async_trait::async_trait;
use tessera_core::FileEvent;

#[async_trait]
pub trait ChangeSink: Send + Sync {
    /// Announce a committed change.
    async fn emit(&self, event: FileEvent);
}

/// Sink that discards every event. Used by nodes without a downstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl ChangeSink for NoopSink {
    async fn emit(&self, event: FileEvent) {
        tracing::trace!(
            ctx_file_id = %event.file_id,
            ctx_event_type = %event.event_type,
            "Change event discarded"
        );
    }
}
