//! Publishes committed changes to the event stream.
//!
//! Publishing is best effort: the mutation is already durable and cached by
//! the time an event reaches the publisher, so a broker failure is logged and
//! counted and never reaches the writer.
//!
//! Events the applier could never apply (a create or update without its
//! record) are rejected before they reach the stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{
    AttributeRecord, Clock, FileEvent, FileEventType, FileId, StreamConfig, TesseraResult,
    ValidationError,
};
use tessera_storage::ChangeSink;

use crate::broker::StreamBroker;
use crate::stream::{StreamId, TrimPolicy};

#[derive(Debug, Default)]
pub struct PublisherMetrics {
    pub published: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
}

impl PublisherMetrics {
    pub fn snapshot(&self) -> PublisherMetricsSnapshot {
        PublisherMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PublisherMetricsSnapshot {
    pub published: u64,
    pub failed: u64,
    pub rejected: u64,
}

pub struct EventPublisher {
    broker: Arc<dyn StreamBroker>,
    stream: String,
    trim: TrimPolicy,
    clock: Arc<dyn Clock>,
    metrics: PublisherMetrics,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn StreamBroker>, config: &StreamConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            broker,
            stream: config.stream.clone(),
            trim: TrimPolicy::from(config),
            clock,
            metrics: PublisherMetrics::default(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn metrics(&self) -> &PublisherMetrics {
        &self.metrics
    }

    /// Build and publish an event for a committed change.
    ///
    /// `snapshot` is the committed record for creates and updates and is
    /// ignored for deletes.
    ///
    /// # Errors
    ///
    /// - `Validation` for a create or update without a matching snapshot;
    ///   nothing is appended
    /// - `Broker` if the append failed
    pub async fn publish(
        &self,
        event_type: FileEventType,
        file_id: FileId,
        snapshot: Option<AttributeRecord>,
    ) -> TesseraResult<StreamId> {
        let now = self.clock.now();
        let event = match (event_type, snapshot) {
            (FileEventType::Created, Some(record)) => FileEvent::created(record, now),
            (FileEventType::Updated, Some(record)) => FileEvent::updated(record, now),
            (FileEventType::Deleted, _) => FileEvent::deleted(file_id, now),
            (event_type, None) => FileEvent {
                event_type,
                file_id,
                snapshot: None,
                emitted_at: now,
            },
        };
        self.publish_event(&event).await
    }

    /// Validate and append `event`. Failures are logged and counted.
    pub async fn publish_event(&self, event: &FileEvent) -> TesseraResult<StreamId> {
        if let Err(e) = publishable(event) {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                ctx_event_type = %event.event_type,
                ctx_file_id = %event.file_id,
                error = %e,
                "Refusing to publish malformed change event"
            );
            return Err(e.into());
        }

        match self.broker.append(&self.stream, event, &self.trim).await {
            Ok(id) => {
                self.metrics.published.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    ctx_event_id = %id,
                    ctx_event_type = %event.event_type,
                    ctx_file_id = %event.file_id,
                    "Published change event"
                );
                Ok(id)
            }
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    ctx_stream = %self.stream,
                    ctx_event_type = %event.event_type,
                    ctx_file_id = %event.file_id,
                    error = %e,
                    "Failed to publish change event"
                );
                Err(e.into())
            }
        }
    }
}

/// Creates and updates must carry the record they announce.
fn publishable(event: &FileEvent) -> Result<(), ValidationError> {
    match (event.event_type, &event.snapshot) {
        (FileEventType::Deleted, _) => Ok(()),
        (_, None) => Err(ValidationError::RequiredFieldMissing {
            field: "snapshot".to_string(),
        }),
        (_, Some(record)) if record.file_id != event.file_id => {
            Err(ValidationError::InvalidValue {
                field: "snapshot.file_id".to_string(),
                reason: format!("{} does not match event file id {}", record.file_id, event.file_id),
            })
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl ChangeSink for EventPublisher {
    async fn emit(&self, event: FileEvent) {
        // Logged and counted inside; the write has already committed.
        let _ = self.publish_event(&event).await;
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("stream", &self.stream)
            .field("trim", &self.trim)
            .finish_non_exhaustive()
    }
}
