//! Downstream subscriber: consumer loop and redrive loop.
//!
//! The consumer loop reads batches addressed to this consumer, applies them
//! and acknowledges what applied. Anything that failed stays pending. The
//! redrive loop claims entries left pending too long (by this consumer or a
//! crashed one) and retries them, then prunes downstream tombstones older than
//! the stream retention. Broker outages never end either loop; the
//! consumer reconnects with exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tessera_core::{BrokerError, FileEvent, StreamConfig};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::applier::CacheSyncApplier;
use crate::broker::StreamBroker;
use crate::stream::{GroupStart, StreamId};

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct SubscriberMetrics {
    pub batches: AtomicU64,
    pub applied: AtomicU64,
    pub apply_failures: AtomicU64,
    pub acked: AtomicU64,
    pub claimed: AtomicU64,
    pub poison: AtomicU64,
    pub broker_errors: AtomicU64,
    pub tombstones_pruned: AtomicU64,
}

impl SubscriberMetrics {
    pub fn snapshot(&self) -> SubscriberMetricsSnapshot {
        SubscriberMetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
            tombstones_pruned: self.tombstones_pruned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriberMetricsSnapshot {
    pub batches: u64,
    pub applied: u64,
    pub apply_failures: u64,
    pub acked: u64,
    pub claimed: u64,
    pub poison: u64,
    pub broker_errors: u64,
    pub tombstones_pruned: u64,
}

/// Result of one consumer read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub delivered: u64,
    pub acked: u64,
    pub failed: u64,
}

/// Result of one redrive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedriveOutcome {
    pub claimed: u64,
    pub acked: u64,
    pub failed: u64,
    pub poison: u64,
}

// ============================================================================
// BACKOFF
// ============================================================================

/// Doubling reconnect delay, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ============================================================================
// SUBSCRIBER
// ============================================================================

pub struct EventSubscriber {
    broker: Arc<dyn StreamBroker>,
    applier: CacheSyncApplier,
    config: StreamConfig,
    metrics: SubscriberMetrics,
}

impl EventSubscriber {
    pub fn new(broker: Arc<dyn StreamBroker>, applier: CacheSyncApplier, config: StreamConfig) -> Self {
        Self {
            broker,
            applier,
            config,
            metrics: SubscriberMetrics::default(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SubscriberMetrics {
        &self.metrics
    }

    pub fn applier(&self) -> &CacheSyncApplier {
        &self.applier
    }

    /// Create the stream and group if missing. A group created concurrently
    /// by another consumer is not an error.
    pub async fn ensure_group(&self) -> Result<bool, BrokerError> {
        let created = self
            .broker
            .ensure_group(&self.config.stream, &self.config.group, GroupStart::Beginning)
            .await?;
        if created {
            tracing::info!(
                ctx_stream = %self.config.stream,
                ctx_group = %self.config.group,
                "Created consumer group"
            );
        }
        Ok(created)
    }

    /// Read one batch for this consumer, apply it and acknowledge what applied.
    pub async fn poll_once(&self) -> Result<BatchOutcome, BrokerError> {
        let batches = self
            .broker
            .read_group(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.batch_size,
                self.config.block_timeout,
            )
            .await?;

        let mut outcome = BatchOutcome::default();
        for batch in batches {
            self.metrics.batches.fetch_add(1, Ordering::Relaxed);
            let mut done = Vec::with_capacity(batch.entries.len());
            for entry in &batch.entries {
                outcome.delivered += 1;
                if self.apply(entry.id, &entry.event).await {
                    done.push(entry.id);
                } else {
                    outcome.failed += 1;
                }
            }
            outcome.acked += self.ack(&batch.stream, &done).await?;
        }
        Ok(outcome)
    }

    /// Claim entries idle past the threshold, group-wide, and retry them.
    pub async fn redrive_once(&self) -> Result<RedriveOutcome, BrokerError> {
        let claimed = self
            .broker
            .claim_idle(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.idle_threshold,
                self.config.batch_size,
            )
            .await?;

        let mut outcome = RedriveOutcome::default();
        let mut done = Vec::with_capacity(claimed.len());
        for entry in &claimed {
            outcome.claimed += 1;
            self.metrics.claimed.fetch_add(1, Ordering::Relaxed);

            if entry.delivery_count > u64::from(self.config.poison_threshold) {
                outcome.poison += 1;
                self.metrics.poison.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    ctx_event_id = %entry.id,
                    ctx_file_id = %entry.event.file_id,
                    ctx_delivery_count = entry.delivery_count,
                    "Change event keeps failing; leaving it pending"
                );
            }

            if self.apply(entry.id, &entry.event).await {
                done.push(entry.id);
            } else {
                outcome.failed += 1;
            }
        }
        outcome.acked = self.ack(&self.config.stream, &done).await?;

        if outcome.claimed > 0 {
            tracing::info!(
                ctx_claimed = outcome.claimed,
                ctx_acked = outcome.acked,
                ctx_failed = outcome.failed,
                "Redrive pass complete"
            );
        }
        Ok(outcome)
    }

    /// Drop tombstones the stream can no longer redeliver a create for.
    pub async fn prune_tombstones(&self) -> u64 {
        match self.applier.prune_tombstones(self.config.retention).await {
            Ok(pruned) => {
                self.metrics
                    .tombstones_pruned
                    .fetch_add(pruned, Ordering::Relaxed);
                if pruned > 0 {
                    tracing::debug!(ctx_pruned = pruned, "Pruned downstream tombstones");
                }
                pruned
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to prune downstream tombstones");
                0
            }
        }
    }

    async fn apply(&self, id: StreamId, event: &FileEvent) -> bool {
        match self.applier.apply(id, event).await {
            Ok(_) => {
                self.metrics.applied.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.metrics.apply_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    ctx_event_id = %id,
                    ctx_event_type = %event.event_type,
                    ctx_file_id = %event.file_id,
                    error = %e,
                    "Failed to apply change event; it stays pending"
                );
                false
            }
        }
    }

    async fn ack(&self, stream: &str, ids: &[StreamId]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let acked = self.broker.ack(stream, &self.config.group, ids).await?;
        self.metrics.acked.fetch_add(acked, Ordering::Relaxed);
        Ok(acked)
    }

    async fn step(&self, group_ready: bool) -> Result<BatchOutcome, BrokerError> {
        if !group_ready {
            self.ensure_group().await?;
        }
        self.poll_once().await
    }

    /// Consumer loop. Runs until `shutdown_rx` turns `true` or its sender is
    /// dropped.
    pub async fn run_consumer(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut group_ready = false;

        tracing::info!(
            ctx_stream = %self.config.stream,
            ctx_group = %self.config.group,
            ctx_consumer = %self.config.consumer,
            "Event subscriber started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let result = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                result = self.step(group_ready) => result,
            };

            match result {
                Ok(_) => {
                    group_ready = true;
                    backoff.reset();
                }
                Err(BrokerError::GroupMissing { .. }) => {
                    tracing::warn!(
                        ctx_stream = %self.config.stream,
                        ctx_group = %self.config.group,
                        "Consumer group disappeared; recreating"
                    );
                    group_ready = false;
                }
                Err(e) => {
                    self.metrics.broker_errors.fetch_add(1, Ordering::Relaxed);
                    group_ready = false;
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        ctx_retry_in_ms = delay.as_millis() as u64,
                        "Broker unavailable; reconnecting"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            ctx_applied = snapshot.applied,
            ctx_acked = snapshot.acked,
            ctx_apply_failures = snapshot.apply_failures,
            ctx_broker_errors = snapshot.broker_errors,
            "Event subscriber stopped"
        );
    }

    /// Redrive loop: one pass every `redrive_interval`.
    pub async fn run_redrive(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.redrive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            ctx_interval_secs = self.config.redrive_interval.as_secs(),
            ctx_idle_threshold_secs = self.config.idle_threshold.as_secs(),
            "Redrive loop started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("Redrive loop shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.redrive_once().await {
                        Ok(_) => {}
                        Err(BrokerError::GroupMissing { .. }) => {
                            if let Err(e) = self.ensure_group().await {
                                self.metrics.broker_errors.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(error = %e, "Failed to recreate consumer group");
                            }
                        }
                        Err(e) => {
                            self.metrics.broker_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(error = %e, "Redrive pass failed");
                        }
                    }
                    self.prune_tombstones().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for EventSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscriber")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Sleep for `delay`. Returns `true` if shutdown was requested meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::{DownstreamCache, InMemoryDownstreamCache};
    use crate::memory::InMemoryStreamBroker;
    use crate::stream::{Claimed, PendingEntry, StreamBatch, TrimPolicy};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;
    use tessera_core::{AttributeRecord, Clock, ManualClock};

    const STREAM: &str = "files";

    struct Fixture {
        clock: Arc<ManualClock>,
        broker: Arc<InMemoryStreamBroker>,
        cache: Arc<InMemoryDownstreamCache>,
        subscriber: Arc<EventSubscriber>,
    }

    fn config() -> StreamConfig {
        StreamConfig {
            stream: STREAM.to_string(),
            group: "sync".to_string(),
            consumer: "c1".to_string(),
            block_timeout: Duration::from_millis(20),
            idle_threshold: Duration::from_secs(60),
            redrive_interval: Duration::from_millis(20),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            poison_threshold: 2,
            ..StreamConfig::default()
        }
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let broker = Arc::new(InMemoryStreamBroker::with_clock(clock.clone()));
        let cache = Arc::new(InMemoryDownstreamCache::new());
        let applier = CacheSyncApplier::new(cache.clone(), clock.clone());
        let subscriber = Arc::new(EventSubscriber::new(broker.clone(), applier, config()));
        Fixture {
            clock,
            broker,
            cache,
            subscriber,
        }
    }

    fn created() -> FileEvent {
        let record = AttributeRecord::new("a.txt", 1, "text/plain", "ff", Utc::now());
        FileEvent::created(record, Utc::now())
    }

    fn malformed() -> FileEvent {
        let mut event = created();
        event.snapshot = None;
        event
    }

    async fn append(f: &Fixture, event: &FileEvent) -> StreamId {
        f.broker
            .append(STREAM, event, &TrimPolicy::unbounded())
            .await
            .expect("append should succeed")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_ensure_group_tolerates_existing() {
        let f = fixture();
        assert!(f.subscriber.ensure_group().await.expect("create"));
        assert!(!f.subscriber.ensure_group().await.expect("exists"));
    }

    #[tokio::test]
    async fn test_poll_applies_and_acks() {
        let f = fixture();
        f.subscriber.ensure_group().await.expect("group");
        for _ in 0..3 {
            append(&f, &created()).await;
        }

        let outcome = f.subscriber.poll_once().await.expect("poll should succeed");
        assert_eq!(
            outcome,
            BatchOutcome {
                delivered: 3,
                acked: 3,
                failed: 0
            }
        );
        assert_eq!(f.cache.len().await.expect("len"), 3);
        assert!(f
            .broker
            .pending(STREAM, "sync", 10)
            .await
            .expect("pending")
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_apply_stays_pending() {
        let f = fixture();
        f.subscriber.ensure_group().await.expect("group");
        let bad = append(&f, &malformed()).await;
        append(&f, &created()).await;

        let outcome = f.subscriber.poll_once().await.expect("poll should succeed");
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.acked, 1);

        let pending = f.broker.pending(STREAM, "sync", 10).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, bad);
    }

    #[tokio::test]
    async fn test_redrive_recovers_entries_of_crashed_consumer() {
        let f = fixture();
        f.subscriber.ensure_group().await.expect("group");
        let event = created();
        append(&f, &event).await;
        f.broker
            .read_group(STREAM, "sync", "crashed", 10, Duration::ZERO)
            .await
            .expect("read");

        let early = f.subscriber.redrive_once().await.expect("redrive");
        assert_eq!(early.claimed, 0);

        f.clock.advance(Duration::from_secs(61));
        let outcome = f.subscriber.redrive_once().await.expect("redrive");
        assert_eq!(outcome.claimed, 1);
        assert_eq!(outcome.acked, 1);
        assert!(f.cache.get(event.file_id).await.expect("get").is_some());
        assert!(f
            .broker
            .pending(STREAM, "sync", 10)
            .await
            .expect("pending")
            .is_empty());
    }

    #[tokio::test]
    async fn test_redriven_create_after_delete_stays_deleted() {
        let f = fixture();
        f.subscriber.ensure_group().await.expect("group");
        let create = created();
        append(&f, &create).await;
        f.broker
            .read_group(STREAM, "sync", "crashed", 10, Duration::ZERO)
            .await
            .expect("read");
        append(&f, &FileEvent::deleted(create.file_id, Utc::now())).await;
        assert_eq!(f.subscriber.poll_once().await.expect("poll").acked, 1);

        f.clock.advance(Duration::from_secs(61));
        let outcome = f.subscriber.redrive_once().await.expect("redrive");
        assert_eq!(outcome.acked, 1);
        assert!(f.cache.get(create.file_id).await.expect("get").is_none());

        assert_eq!(f.subscriber.prune_tombstones().await, 0);
        f.clock.advance(f.subscriber.config().retention + Duration::from_secs(1));
        assert_eq!(f.subscriber.prune_tombstones().await, 1);
        assert_eq!(f.subscriber.metrics().snapshot().tombstones_pruned, 1);
        assert!(f
            .cache
            .tombstone(create.file_id)
            .await
            .expect("tombstone")
            .is_none());
    }

    #[tokio::test]
    async fn test_poison_entries_are_logged_not_dropped() {
        let f = fixture();
        f.subscriber.ensure_group().await.expect("group");
        append(&f, &malformed()).await;
        f.subscriber.poll_once().await.expect("poll");

        let mut poison = 0;
        for _ in 0..3 {
            f.clock.advance(Duration::from_secs(61));
            poison += f.subscriber.redrive_once().await.expect("redrive").poison;
        }
        // Delivery counts 2, 3, 4 against a threshold of 2.
        assert_eq!(poison, 2);
        let pending = f.broker.pending(STREAM, "sync", 10).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery_count, 4);
    }

    async fn wait_for_rows(cache: &InMemoryDownstreamCache, rows: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.len().await.expect("len") < rows {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("rows should arrive");
    }

    #[tokio::test]
    async fn test_consumer_loop_applies_and_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.subscriber.clone().run_consumer(rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        append(&f, &created()).await;
        wait_for_rows(&f.cache, 1).await;

        tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop")
            .expect("join");
    }

    /// Broker whose first `failures` reads fail.
    struct FlakyReads {
        inner: InMemoryStreamBroker,
        failures: AtomicU32,
    }

    #[async_trait]
    impl StreamBroker for FlakyReads {
        async fn append(
            &self,
            stream: &str,
            event: &FileEvent,
            trim: &TrimPolicy,
        ) -> Result<StreamId, BrokerError> {
            self.inner.append(stream, event, trim).await
        }
        async fn ensure_group(
            &self,
            stream: &str,
            group: &str,
            start: GroupStart,
        ) -> Result<bool, BrokerError> {
            self.inner.ensure_group(stream, group, start).await
        }
        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            block: Duration,
        ) -> Result<Vec<StreamBatch>, BrokerError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(BrokerError::Unavailable {
                    reason: "connection reset".to_string(),
                });
            }
            self.inner.read_group(stream, group, consumer, count, block).await
        }
        async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<u64, BrokerError> {
            self.inner.ack(stream, group, ids).await
        }
        async fn pending(
            &self,
            stream: &str,
            group: &str,
            count: usize,
        ) -> Result<Vec<PendingEntry>, BrokerError> {
            self.inner.pending(stream, group, count).await
        }
        async fn claim_idle(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            count: usize,
        ) -> Result<Vec<Claimed>, BrokerError> {
            self.inner
                .claim_idle(stream, group, consumer, min_idle, count)
                .await
        }
        async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
            self.inner.len(stream).await
        }
    }

    #[tokio::test]
    async fn test_consumer_loop_survives_broker_outage() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let broker = Arc::new(FlakyReads {
            inner: InMemoryStreamBroker::with_clock(clock.clone()),
            failures: AtomicU32::new(3),
        });
        let cache = Arc::new(InMemoryDownstreamCache::new());
        let subscriber = Arc::new(EventSubscriber::new(
            broker.clone(),
            CacheSyncApplier::new(cache.clone(), clock),
            config(),
        ));
        broker
            .append(STREAM, &created(), &TrimPolicy::unbounded())
            .await
            .expect("append");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(subscriber.clone().run_consumer(rx));
        wait_for_rows(&cache, 1).await;

        assert_eq!(subscriber.metrics().snapshot().broker_errors, 3);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop when the sender is dropped")
            .expect("join");
    }

    #[tokio::test]
    async fn test_redrive_loop_retries_until_shutdown() {
        let f = fixture();
        f.subscriber.ensure_group().await.expect("group");
        append(&f, &created()).await;
        f.broker
            .read_group(STREAM, "sync", "crashed", 10, Duration::ZERO)
            .await
            .expect("read");
        f.clock.advance(Duration::from_secs(61));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.subscriber.clone().run_redrive(rx));
        wait_for_rows(&f.cache, 1).await;

        tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop")
            .expect("join");
        assert!(f.subscriber.metrics().snapshot().claimed >= 1);
    }
}
