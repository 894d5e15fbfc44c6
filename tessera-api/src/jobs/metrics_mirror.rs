//! Metrics Mirror Background Task
//!
//! The storage and event crates keep their counters in atomics and know
//! nothing about Prometheus. This task samples them on an interval and
//! publishes the values under `tessera_component_counters`.

use std::sync::Arc;
use std::time::Duration;

use tessera_events::EventPublisher;
use tessera_storage::Node;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::telemetry::metrics::with_metrics;

/// A named component and a closure returning its current counters.
pub struct CounterSource {
    pub component: &'static str,
    sample: Box<dyn Fn() -> Vec<(&'static str, u64)> + Send + Sync>,
}

impl CounterSource {
    pub fn new(
        component: &'static str,
        sample: impl Fn() -> Vec<(&'static str, u64)> + Send + Sync + 'static,
    ) -> Self {
        Self {
            component,
            sample: Box::new(sample),
        }
    }

    pub fn sample(&self) -> Vec<(&'static str, u64)> {
        (self.sample)()
    }
}

impl std::fmt::Debug for CounterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterSource")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

/// Counters of a storage node and its publisher.
pub fn node_counter_sources(node: &Arc<Node>, publisher: &Arc<EventPublisher>) -> Vec<CounterSource> {
    let rebuild_node = node.clone();
    let read_node = node.clone();
    let wal_node = node.clone();
    let cache_node = node.clone();
    let publisher = publisher.clone();

    vec![
        CounterSource::new("rebuild", move || {
            let s = rebuild_node.rebuild().metrics().snapshot();
            vec![
                ("full_runs", s.full_runs),
                ("incremental_runs", s.incremental_runs),
                ("lazy_rebuilds", s.lazy_rebuilds),
                ("lazy_skipped", s.lazy_skipped),
                ("cleanup_runs", s.cleanup_runs),
                ("lock_timeouts", s.lock_timeouts),
                ("operation_timeouts", s.operation_timeouts),
                ("peak_in_flight", s.peak_in_flight),
            ]
        }),
        CounterSource::new("reads", move || {
            let s = read_node.read_metrics().snapshot();
            vec![
                ("fresh_hits", s.fresh_hits),
                ("lazy_refreshes", s.lazy_refreshes),
                ("stale_served", s.stale_served),
                ("uncached_served", s.uncached_served),
                ("not_found", s.not_found),
            ]
        }),
        CounterSource::new("cache_table", move || {
            let s = cache_node.cache().stats().snapshot();
            vec![("hits", s.hits), ("misses", s.misses)]
        }),
        CounterSource::new("wal", move || match wal_node.store().wal_counts() {
            Ok(c) => vec![
                ("pending", c.pending),
                ("committed", c.committed),
                ("rolled_back", c.rolled_back),
                ("failed", c.failed),
            ],
            Err(e) => {
                tracing::debug!(error = %e, "WAL counts unavailable");
                Vec::new()
            }
        }),
        CounterSource::new("publisher", move || {
            let s = publisher.metrics().snapshot();
            vec![
                ("published", s.published),
                ("failed", s.failed),
                ("rejected", s.rejected),
            ]
        }),
    ]
}

/// Publish every source once.
pub fn mirror_once(sources: &[CounterSource]) {
    with_metrics(|m| {
        for source in sources {
            m.record_counters(source.component, &source.sample());
        }
    });
}

/// Mirror `sources` every `every` until shutdown. Publishes a final sample
/// on the way out.
pub async fn metrics_mirror_task(
    sources: Vec<CounterSource>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => mirror_once(&sources),
        }
    }

    mirror_once(&sources);
    tracing::debug!(sources = sources.len(), "Metrics mirror task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::metrics::METRICS;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tessera_core::{Clock, RecordMutation, StreamConfig, SystemClock};
    use tessera_events::InMemoryStreamBroker;
    use tessera_test_utils::{fixtures, FileId, TempNode};

    #[test]
    fn test_mirror_once_publishes_counters() {
        let counter = Arc::new(AtomicU64::new(41));
        let sampled = counter.clone();
        let sources = vec![CounterSource::new("mirror_test", move || {
            vec![("events", sampled.load(Ordering::Relaxed))]
        })];

        counter.fetch_add(1, Ordering::Relaxed);
        mirror_once(&sources);

        let metrics = METRICS.as_ref().expect("metrics registered");
        let value = metrics
            .component_counters
            .with_label_values(&["mirror_test", "events"])
            .get();
        assert_eq!(value, 42.0);
    }

    fn counter(sources: &[CounterSource], component: &str, name: &str) -> Option<u64> {
        sources
            .iter()
            .find(|s| s.component == component)?
            .sample()
            .into_iter()
            .find(|(counter, _)| *counter == name)
            .map(|(_, value)| value)
    }

    #[tokio::test]
    async fn test_node_sources_cover_cache_table_and_publisher() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let publisher = Arc::new(EventPublisher::new(
            Arc::new(InMemoryStreamBroker::new()),
            &StreamConfig::default(),
            clock.clone(),
        ));
        let temp = TempNode::open(publisher.clone(), clock)
            .await
            .expect("node should open");
        let record = fixtures::record("mirrored.bin", chrono::Utc::now());
        let file_id = record.file_id;
        temp.node
            .write(RecordMutation::Create(record), None)
            .await
            .expect("create");
        temp.node.get(file_id).await.expect("cached read");
        temp.node.get(FileId::new()).await.expect("missing read");

        let sources = node_counter_sources(&temp.node, &publisher);
        assert_eq!(counter(&sources, "cache_table", "hits"), Some(1));
        assert!(counter(&sources, "cache_table", "misses") >= Some(1));
        assert_eq!(counter(&sources, "publisher", "published"), Some(1));
        assert_eq!(counter(&sources, "wal", "committed"), Some(1));

        mirror_once(&sources);
        let metrics = METRICS.as_ref().expect("metrics registered");
        assert_eq!(
            metrics
                .component_counters
                .with_label_values(&["cache_table", "hits"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(metrics_mirror_task(
            vec![CounterSource::new("mirror_stop", Vec::new)],
            Duration::from_millis(10),
            shutdown_rx,
        ));
        shutdown_tx.send(true).expect("task still listening");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task should stop")
            .expect("task should not panic");
    }
}
