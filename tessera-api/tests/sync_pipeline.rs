//! End-to-end: node writes flow through the publisher and broker into the
//! downstream cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use tessera_core::Clock;
use tessera_events::{
    CacheSyncApplier, EventPublisher, EventSubscriber, InMemoryDownstreamCache,
    InMemoryStreamBroker,
};
use tessera_test_utils::{
    fixtures, generators, DownstreamCache, FlakyBroker, FlakyDownstreamCache, MetadataPatch,
    RecordMutation, StreamBroker, StreamId, SystemClock, TempNode,
};

struct Pipeline {
    temp: TempNode,
    broker: Arc<FlakyBroker>,
    publisher: Arc<EventPublisher>,
    subscriber: Arc<EventSubscriber>,
}

async fn pipeline(downstream: Arc<dyn DownstreamCache>) -> Pipeline {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broker = Arc::new(FlakyBroker::new(Arc::new(InMemoryStreamBroker::new())));
    let config = fixtures::stream_config("sync-1");

    let publisher = Arc::new(EventPublisher::new(broker.clone(), &config, clock.clone()));
    let temp = TempNode::open(publisher.clone(), clock.clone())
        .await
        .expect("node should open");

    let applier = CacheSyncApplier::new(downstream, clock);
    let subscriber = Arc::new(EventSubscriber::new(broker.clone(), applier, config));
    subscriber.ensure_group().await.expect("group should be created");

    Pipeline {
        temp,
        broker,
        publisher,
        subscriber,
    }
}

/// Poll until a read delivers nothing.
async fn drain(subscriber: &EventSubscriber) -> u64 {
    let mut delivered = 0;
    loop {
        let outcome = subscriber.poll_once().await.expect("poll should succeed");
        if outcome.delivered == 0 {
            return delivered;
        }
        delivered += outcome.delivered;
    }
}

#[tokio::test]
async fn test_create_update_delete_reach_downstream() {
    let downstream = Arc::new(InMemoryDownstreamCache::new());
    let p = pipeline(downstream.clone()).await;
    let node = &p.temp.node;

    let record = fixtures::record("report.pdf", Utc::now());
    let file_id = record.file_id;
    node.write(RecordMutation::Create(record), Some("alice"))
        .await
        .expect("create");
    node.write(
        RecordMutation::Update {
            file_id,
            patch: MetadataPatch::new().set("reviewed", serde_json::Value::Bool(true)),
        },
        Some("bob"),
    )
    .await
    .expect("update");

    assert_eq!(drain(&p.subscriber).await, 2);
    let row = downstream
        .get(file_id)
        .await
        .expect("get")
        .expect("row should exist");
    assert_eq!(row.record.metadata.get("reviewed"), Some(&serde_json::Value::Bool(true)));

    node.write(RecordMutation::Delete { file_id }, Some("alice"))
        .await
        .expect("delete");
    assert_eq!(drain(&p.subscriber).await, 1);
    assert!(downstream.get(file_id).await.expect("get").is_none());

    let snapshot = p.subscriber.metrics().snapshot();
    assert_eq!(snapshot.applied, 3);
    assert_eq!(snapshot.acked, 3);
    assert_eq!(p.publisher.metrics().snapshot().published, 3);
}

#[tokio::test]
async fn test_broker_outage_does_not_fail_writes() {
    let downstream = Arc::new(InMemoryDownstreamCache::new());
    let p = pipeline(downstream.clone()).await;

    p.broker.set_down(true);
    let record = fixtures::record("offline.bin", Utc::now());
    let file_id = record.file_id;
    p.temp
        .node
        .write(RecordMutation::Create(record), None)
        .await
        .expect("write succeeds while the broker is down");
    assert!(p.temp.node.get(file_id).await.expect("read").is_some());
    assert_eq!(p.publisher.metrics().snapshot().failed, 1);

    p.broker.set_down(false);
    assert_eq!(drain(&p.subscriber).await, 0);
    assert_eq!(downstream.len().await.expect("len"), 0);
}

#[tokio::test]
async fn test_failed_apply_is_redriven() {
    let downstream = Arc::new(FlakyDownstreamCache::new());
    let p = pipeline(downstream.clone()).await;

    downstream.fail_next(1);
    let record = fixtures::record("retry.bin", Utc::now());
    let file_id = record.file_id;
    p.temp
        .node
        .write(RecordMutation::Create(record), None)
        .await
        .expect("create");

    let outcome = p.subscriber.poll_once().await.expect("poll");
    assert_eq!(outcome.failed, 1);
    assert!(downstream.get(file_id).await.expect("get").is_none());

    let config = p.subscriber.config().clone();
    tokio::time::sleep(config.idle_threshold * 2).await;

    let redrive = p.subscriber.redrive_once().await.expect("redrive");
    assert_eq!(redrive.claimed, 1);
    assert_eq!(redrive.acked, 1);
    assert!(downstream.get(file_id).await.expect("get").is_some());

    let pending = p
        .broker
        .pending(&config.stream, &config.group, 10)
        .await
        .expect("pending");
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_duplicate_checksums_are_all_found() {
    let downstream = Arc::new(InMemoryDownstreamCache::new());
    let p = pipeline(downstream.clone()).await;

    let now = Utc::now();
    let first = fixtures::record("same.bin", now);
    let mut second = fixtures::record("copy.bin", now);
    second.checksum = first.checksum.clone();
    for record in [first.clone(), second] {
        p.temp
            .node
            .write(RecordMutation::Create(record), None)
            .await
            .expect("create");
    }
    drain(&p.subscriber).await;

    let found = downstream
        .find_by_checksum(&first.checksum)
        .await
        .expect("lookup");
    assert_eq!(found.len(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Delivering a history out of order, with repeats before and after,
    /// leaves the downstream cache as a single in-order delivery would.
    #[test]
    fn prop_redelivery_converges(
        (history, delivery) in generators::arb_history(3, 1..24).prop_flat_map(|history| {
            let n = history.len();
            let order = (
                prop::collection::vec(0..n, 0..n),
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                prop::collection::vec(0..n, 0..n),
            )
                .prop_map(|(before, shuffled, after)| {
                    before.into_iter().chain(shuffled).chain(after).collect::<Vec<_>>()
                });
            (Just(history), order)
        }),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let downstream = Arc::new(InMemoryDownstreamCache::new());
            let applier = CacheSyncApplier::new(downstream.clone(), Arc::new(SystemClock));

            let ids: Vec<StreamId> = (0..history.len() as u64)
                .map(|i| StreamId::new(1_000 + i, 0))
                .collect();
            for i in &delivery {
                applier.apply(ids[*i], &history[*i]).await.expect("apply");
            }

            for (file_id, expected) in generators::in_order_state(&history) {
                let stored = downstream.get(file_id).await.expect("get").map(|r| r.record);
                prop_assert_eq!(stored, expected);
            }
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_consumer_loop_end_to_end() {
    let downstream = Arc::new(InMemoryDownstreamCache::new());
    let p = pipeline(downstream.clone()).await;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let consumer = tokio::spawn(p.subscriber.clone().run_consumer(shutdown_rx));

    let record = fixtures::record("live.bin", Utc::now());
    let file_id = record.file_id;
    p.temp
        .node
        .write(RecordMutation::Create(record), None)
        .await
        .expect("create");

    let mut synced = false;
    for _ in 0..100 {
        if downstream.get(file_id).await.expect("get").is_some() {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(synced, "event should reach the downstream cache");

    shutdown_tx.send(true).expect("consumer still listening");
    tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer should stop")
        .expect("consumer should not panic");
}
