//! Concurrency, idempotency and shutdown behavior of the supervisor.

mod harness;

use std::time::Duration;

use harness::{fast_settings, source_snapshot, stored_fields, Pipeline, ScriptedSource, ADDRESS};
use listing_common::{PropertyId, ScrapeRequest};
use listing_refresh::channel::{MessageChannel, Redelivery};
use listing_refresh::store::MemoryStore;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_requests_never_write_concurrently() {
    let id = PropertyId(42);
    let store = MemoryStore::new().with_write_latency(Duration::from_millis(30));
    store.insert(id, stored_fields(460_000.0), Some("nice yard"), vec![]);
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0)))
            .with_latency(Duration::from_millis(20)),
        store,
        fast_settings(4),
    );

    for _ in 0..5 {
        pipeline
            .channel
            .publish(&ScrapeRequest::new(id, ADDRESS))
            .await
            .unwrap();
    }
    pipeline.wait_for_acks(5).await;
    let stats = pipeline.stop().await;

    assert_eq!(pipeline.store.overlapping_writes(), 0);
    assert_eq!(pipeline.store.write_count(id), 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.unchanged, 4);
    assert!(stats.deferrals > 0);

    let record = pipeline.store.record(id).unwrap();
    assert_eq!(record.fields.price, Some(450_000.0));
    assert_eq!(record.notes.as_deref(), Some("nice yard"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_properties_run_in_parallel() {
    let store = MemoryStore::new().with_write_latency(Duration::from_millis(10));
    for n in 1..=4 {
        store.insert(PropertyId(n), stored_fields(460_000.0), None, vec![]);
    }
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0)))
            .with_latency(Duration::from_millis(200)),
        store,
        fast_settings(4),
    );

    let started = tokio::time::Instant::now();
    for n in 1..=4 {
        pipeline
            .channel
            .publish(&ScrapeRequest::new(PropertyId(n), ADDRESS))
            .await
            .unwrap();
    }
    pipeline.wait_for_acks(4).await;
    let elapsed = started.elapsed();
    let stats = pipeline.stop().await;

    assert_eq!(stats.updated, 4);
    assert_eq!(stats.deferrals, 0);
    // Four 200ms fetches in sequence would take 800ms.
    assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferral_limit_makes_slot_wait_for_property() {
    let id = PropertyId(42);
    let store = MemoryStore::new();
    store.insert(id, stored_fields(460_000.0), None, vec![]);
    let mut settings = fast_settings(2);
    settings.defer_max = 0;
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0)))
            .with_latency(Duration::from_millis(50)),
        store,
        settings,
    );

    pipeline
        .channel
        .publish(&ScrapeRequest::new(id, ADDRESS))
        .await
        .unwrap();
    pipeline
        .channel
        .publish(&ScrapeRequest::new(id, ADDRESS))
        .await
        .unwrap();
    pipeline.wait_for_acks(2).await;
    let stats = pipeline.stop().await;

    assert_eq!(stats.deferrals, 0);
    assert_eq!(stats.updated + stats.unchanged, 2);
    assert_eq!(pipeline.store.overlapping_writes(), 0);
    assert_eq!(pipeline.source.calls(), 2);
}

#[tokio::test]
async fn shutdown_requeues_work_cut_off_by_grace_period() {
    let id = PropertyId(42);
    let store = MemoryStore::new();
    store.insert(id, stored_fields(460_000.0), None, vec![]);
    let mut settings = fast_settings(1);
    settings.shutdown_grace = Duration::from_millis(50);
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0)))
            .with_latency(Duration::from_secs(30)),
        store,
        settings,
    );

    pipeline
        .channel
        .publish(&ScrapeRequest::new(id, ADDRESS))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.source.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reconciliation never started");

    let stats = pipeline.stop().await;

    let settlements = pipeline.channel.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].redelivery, Some(Redelivery::Requeue));
    assert_eq!(settlements[0].attempt, 1);
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.retries, 0);
    assert!(pipeline.store.writes().is_empty());
    assert!(pipeline.notifier.failures().is_empty());
}

#[tokio::test]
async fn shutdown_lets_in_flight_work_finish_within_grace() {
    let id = PropertyId(42);
    let store = MemoryStore::new();
    store.insert(id, stored_fields(460_000.0), None, vec![]);
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0)))
            .with_latency(Duration::from_millis(100)),
        store,
        fast_settings(1),
    );

    pipeline
        .channel
        .publish(&ScrapeRequest::new(id, ADDRESS))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while pipeline.source.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reconciliation never started");

    let stats = pipeline.stop().await;

    assert_eq!(stats.updated, 1);
    assert_eq!(pipeline.channel.acks().len(), 1);
    assert_eq!(pipeline.store.write_count(id), 1);
}

#[tokio::test]
async fn later_scrape_overwrites_earlier_one() {
    let id = PropertyId(42);
    let store = MemoryStore::new();
    store.insert(id, stored_fields(460_000.0), None, vec![]);

    // First fetch reports 450k, the next one a further drop.
    let source = ScriptedSource::always(Ok(source_snapshot(440_000.0)))
        .then(Ok(source_snapshot(450_000.0)));
    let mut pipeline = Pipeline::start(source, store, fast_settings(1));

    for expected_acks in 1..=2 {
        pipeline
            .channel
            .publish(&ScrapeRequest::new(id, ADDRESS))
            .await
            .unwrap();
        pipeline.wait_for_acks(expected_acks).await;
    }
    let stats = pipeline.stop().await;

    assert_eq!(stats.updated, 2);
    let writes = pipeline.store.writes();
    assert!(writes[0].1.last_scraped_at < writes[1].1.last_scraped_at);
    assert_eq!(
        pipeline.store.record(id).unwrap().fields.price,
        Some(440_000.0)
    );
}
