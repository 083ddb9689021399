//! End-to-end refresh scenarios: in-memory channel, scripted source,
//! in-memory record store.

mod harness;

use std::collections::BTreeMap;
use std::time::Duration;

use harness::{fast_settings, source_snapshot, stored_fields, Pipeline, ScriptedSource, ADDRESS};
use listing_common::{Price, PropertyId, ScrapeRequest, TaxYear};
use listing_refresh::channel::{MessageChannel, Redelivery};
use listing_refresh::source::SourceError;
use listing_refresh::store::MemoryStore;
use listing_refresh::types::FailureKind;

const ID: PropertyId = PropertyId(42);

fn request() -> ScrapeRequest {
    ScrapeRequest::new(ID, ADDRESS)
}

#[tokio::test]
async fn fresh_price_is_written_and_notes_survive() {
    let store = MemoryStore::new();
    store.insert(ID, stored_fields(460_000.0), Some("nice yard"), vec![7]);
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0))),
        store,
        fast_settings(2),
    );

    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(1).await;
    let stats = pipeline.stop().await;

    let record = pipeline.store.record(ID).unwrap();
    assert_eq!(record.fields.price, Some(450_000.0));
    assert_eq!(record.fields.market_status.as_deref(), Some("active"));
    assert_eq!(record.fields.bedrooms, Some(3));
    assert_eq!(record.fields.sqft, Some(1_850));
    assert_eq!(record.notes.as_deref(), Some("nice yard"));
    assert_eq!(record.tag_ids, vec![7]);
    assert!(record.last_scraped_at.is_some());

    assert_eq!(pipeline.store.write_count(ID), 1);
    assert_eq!(stats.updated, 1);
    assert!(pipeline.notifier.failures().is_empty());
    assert_eq!(pipeline.notifier.digests().len(), 1);
}

#[tokio::test]
async fn unknown_address_is_acknowledged_without_write() {
    let store = MemoryStore::new();
    store.insert(ID, stored_fields(460_000.0), None, vec![]);
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Err(SourceError::NotFound(ADDRESS.to_string()))),
        store,
        fast_settings(1),
    );

    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(1).await;
    let stats = pipeline.stop().await;

    assert!(pipeline.store.writes().is_empty());
    assert_eq!(stats.not_found, 1);
    assert_eq!(pipeline.source.calls(), 1);

    let failures = pipeline.notifier.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::AddressNotFound);
    assert_eq!(failures[0].property_id, Some(ID));
}

#[tokio::test]
async fn timeouts_stop_after_five_attempts() {
    let store = MemoryStore::new();
    store.insert(ID, stored_fields(460_000.0), None, vec![]);
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Err(SourceError::Transient("timed out after 30s".to_string()))),
        store,
        fast_settings(1),
    );

    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(1).await;
    // Room for a sixth attempt, should one be scheduled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = pipeline.stop().await;

    assert_eq!(pipeline.source.calls(), 5);
    assert!(pipeline.store.writes().is_empty());

    let settlements = pipeline.channel.settlements();
    assert_eq!(settlements.len(), 5);
    let attempts: Vec<u32> = settlements.iter().map(|s| s.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    assert!(settlements[..4]
        .iter()
        .all(|s| matches!(s.redelivery, Some(Redelivery::Retry { .. }))));
    assert!(settlements[4].is_ack());

    assert_eq!(stats.retries, 4);
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.permanent_failures, 1);

    let failures = pipeline.notifier.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::ExhaustedRetries);
    assert_eq!(failures[0].attempts, 5);
    assert!(failures[0].detail.contains("timed out"));
}

#[tokio::test]
async fn transient_failure_then_success_updates_once() {
    let store = MemoryStore::new();
    store.insert(ID, stored_fields(460_000.0), None, vec![]);
    let source = ScriptedSource::always(Ok(source_snapshot(450_000.0)))
        .then(Err(SourceError::Transient("provider returned 503".to_string())));
    let mut pipeline = Pipeline::start(source, store, fast_settings(1));

    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(1).await;
    let stats = pipeline.stop().await;

    assert_eq!(pipeline.source.calls(), 2);
    assert_eq!(pipeline.store.write_count(ID), 1);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.updated, 1);
    assert!(pipeline.notifier.failures().is_empty());
}

#[tokio::test]
async fn identical_data_is_not_rewritten() {
    let store = MemoryStore::new();
    store.insert(ID, stored_fields(460_000.0), None, vec![]);
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0))),
        store,
        fast_settings(1),
    );

    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(1).await;
    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(2).await;
    let stats = pipeline.stop().await;

    assert_eq!(pipeline.source.calls(), 2);
    assert_eq!(pipeline.store.write_count(ID), 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.unchanged, 1);
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_reported() {
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0))),
        MemoryStore::new(),
        fast_settings(1),
    );

    pipeline.channel.push_raw(b"not json".to_vec());
    pipeline
        .channel
        .push_raw(br#"{"property_id": 42, "address": ""}"#.to_vec());
    pipeline.wait_for_acks(2).await;
    let stats = pipeline.stop().await;

    assert_eq!(pipeline.source.calls(), 0);
    assert_eq!(stats.malformed, 2);
    assert_eq!(stats.permanent_failures, 2);

    let failures = pipeline.notifier.failures();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.kind == FailureKind::Rejected));
    assert!(failures.iter().all(|f| f.property_id.is_none()));
}

#[tokio::test]
async fn rejected_address_is_not_retried() {
    let store = MemoryStore::new();
    store.insert(ID, stored_fields(460_000.0), None, vec![]);
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Err(SourceError::Permanent(
            "provider returned 422: unparseable address".to_string(),
        ))),
        store,
        fast_settings(1),
    );

    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = pipeline.stop().await;

    assert_eq!(pipeline.source.calls(), 1);
    assert_eq!(stats.permanent_failures, 1);
    assert_eq!(stats.retries, 0);
    let failures = pipeline.notifier.failures();
    assert_eq!(failures[0].kind, FailureKind::Rejected);
}

#[tokio::test]
async fn deleted_record_is_not_found() {
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(source_snapshot(450_000.0))),
        MemoryStore::new(),
        fast_settings(1),
    );

    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(1).await;
    let stats = pipeline.stop().await;

    assert_eq!(stats.not_found, 1);
    assert!(pipeline.store.writes().is_empty());
}

#[tokio::test]
async fn partial_scrape_keeps_stored_values_and_carries_history() {
    let store = MemoryStore::new();
    let mut stored = stored_fields(460_000.0);
    stored.latitude = Some(40.1);
    stored.mls_id = Some("MLS1".to_string());
    store.insert(ID, stored, None, vec![]);

    let mut snapshot = source_snapshot(450_000.0);
    snapshot.popularity = Some(BTreeMap::from([("views_total_30d".to_string(), 120.0)]));
    snapshot.details.tax_history = vec![TaxYear {
        year: 2023,
        tax: Some(Price::from_dollars(5_210.0)),
        ..Default::default()
    }];
    let mut pipeline = Pipeline::start(
        ScriptedSource::always(Ok(snapshot)),
        store,
        fast_settings(1),
    );

    pipeline.channel.publish(&request()).await.unwrap();
    pipeline.wait_for_acks(1).await;
    pipeline.stop().await;

    let record = pipeline.store.record(ID).unwrap();
    assert_eq!(record.fields.price, Some(450_000.0));
    assert_eq!(record.fields.latitude, Some(40.1));
    assert_eq!(record.fields.mls_id.as_deref(), Some("MLS1"));

    let writes = pipeline.store.writes();
    let related = &writes[0].1.related;
    assert_eq!(related.tax_history[0].year, 2023);
    assert_eq!(related.popularity[0].last_n_days, 30);
    assert_eq!(related.popularity[0].metrics["views_total"], 120.0);
}
