//! Test harness for pipeline integration tests.
//!
//! Fakes the property-data source and the failure sink. Channel and record
//! store are the in-memory implementations shipped with the crate.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use listing_common::{ListingDetails, ListingStatus, Price, PropertyId, PropertySnapshot};
use listing_refresh::channel::MemoryChannel;
use listing_refresh::enrich::NoopEnricher;
use listing_refresh::notify::NotifyBackend;
use listing_refresh::reconciler::Reconciler;
use listing_refresh::retry::RetryPolicy;
use listing_refresh::source::{ScrapeSource, SourceError};
use listing_refresh::store::{MemoryStore, ScrapedFields};
use listing_refresh::supervisor::{Supervisor, SupervisorSettings};
use listing_refresh::types::{FailureRecord, SupervisorStats};

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Plays back scripted results, then repeats `fallback` forever. Every
/// successful fetch is stamped with the current time.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<PropertySnapshot, SourceError>>>,
    fallback: Result<PropertySnapshot, SourceError>,
    latency: Duration,
    calls: AtomicU32,
}

impl ScriptedSource {
    pub fn always(result: Result<PropertySnapshot, SourceError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: result,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn then(self, result: Result<PropertySnapshot, SourceError>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScrapeSource for ScriptedSource {
    async fn fetch(
        &self,
        _address: &str,
        _listing_type: &str,
    ) -> Result<PropertySnapshot, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone()).map(|mut snapshot| {
            snapshot.fetched_at = Utc::now();
            snapshot
        })
    }
}

// ---------------------------------------------------------------------------
// Failure sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    failures: Mutex<Vec<FailureRecord>>,
    digests: Mutex<Vec<SupervisorStats>>,
}

impl RecordingNotifier {
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().unwrap().clone()
    }

    pub fn digests(&self) -> Vec<SupervisorStats> {
        self.digests.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotifyBackend for RecordingNotifier {
    async fn send(&self, failure: &FailureRecord) -> anyhow::Result<()> {
        self.failures.lock().unwrap().push(failure.clone());
        Ok(())
    }

    async fn send_digest(&self, stats: &SupervisorStats) -> anyhow::Result<()> {
        self.digests.lock().unwrap().push(stats.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const ADDRESS: &str = "123 Main St";

/// What the source reports for the scenario property.
pub fn source_snapshot(dollars: f64) -> PropertySnapshot {
    PropertySnapshot {
        address: ADDRESS.to_string(),
        canonical_source_id: "9876543210".to_string(),
        price: Some(Price::from_dollars(dollars)),
        status: ListingStatus::Active,
        photo_urls: vec!["https://img.example/1.jpg".to_string()],
        popularity: None,
        details: ListingDetails {
            beds: Some(3),
            baths_full: Some(2),
            sqft: Some(1_850),
            ..Default::default()
        },
        summary: None,
        fetched_at: Utc::now(),
    }
}

/// Scraped fields as the record store holds them before the refresh.
pub fn stored_fields(dollars: f64) -> ScrapedFields {
    ScrapedFields {
        property_id: Some("9876543210".to_string()),
        address: Some(ADDRESS.to_string()),
        price: Some(dollars),
        market_status: Some("active".to_string()),
        ..Default::default()
    }
}

/// Settings with millisecond backoff so retry tests finish quickly.
pub fn fast_settings(max_concurrency: usize) -> SupervisorSettings {
    SupervisorSettings {
        max_concurrency,
        retry: RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(2),
            cap: Duration::from_millis(10),
        },
        defer_delay: Duration::from_millis(5),
        defer_max: 20,
        shutdown_grace: Duration::from_secs(5),
    }
}

// ---------------------------------------------------------------------------
// Running the supervisor
// ---------------------------------------------------------------------------

pub struct Pipeline {
    pub channel: MemoryChannel,
    pub store: MemoryStore,
    pub source: Arc<ScriptedSource>,
    pub notifier: Arc<RecordingNotifier>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<anyhow::Result<SupervisorStats>>>,
}

impl Pipeline {
    pub fn start(source: ScriptedSource, store: MemoryStore, settings: SupervisorSettings) -> Self {
        let channel = MemoryChannel::new();
        let source = Arc::new(source);
        let notifier = Arc::new(RecordingNotifier::default());
        let reconciler = Arc::new(Reconciler::new(
            source.clone(),
            Arc::new(NoopEnricher),
            Arc::new(store.clone()),
        ));
        let supervisor = Supervisor::new(
            Arc::new(channel.clone()),
            reconciler,
            notifier.clone(),
            settings,
        );

        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(shutdown).await })
        };

        Self {
            channel,
            store,
            source,
            notifier,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Wait (bounded) until `count` deliveries were acknowledged.
    pub async fn wait_for_acks(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), self.channel.wait_for_acks(count))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out waiting for {count} acks, settlements: {:?}",
                    self.channel.settlements()
                )
            });
    }

    /// Cancel the supervisor and return its final stats.
    pub async fn stop(&mut self) -> SupervisorStats {
        self.shutdown.cancel();
        let handle = self.handle.take().expect("supervisor already stopped");
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("supervisor did not stop")
            .expect("supervisor task panicked")
            .expect("supervisor returned an error")
    }

    pub fn seed(&self, id: PropertyId, fields: ScrapedFields, notes: Option<&str>, tags: Vec<i64>) {
        self.store.insert(id, fields, notes, tags);
    }
}
