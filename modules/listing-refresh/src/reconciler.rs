use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use listing_common::{Outcome, PropertyId, PropertySnapshot, ReconciliationOutcome, ScrapeRequest};

use crate::enrich::Enricher;
use crate::source::{ScrapeSource, SourceError};
use crate::store::{ListingUpdate, RecordStore, ScrapedFields, StoreError};

/// Write attempts per reconciliation: the first, plus one fresh
/// read-merge-write after a conflict.
const WRITE_ROUNDS: u32 = 2;

/// Turns one scrape request into at most one write of fresh source data.
///
/// Source-owned fields the scrape filled in overwrite the record; empty ones
/// leave the stored value. User-authored fields are never part of a write.
/// Enrichment runs only when a write is due. Callers must not run two
/// reconciliations of the same property at once.
pub struct Reconciler {
    source: Arc<dyn ScrapeSource>,
    enricher: Arc<dyn Enricher>,
    store: Arc<dyn RecordStore>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn ScrapeSource>,
        enricher: Arc<dyn Enricher>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            source,
            enricher,
            store,
        }
    }

    /// Reconcile `request`. A cancelled `cancel` abandons the work and
    /// yields a transient failure.
    pub async fn reconcile(
        &self,
        request: &ScrapeRequest,
        cancel: &CancellationToken,
    ) -> ReconciliationOutcome {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Outcome::TransientFailure("cancelled during shutdown".to_string())
            }
            result = self.run(request) => result,
        };

        let outcome = ReconciliationOutcome::new(request.property_id, result);
        match outcome.error() {
            Some(error) => warn!(
                property_id = %request.property_id,
                outcome = %outcome.kind(),
                error,
                "Reconciliation failed"
            ),
            None => info!(
                property_id = %request.property_id,
                outcome = %outcome.kind(),
                "Reconciliation finished"
            ),
        }
        outcome
    }

    async fn run(&self, request: &ScrapeRequest) -> Outcome {
        let id = request.property_id;

        let mut snapshot = match self.source.fetch(&request.address, &request.listing_type).await {
            Ok(snapshot) => snapshot,
            Err(SourceError::NotFound(detail)) => {
                debug!(property_id = %id, detail = detail.as_str(), "Source has no property");
                return Outcome::NotFound;
            }
            Err(SourceError::Transient(detail)) => return Outcome::TransientFailure(detail),
            Err(SourceError::Permanent(detail)) => return Outcome::PermanentFailure(detail),
        };

        let mut enriched = false;
        for round in 1..=WRITE_ROUNDS {
            let written = self.merge_and_write(id, &mut snapshot, &mut enriched).await;
            match written {
                Err(StoreError::Conflict(_)) if round < WRITE_ROUNDS => {
                    warn!(property_id = %id, "Record changed during reconciliation, re-reading");
                }
                Err(StoreError::Conflict(_)) => {
                    return Outcome::TransientFailure(format!(
                        "record {id} kept changing during write"
                    ));
                }
                Err(StoreError::NotFound(_)) => return Outcome::NotFound,
                Err(StoreError::Transient(detail)) => return Outcome::TransientFailure(detail),
                Err(StoreError::Permanent(detail)) => return Outcome::PermanentFailure(detail),
                Ok(true) => return Outcome::Updated(snapshot),
                Ok(false) => return Outcome::Unchanged(snapshot),
            }
        }
        Outcome::TransientFailure(format!("record {id} kept changing during write"))
    }

    /// Read, compare and write. `Ok(false)` when no write was needed.
    /// The snapshot is enriched in place before its first write.
    async fn merge_and_write(
        &self,
        id: PropertyId,
        snapshot: &mut PropertySnapshot,
        enriched: &mut bool,
    ) -> Result<bool, StoreError> {
        let record = self.store.get(id).await?;

        if record.is_newer_than(snapshot) {
            info!(
                property_id = %id,
                fetched_at = %snapshot.fetched_at,
                "Record already holds newer data, skipping stale snapshot"
            );
            return Ok(false);
        }

        let fresh = ScrapedFields::from_snapshot(snapshot);
        let changed = record.fields.changed_fields(&fresh);
        if changed.is_empty() {
            debug!(property_id = %id, "Scraped fields unchanged, no write");
            return Ok(false);
        }

        if !*enriched {
            *snapshot = self.enricher.enrich(snapshot.clone()).await;
            *enriched = true;
        }

        let update = ListingUpdate::from_snapshot(snapshot, &record);
        self.store.update(id, &update).await?;
        info!(property_id = %id, changed = ?changed, "Wrote fresh listing data");
        Ok(true)
    }
}
