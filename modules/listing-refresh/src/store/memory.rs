use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use listing_common::PropertyId;

use super::{ActiveListing, ListingRecord, ListingUpdate, RecordStore, ScrapedFields, StoreError};

/// In-process record store for tests and local runs. Keeps a log of every
/// applied write and notices overlapping writes to one record.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    write_latency: Duration,
}

#[derive(Default)]
struct State {
    records: HashMap<PropertyId, ListingRecord>,
    writes: Vec<(PropertyId, ListingUpdate)>,
    writing: HashSet<PropertyId>,
    overlapping_writes: u32,
    injected_conflicts: u32,
    next_version: u64,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        format!("v{}", self.next_version)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every write open for `latency` so overlaps become observable.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a listing with the given scraped fields and user-authored data.
    pub fn insert(
        &self,
        id: PropertyId,
        fields: ScrapedFields,
        notes: Option<&str>,
        tag_ids: Vec<i64>,
    ) {
        let mut state = self.state();
        let version = state.bump_version();
        state.records.insert(
            id,
            ListingRecord {
                id,
                fields,
                notes: notes.map(str::to_string),
                tag_ids,
                last_scraped_at: None,
                version: Some(version),
            },
        );
    }

    pub fn remove(&self, id: PropertyId) {
        self.state().records.remove(&id);
    }

    /// Simulate a user edit: changes the version without touching fields.
    pub fn touch(&self, id: PropertyId) {
        let mut state = self.state();
        let version = state.bump_version();
        if let Some(record) = state.records.get_mut(&id) {
            record.version = Some(version);
        }
    }

    /// Make the next `count` writes fail with a conflict, each as if
    /// someone else wrote the record just before.
    pub fn inject_conflicts(&self, count: u32) {
        self.state().injected_conflicts = count;
    }

    pub fn record(&self, id: PropertyId) -> Option<ListingRecord> {
        self.state().records.get(&id).cloned()
    }

    pub fn writes(&self) -> Vec<(PropertyId, ListingUpdate)> {
        self.state().writes.clone()
    }

    pub fn write_count(&self, id: PropertyId) -> usize {
        self.state().writes.iter().filter(|(w, _)| *w == id).count()
    }

    /// Writes that started while another write to the same record was open.
    pub fn overlapping_writes(&self) -> u32 {
        self.state().overlapping_writes
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, id: PropertyId) -> Result<ListingRecord, StoreError> {
        self.record(id).ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: PropertyId, update: &ListingUpdate) -> Result<(), StoreError> {
        {
            let mut state = self.state();
            if !state.records.contains_key(&id) {
                return Err(StoreError::NotFound(id));
            }
            if state.injected_conflicts > 0 {
                state.injected_conflicts -= 1;
                let version = state.bump_version();
                if let Some(record) = state.records.get_mut(&id) {
                    record.version = Some(version);
                }
                return Err(StoreError::Conflict(id));
            }
            let current = state.records.get(&id).and_then(|r| r.version.clone());
            if current != update.expected_version {
                return Err(StoreError::Conflict(id));
            }
            if !state.writing.insert(id) {
                state.overlapping_writes += 1;
            }
        }

        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }

        let mut state = self.state();
        state.writing.remove(&id);
        let version = state.bump_version();
        if let Some(record) = state.records.get_mut(&id) {
            record.fields = record.fields.overlay(&update.fields);
            record.last_scraped_at = Some(update.last_scraped_at);
            record.version = Some(version);
        }
        state.writes.push((id, update.clone()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ActiveListing>, StoreError> {
        let state = self.state();
        let mut active: Vec<ActiveListing> = state
            .records
            .values()
            .filter(|r| r.fields.market_status.as_deref() != Some("off_market"))
            .filter_map(|r| {
                let address = r.fields.address.clone().filter(|a| !a.trim().is_empty())?;
                Some(ActiveListing { id: r.id, address })
            })
            .collect();
        active.sort_by_key(|listing| listing.id);
        Ok(active)
    }
}
