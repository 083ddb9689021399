//! Read and write access to tracked listings in the host record store.

pub mod memory;
pub mod odoo;
pub mod related;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use listing_common::{PropertyId, PropertySnapshot};

pub use memory::MemoryStore;
pub use odoo::OdooStore;
pub use related::{PopularityWindow, RelatedRecords};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(PropertyId),

    #[error("record {0} changed since it was read")]
    Conflict(PropertyId),

    #[error("record store unavailable: {0}")]
    Transient(String),

    #[error("record store rejected the request: {0}")]
    Permanent(String),
}

/// Host-side view of a tracked listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRecord {
    pub id: PropertyId,
    pub fields: ScrapedFields,
    /// User-authored; read for completeness, never written.
    pub notes: Option<String>,
    /// User-authored; read for completeness, never written.
    pub tag_ids: Vec<i64>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    /// Opaque marker that changes on every write (`write_date` in Odoo).
    pub version: Option<String>,
}

impl ListingRecord {
    /// Whether `snapshot` is no newer than the data already on the record.
    pub fn is_newer_than(&self, snapshot: &PropertySnapshot) -> bool {
        self.last_scraped_at
            .is_some_and(|scraped| scraped >= snapshot.fetched_at)
    }
}

/// The source-owned columns of a listing, named as the record store names
/// them. Photos are stored as JSON text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedFields {
    /// Provider identifier of the property.
    pub property_id: Option<String>,
    pub address: Option<String>,
    pub price: Option<f64>,
    pub market_status: Option<String>,
    pub url: Option<String>,
    pub mls_id: Option<String>,
    pub property_type: Option<String>,
    pub bedrooms: Option<u32>,
    pub baths_full: Option<u32>,
    pub baths_half: Option<u32>,
    pub sqft: Option<u32>,
    pub lot_sqft: Option<u32>,
    pub year_built: Option<u32>,
    pub days_on_mls: Option<u32>,
    pub hoa_fee: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub listing_description: Option<String>,
    pub primary_photo: Option<String>,
    pub photos: Option<String>,
}

/// Field names of [`ScrapedFields`], in declaration order.
pub const SCRAPED_FIELD_NAMES: &[&str] = &[
    "property_id",
    "address",
    "price",
    "market_status",
    "url",
    "mls_id",
    "property_type",
    "bedrooms",
    "baths_full",
    "baths_half",
    "sqft",
    "lot_sqft",
    "year_built",
    "days_on_mls",
    "hoa_fee",
    "latitude",
    "longitude",
    "listing_description",
    "primary_photo",
    "photos",
];

impl ScrapedFields {
    pub fn from_snapshot(snapshot: &PropertySnapshot) -> Self {
        let details = &snapshot.details;
        Self {
            property_id: Some(snapshot.canonical_source_id.clone()),
            address: Some(snapshot.address.clone()),
            price: snapshot.price.map(|p| p.as_dollars()),
            market_status: Some(snapshot.status.as_str().to_string()),
            url: details.listing_url.clone(),
            mls_id: details.mls_id.clone(),
            property_type: Some(details.property_type.as_str().to_string()),
            bedrooms: details.beds,
            baths_full: details.baths_full,
            baths_half: details.baths_half,
            sqft: details.sqft,
            lot_sqft: details.lot_sqft,
            year_built: details.year_built,
            days_on_mls: details.days_on_mls,
            hoa_fee: details.hoa_fee.map(|p| p.as_dollars()),
            latitude: details.latitude,
            longitude: details.longitude,
            listing_description: details.description.clone(),
            primary_photo: snapshot.photo_urls.first().cloned(),
            photos: (!snapshot.photo_urls.is_empty())
                .then(|| serde_json::to_string(&snapshot.photo_urls).ok())
                .flatten(),
        }
    }

    fn to_map(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Names of the fields where `fresh` carries a value that differs from
    /// the one in `self`. A field the fresh scrape left empty is not a
    /// change; the stored value stays. The store keeps empty numbers as `0`
    /// and empty text as `false`, so null, `false`, `0` and `""` all count
    /// as empty.
    pub fn changed_fields(&self, fresh: &ScrapedFields) -> Vec<&'static str> {
        let ours = self.to_map();
        let theirs = fresh.to_map();
        SCRAPED_FIELD_NAMES
            .iter()
            .copied()
            .filter(|name| {
                let incoming = canonical(theirs.get(*name));
                !incoming.is_null() && canonical(ours.get(*name)) != incoming
            })
            .collect()
    }

    /// `self` with every non-empty field of `fresh` laid over it.
    pub fn overlay(&self, fresh: &ScrapedFields) -> ScrapedFields {
        let mut merged = self.to_map();
        for (name, value) in fresh.to_map() {
            if !canonical(Some(&value)).is_null() {
                merged.insert(name, value);
            }
        }
        serde_json::from_value(Value::Object(merged)).unwrap_or_else(|_| fresh.clone())
    }
}

fn canonical(value: Option<&Value>) -> Value {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Value::Null,
        Some(Value::String(s)) if s.is_empty() => Value::Null,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f == 0.0 => Value::Null,
            // Integers and whole floats encode alike (3 vs 3.0).
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(f as i64),
            _ => Value::Number(n.clone()),
        },
        Some(other) => other.clone(),
    }
}

/// A write of fresh source data. User-authored fields cannot be expressed.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingUpdate {
    pub fields: ScrapedFields,
    pub last_scraped_at: DateTime<Utc>,
    pub summary: Option<String>,
    /// Child rows to upsert once the listing itself is written.
    pub related: RelatedRecords,
    /// Version observed when the record was read.
    pub expected_version: Option<String>,
}

impl ListingUpdate {
    pub fn from_snapshot(snapshot: &PropertySnapshot, read: &ListingRecord) -> Self {
        Self {
            fields: ScrapedFields::from_snapshot(snapshot),
            last_scraped_at: snapshot.fetched_at,
            summary: snapshot.summary.clone(),
            related: RelatedRecords::from_snapshot(snapshot),
            expected_version: read.version.clone(),
        }
    }
}

/// A listing due for a scheduled refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveListing {
    pub id: PropertyId,
    pub address: String,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: PropertyId) -> Result<ListingRecord, StoreError>;

    /// Write `update`: the non-empty scraped fields, then its related rows.
    /// `Conflict` when the record's version no longer matches
    /// `update.expected_version`. Empty fields leave the stored value alone.
    async fn update(&self, id: PropertyId, update: &ListingUpdate) -> Result<(), StoreError>;

    /// Verify connectivity and credentials.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Listings still on the market with an address to scrape.
    async fn list_active(&self) -> Result<Vec<ActiveListing>, StoreError>;
}
