use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ListingError;

/// Currency every price is normalized into before it leaves the source adapter.
pub const CANONICAL_CURRENCY: &str = "USD";

/// Listing type sent to the provider when the publisher does not name one.
pub const DEFAULT_LISTING_TYPE: &str = "for_sale";

// --- Identifiers ---

/// Record-store identifier of a tracked listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyId(pub i64);

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// --- Scrape requests ---

/// A request to refresh one tracked listing. Immutable once published.
///
/// The original host publisher used `record_id` and `location`; both are
/// accepted as aliases so queued legacy messages keep working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    #[serde(alias = "record_id")]
    pub property_id: PropertyId,
    #[serde(alias = "location")]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default = "default_listing_type")]
    pub listing_type: String,
}

fn default_listing_type() -> String {
    DEFAULT_LISTING_TYPE.to_string()
}

impl ScrapeRequest {
    pub fn new(property_id: PropertyId, address: impl Into<String>) -> Self {
        Self {
            property_id,
            address: address.into(),
            requested_at: Some(Utc::now()),
            listing_type: default_listing_type(),
        }
    }

    pub fn with_listing_type(mut self, listing_type: impl Into<String>) -> Self {
        self.listing_type = listing_type.into();
        self
    }

    /// Decode and validate a wire payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, ListingError> {
        let request: Self = serde_json::from_slice(payload)
            .map_err(|e| ListingError::InvalidRequest(format!("malformed payload: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, ListingError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self) -> Result<(), ListingError> {
        if self.property_id.0 <= 0 {
            return Err(ListingError::InvalidRequest(format!(
                "property_id must be positive, got {}",
                self.property_id
            )));
        }
        if self.address.trim().is_empty() {
            return Err(ListingError::InvalidRequest("address is empty".to_string()));
        }
        Ok(())
    }
}

// --- Snapshot value types ---

/// A monetary amount in minor units of [`CANONICAL_CURRENCY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price {
    pub cents: i64,
}

impl Price {
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    pub fn from_dollars(dollars: f64) -> Self {
        Self {
            cents: (dollars * 100.0).round() as i64,
        }
    }

    pub fn as_dollars(&self) -> f64 {
        self.cents as f64 / 100.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.as_dollars(), CANONICAL_CURRENCY)
    }
}

/// Market status as reported by the listing source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Pending,
    Contingent,
    Sold,
    OffMarket,
}

impl ListingStatus {
    /// Map a provider status string. Unknown values are treated as off market.
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "for_sale" | "for_rent" | "active" | "coming_soon" => Self::Active,
            "pending" => Self::Pending,
            "contingent" => Self::Contingent,
            "sold" => Self::Sold,
            _ => Self::OffMarket,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Contingent => "contingent",
            Self::Sold => "sold",
            Self::OffMarket => "off_market",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    #[default]
    SingleFamily,
    MultiFamily,
    Condos,
    CondoTownhome,
    Townhomes,
    DuplexTriplex,
    Farm,
    Land,
    Mobile,
}

/// Provider style spellings, checked in order. The first exact match wins,
/// otherwise the first entry contained in the style string.
const STYLE_TABLE: &[(&str, PropertyType)] = &[
    ("single_family", PropertyType::SingleFamily),
    ("single family", PropertyType::SingleFamily),
    ("singlefamily", PropertyType::SingleFamily),
    ("single-family", PropertyType::SingleFamily),
    ("multi_family", PropertyType::MultiFamily),
    ("multi family", PropertyType::MultiFamily),
    ("multifamily", PropertyType::MultiFamily),
    ("multi-family", PropertyType::MultiFamily),
    ("condo", PropertyType::Condos),
    ("condos", PropertyType::Condos),
    ("condominium", PropertyType::Condos),
    ("condo/townhome", PropertyType::CondoTownhome),
    ("condo_townhome", PropertyType::CondoTownhome),
    ("condo/townhouse", PropertyType::CondoTownhome),
    ("townhome", PropertyType::Townhomes),
    ("townhouse", PropertyType::Townhomes),
    ("townhomes", PropertyType::Townhomes),
    ("townhouses", PropertyType::Townhomes),
    ("duplex", PropertyType::DuplexTriplex),
    ("triplex", PropertyType::DuplexTriplex),
    ("duplex/triplex", PropertyType::DuplexTriplex),
    ("duplex_triplex", PropertyType::DuplexTriplex),
    ("farm", PropertyType::Farm),
    ("ranch", PropertyType::Farm),
    ("land", PropertyType::Land),
    ("lot", PropertyType::Land),
    ("mobile", PropertyType::Mobile),
    ("mobile home", PropertyType::Mobile),
    ("manufactured", PropertyType::Mobile),
];

impl PropertyType {
    pub fn from_style(style: &str) -> Self {
        let style = style.trim().to_lowercase();
        if style.is_empty() {
            return Self::default();
        }
        if let Some((_, kind)) = STYLE_TABLE.iter().find(|(key, _)| *key == style) {
            return *kind;
        }
        STYLE_TABLE
            .iter()
            .find(|(key, _)| style.contains(key))
            .map(|(_, kind)| *kind)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleFamily => "single_family",
            Self::MultiFamily => "multi_family",
            Self::Condos => "condos",
            Self::CondoTownhome => "condo_townhome",
            Self::Townhomes => "townhomes",
            Self::DuplexTriplex => "duplex_triplex",
            Self::Farm => "farm",
            Self::Land => "land",
            Self::Mobile => "mobile",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive listing fields beyond the headline price and status.
/// Areas are whole square feet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingDetails {
    pub mls_id: Option<String>,
    pub listing_url: Option<String>,
    pub property_type: PropertyType,
    pub beds: Option<u32>,
    pub baths_full: Option<u32>,
    pub baths_half: Option<u32>,
    pub sqft: Option<u32>,
    pub lot_sqft: Option<u32>,
    pub year_built: Option<u32>,
    pub days_on_mls: Option<u32>,
    pub hoa_fee: Option<Price>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<FeatureGroup>,
    #[serde(default)]
    pub estimates: Vec<ValueEstimate>,
    #[serde(default)]
    pub tax_history: Vec<TaxYear>,
}

/// One group of feature lines, e.g. `Interior` / `Heating and Cooling`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub parent_category: String,
    pub category: String,
    pub items: Vec<String>,
}

/// A dated automated valuation from one estimate source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEstimate {
    pub date: NaiveDate,
    pub estimate: Option<Price>,
    pub high: Option<Price>,
    pub low: Option<Price>,
    pub best_home_value: bool,
    pub source_name: String,
    pub source_type: String,
}

/// Tax bill and assessment for one year.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxYear {
    pub year: i32,
    pub tax: Option<Price>,
    pub assessed_year: Option<i32>,
    pub value: Option<Price>,
    pub assessment_total: Option<Price>,
    pub assessment_building: Option<Price>,
    pub assessment_land: Option<Price>,
    pub appraisal: Option<Price>,
    pub market: Option<Price>,
}

// --- Snapshots ---

/// Normalized result of one successful scrape. Never mutated, only superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub address: String,
    pub canonical_source_id: String,
    pub price: Option<Price>,
    pub status: ListingStatus,
    pub photo_urls: Vec<String>,
    pub popularity: Option<BTreeMap<String, f64>>,
    pub details: ListingDetails,
    /// Written summary from the enrichment service, if one ran.
    pub summary: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl PropertySnapshot {
    /// A new snapshot carrying `summary`; the receiver is consumed, not edited.
    pub fn with_summary(self, summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..self
        }
    }
}

// --- Reconciliation outcomes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Updated,
    Unchanged,
    NotFound,
    TransientFailure,
    PermanentFailure,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::NotFound => write!(f, "not_found"),
            Self::TransientFailure => write!(f, "transient_failure"),
            Self::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

/// Result of one reconciliation. A snapshot exists only for `Updated` and
/// `Unchanged`; an error detail only for the failure variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Updated(PropertySnapshot),
    Unchanged(PropertySnapshot),
    NotFound,
    TransientFailure(String),
    PermanentFailure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationOutcome {
    pub property_id: PropertyId,
    pub result: Outcome,
}

impl ReconciliationOutcome {
    pub fn new(property_id: PropertyId, result: Outcome) -> Self {
        Self {
            property_id,
            result,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self.result {
            Outcome::Updated(_) => OutcomeKind::Updated,
            Outcome::Unchanged(_) => OutcomeKind::Unchanged,
            Outcome::NotFound => OutcomeKind::NotFound,
            Outcome::TransientFailure(_) => OutcomeKind::TransientFailure,
            Outcome::PermanentFailure(_) => OutcomeKind::PermanentFailure,
        }
    }

    pub fn snapshot(&self) -> Option<&PropertySnapshot> {
        match &self.result {
            Outcome::Updated(s) | Outcome::Unchanged(s) => Some(s),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.result {
            Outcome::TransientFailure(e) | Outcome::PermanentFailure(e) => Some(e),
            _ => None,
        }
    }
}
