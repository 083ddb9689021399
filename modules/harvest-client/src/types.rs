use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Request body for `POST /scrape`.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeInput {
    pub location: String,
    pub listing_type: String,
    pub limit: u32,
}

/// Response envelope for `POST /scrape`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeResponse {
    #[serde(default)]
    pub properties: Vec<HarvestProperty>,
}

// --- Loosely typed provider values ---

/// A value the provider sends either as a JSON number or as text
/// (`450000`, `"450000"`, `"$450,000"`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Numeric reading of the value. Currency symbols, thousands separators
    /// and whitespace are ignored in text values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            Scalar::Text(s) => {
                let cleaned: String = s
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                    .collect();
                cleaned.parse().ok()
            }
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Scalar::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaUnit {
    #[serde(alias = "sq_ft", alias = "sqft", alias = "square_feet", alias = "ft2")]
    Sqft,
    #[serde(alias = "sq_m", alias = "m2", alias = "square_meters")]
    Sqm,
    #[serde(alias = "acre", alias = "ac")]
    Acres,
}

/// An area the provider sends as a bare number (square feet) or with a unit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Area {
    Plain(Scalar),
    Measured { value: Scalar, unit: AreaUnit },
}

/// A photo the provider sends as a bare URL or as an object with `href`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Photo {
    Url(String),
    Object { href: Option<String> },
}

impl Photo {
    pub fn href(&self) -> Option<&str> {
        match self {
            Photo::Url(url) => Some(url.as_str()),
            Photo::Object { href } => href.as_deref(),
        }
    }
}

// --- Property payload ---

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestAddress {
    pub street: Option<String>,
    pub unit: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    #[serde(alias = "zip_code")]
    pub zip: Option<String>,
    pub formatted_address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestDescription {
    pub beds: Option<Scalar>,
    pub baths_full: Option<Scalar>,
    pub baths_half: Option<Scalar>,
    pub sqft: Option<Area>,
    pub lot_sqft: Option<Area>,
    pub year_built: Option<Scalar>,
    pub style: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub alt_photos: Vec<Photo>,
}

/// One popularity window, e.g. the last 30 days of views and saves.
#[derive(Debug, Clone, Deserialize)]
pub struct PopularityPeriod {
    pub last_n_days: Option<u32>,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestPopularity {
    #[serde(default)]
    pub periods: Vec<PopularityPeriod>,
}

/// One feature group from the listing's `details` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestFeature {
    pub parent_category: Option<String>,
    pub category: Option<String>,
    pub text: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EstimateSource {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestEstimate {
    /// `2024-05-01` or a full timestamp; only the date part is used.
    pub date: Option<String>,
    pub estimate: Option<Scalar>,
    pub estimate_high: Option<Scalar>,
    pub estimate_low: Option<Scalar>,
    pub is_best_home_value: Option<bool>,
    pub source: Option<EstimateSource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestEstimates {
    #[serde(default)]
    pub current_values: Vec<HarvestEstimate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestAssessment {
    pub total: Option<Scalar>,
    pub building: Option<Scalar>,
    pub land: Option<Scalar>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestTaxYear {
    pub year: Option<Scalar>,
    pub tax: Option<Scalar>,
    pub assessed_year: Option<Scalar>,
    pub value: Option<Scalar>,
    pub appraisal: Option<Scalar>,
    pub market: Option<Scalar>,
    pub assessment: Option<HarvestAssessment>,
}

/// Read an optional section, treating a malformed one as absent so a bad
/// history table does not cost the whole property.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// A property as returned by the scrape service. Every field is optional;
/// the provider omits or nulls whatever the listing site did not show.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarvestProperty {
    pub property_id: Option<Scalar>,
    pub listing_id: Option<Scalar>,
    pub mls: Option<String>,
    pub mls_id: Option<Scalar>,
    pub status: Option<String>,
    pub mls_status: Option<String>,
    pub list_price: Option<Scalar>,
    pub currency: Option<String>,
    pub hoa_fee: Option<Scalar>,
    pub days_on_mls: Option<Scalar>,
    pub latitude: Option<Scalar>,
    pub longitude: Option<Scalar>,
    pub property_url: Option<String>,
    pub address: Option<HarvestAddress>,
    pub description: Option<HarvestDescription>,
    #[serde(default)]
    pub photos: Option<Vec<Photo>>,
    pub popularity: Option<HarvestPopularity>,
    #[serde(default, deserialize_with = "lenient")]
    pub details: Option<Vec<HarvestFeature>>,
    #[serde(default, deserialize_with = "lenient")]
    pub estimates: Option<HarvestEstimates>,
    #[serde(default, deserialize_with = "lenient")]
    pub tax_history: Option<Vec<HarvestTaxYear>>,
}
