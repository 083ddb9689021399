use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use thiserror::Error;
use tracing::{debug, warn};

use harvest_client::{
    Area, AreaUnit, HarvestAddress, HarvestClient, HarvestError, HarvestEstimate, HarvestFeature,
    HarvestProperty, HarvestTaxYear, Photo, Scalar, ScrapeInput,
};
use listing_common::{
    Config, FeatureGroup, ListingDetails, ListingStatus, Price, PropertySnapshot, PropertyType,
    TaxYear, ValueEstimate, CANONICAL_CURRENCY,
};

const SQFT_PER_SQM: f64 = 10.7639;
const SQFT_PER_ACRE: f64 = 43_560.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("no property found at address: {0}")]
    NotFound(String),

    #[error("source unavailable: {0}")]
    Transient(String),

    #[error("request rejected by source: {0}")]
    Permanent(String),
}

/// External property-data provider.
#[async_trait]
pub trait ScrapeSource: Send + Sync {
    /// Scrape the property at `address` into a normalized snapshot.
    async fn fetch(
        &self,
        address: &str,
        listing_type: &str,
    ) -> Result<PropertySnapshot, SourceError>;
}

/// [`ScrapeSource`] backed by a HomeHarvest scrape service.
///
/// All slots share one client and one limiter, so the provider never sees
/// more than one request per `min_interval`.
pub struct HarvestSource {
    client: HarvestClient,
    limiter: Option<DefaultDirectRateLimiter>,
    timeout: Duration,
}

impl HarvestSource {
    pub fn new(client: HarvestClient, min_interval: Duration, timeout: Duration) -> Self {
        let limiter = Quota::with_period(min_interval)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self {
            client,
            limiter,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, SourceError> {
        let client = HarvestClient::new(
            &config.harvest_url,
            config.harvest_api_key.clone(),
            config.source_timeout,
        )
        .map_err(classify)?;
        Ok(Self::new(
            client,
            config.source_min_interval,
            config.source_timeout,
        ))
    }
}

#[async_trait]
impl ScrapeSource for HarvestSource {
    async fn fetch(
        &self,
        address: &str,
        listing_type: &str,
    ) -> Result<PropertySnapshot, SourceError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(SourceError::Permanent("address is blank".to_string()));
        }

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let input = ScrapeInput {
            location: address.to_string(),
            listing_type: listing_type.to_string(),
            limit: 1,
        };
        let properties = tokio::time::timeout(self.timeout, self.client.scrape(&input))
            .await
            .map_err(|_| {
                SourceError::Transient(format!("timed out after {}s", self.timeout.as_secs()))
            })?
            .map_err(classify)?;

        let count = properties.len();
        let Some(property) = properties.into_iter().next() else {
            return Err(SourceError::NotFound(address.to_string()));
        };
        if count > 1 {
            warn!(address, count, "Source returned several properties, using the first");
        }

        let snapshot = normalize(property, address)?;
        debug!(
            address,
            source_id = snapshot.canonical_source_id.as_str(),
            status = %snapshot.status,
            "Normalized source property"
        );
        Ok(snapshot)
    }
}

/// Sort a provider error into the pipeline's error kinds.
fn classify(err: HarvestError) -> SourceError {
    match err {
        HarvestError::Timeout => SourceError::Transient("provider request timed out".to_string()),
        HarvestError::Network(msg) => SourceError::Transient(msg),
        HarvestError::Parse(msg) => {
            SourceError::Transient(format!("unreadable provider response: {msg}"))
        }
        HarvestError::Api { status: 404, message } => SourceError::NotFound(message),
        HarvestError::Api { status, message } if status == 429 || status >= 500 => {
            SourceError::Transient(format!("provider returned {status}: {message}"))
        }
        HarvestError::Api { status, message } => {
            SourceError::Permanent(format!("provider returned {status}: {message}"))
        }
        HarvestError::Setup(msg) => SourceError::Permanent(msg),
    }
}

// --- Normalization ---

/// Map a provider property onto a snapshot in canonical units.
pub fn normalize(
    property: HarvestProperty,
    requested: &str,
) -> Result<PropertySnapshot, SourceError> {
    if let Some(currency) = property.currency.as_deref().map(str::trim) {
        if !currency.is_empty() && !currency.eq_ignore_ascii_case(CANONICAL_CURRENCY) {
            return Err(SourceError::Permanent(format!(
                "unsupported currency {currency}, expected {CANONICAL_CURRENCY}"
            )));
        }
    }

    let canonical_source_id = [&property.property_id, &property.listing_id, &property.mls_id]
        .into_iter()
        .flatten()
        .map(Scalar::as_text)
        .find(|id| !id.is_empty())
        .ok_or_else(|| {
            SourceError::Permanent("provider property carries no identifier".to_string())
        })?;

    let status = property
        .status
        .as_deref()
        .or(property.mls_status.as_deref())
        .map(ListingStatus::from_provider)
        .unwrap_or(ListingStatus::OffMarket);

    let address = property
        .address
        .as_ref()
        .map(format_address)
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| requested.to_string());

    let description = property.description.unwrap_or_default();

    let photo_urls = collect_photos(
        property.photos.as_deref().unwrap_or_default(),
        &description.alt_photos,
    );

    let popularity = property.popularity.and_then(|p| {
        let mut metrics = BTreeMap::new();
        for period in p.periods {
            let Some(days) = period.last_n_days else {
                continue;
            };
            for (name, value) in period.metrics {
                if let Some(n) = value.as_f64() {
                    metrics.insert(format!("{name}_{days}d"), n);
                }
            }
        }
        (!metrics.is_empty()).then_some(metrics)
    });

    let details = ListingDetails {
        mls_id: property.mls_id.as_ref().map(Scalar::as_text).filter(|s| !s.is_empty()),
        listing_url: property.property_url.filter(|s| !s.trim().is_empty()),
        property_type: description
            .style
            .as_deref()
            .map(PropertyType::from_style)
            .unwrap_or_default(),
        beds: count(description.beds.as_ref()),
        baths_full: count(description.baths_full.as_ref()),
        baths_half: count(description.baths_half.as_ref()),
        sqft: description.sqft.as_ref().and_then(area_sqft),
        lot_sqft: description.lot_sqft.as_ref().and_then(area_sqft),
        year_built: count(description.year_built.as_ref()),
        days_on_mls: count(property.days_on_mls.as_ref()),
        hoa_fee: money(property.hoa_fee.as_ref()),
        latitude: property.latitude.as_ref().and_then(Scalar::as_f64),
        longitude: property.longitude.as_ref().and_then(Scalar::as_f64),
        description: description.text.filter(|t| !t.trim().is_empty()),
        features: property
            .details
            .unwrap_or_default()
            .into_iter()
            .filter_map(feature_group)
            .collect(),
        estimates: property
            .estimates
            .map(|e| e.current_values)
            .unwrap_or_default()
            .into_iter()
            .filter_map(value_estimate)
            .collect(),
        tax_history: property
            .tax_history
            .unwrap_or_default()
            .iter()
            .filter_map(tax_year)
            .collect(),
    };

    Ok(PropertySnapshot {
        address,
        canonical_source_id,
        price: money(property.list_price.as_ref()),
        status,
        photo_urls,
        popularity,
        details,
        summary: None,
        fetched_at: Utc::now(),
    })
}

fn present(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Formatted address if the provider sent one, else street and unit on the
/// first lines and `City, ST 12345` on the last.
fn format_address(address: &HarvestAddress) -> String {
    if let Some(formatted) = present(&address.formatted_address) {
        return formatted.to_string();
    }

    let mut lines: Vec<String> = Vec::new();
    lines.extend(present(&address.street).map(str::to_string));
    lines.extend(present(&address.unit).map(str::to_string));

    let mut locality = String::new();
    if let Some(city) = present(&address.city) {
        locality.push_str(city);
    }
    if let Some(state) = present(&address.state) {
        if !locality.is_empty() {
            locality.push_str(", ");
        }
        locality.push_str(state);
    }
    if let Some(zip) = present(&address.zip) {
        locality.push(' ');
        locality.push_str(zip);
    }
    let locality = locality.trim();
    if !locality.is_empty() {
        lines.push(locality.to_string());
    }

    lines.join("\n")
}

/// Feature groups need a category; blank text lines are dropped.
fn feature_group(feature: HarvestFeature) -> Option<FeatureGroup> {
    let category = present(&feature.category)?.to_string();
    let parent_category = present(&feature.parent_category).unwrap_or_default().to_string();
    let items = feature
        .text
        .unwrap_or_default()
        .into_iter()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    Some(FeatureGroup {
        parent_category,
        category,
        items,
    })
}

/// Estimates need a date; `2024-05-01` and full timestamps both parse.
fn value_estimate(estimate: HarvestEstimate) -> Option<ValueEstimate> {
    let date = present(&estimate.date)?;
    let date = NaiveDate::parse_from_str(date.get(..10).unwrap_or(date), "%Y-%m-%d").ok()?;
    let source = estimate.source.unwrap_or_default();
    Some(ValueEstimate {
        date,
        estimate: money(estimate.estimate.as_ref()),
        high: money(estimate.estimate_high.as_ref()),
        low: money(estimate.estimate_low.as_ref()),
        best_home_value: estimate.is_best_home_value.unwrap_or(false),
        source_name: present(&source.name).unwrap_or_default().to_string(),
        source_type: present(&source.kind).unwrap_or_default().to_string(),
    })
}

/// Tax records need a year.
fn tax_year(tax: &HarvestTaxYear) -> Option<TaxYear> {
    let assessment = tax.assessment.clone().unwrap_or_default();
    Some(TaxYear {
        year: i32::try_from(count(tax.year.as_ref()).filter(|y| *y > 0)?).ok()?,
        tax: money(tax.tax.as_ref()),
        assessed_year: count(tax.assessed_year.as_ref()).and_then(|y| i32::try_from(y).ok()),
        value: money(tax.value.as_ref()),
        assessment_total: money(assessment.total.as_ref()),
        assessment_building: money(assessment.building.as_ref()),
        assessment_land: money(assessment.land.as_ref()),
        appraisal: money(tax.appraisal.as_ref()),
        market: money(tax.market.as_ref()),
    })
}

/// Photo URLs in provider order, primary photos first, without duplicates.
fn collect_photos(photos: &[Photo], alt_photos: &[Photo]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for href in photos.iter().chain(alt_photos).filter_map(Photo::href) {
        let href = href.trim();
        if !href.is_empty() && !urls.iter().any(|u| u == href) {
            urls.push(href.to_string());
        }
    }
    urls
}

fn money(value: Option<&Scalar>) -> Option<Price> {
    value
        .and_then(Scalar::as_f64)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Price::from_dollars)
}

fn count(value: Option<&Scalar>) -> Option<u32> {
    value
        .and_then(Scalar::as_f64)
        .filter(|v| v.is_finite() && *v >= 0.0 && *v <= u32::MAX as f64)
        .map(|v| v.round() as u32)
}

fn area_sqft(area: &Area) -> Option<u32> {
    let (value, factor) = match area {
        Area::Plain(value) => (value, 1.0),
        Area::Measured { value, unit } => {
            let factor = match unit {
                AreaUnit::Sqft => 1.0,
                AreaUnit::Sqm => SQFT_PER_SQM,
                AreaUnit::Acres => SQFT_PER_ACRE,
            };
            (value, factor)
        }
    };
    let sqft = value.as_f64()? * factor;
    (sqft.is_finite() && sqft >= 0.0 && sqft <= u32::MAX as f64).then(|| sqft.round() as u32)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn property(value: serde_json::Value) -> HarvestProperty {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn normalizes_scenario_property() {
        let snapshot = normalize(
            property(json!({
                "property_id": "9876543210",
                "status": "FOR_SALE",
                "list_price": "$450,000",
                "currency": "usd",
                "address": {"street": "123 Main St", "city": "Springfield", "state": "IL", "zip_code": "62701"},
                "description": {
                    "beds": 3,
                    "baths_full": "2",
                    "sqft": {"value": 100, "unit": "sqm"},
                    "lot_sqft": {"value": 0.25, "unit": "acres"},
                    "style": "SINGLE_FAMILY",
                    "alt_photos": ["https://img/2.jpg"]
                },
                "photos": [{"href": "https://img/1.jpg"}, "https://img/2.jpg"],
                "popularity": {"periods": [{"last_n_days": 30, "views_total": 120, "saves_total": 4, "clicks_total": null}]}
            })),
            "123 Main St",
        )
        .unwrap();

        assert_eq!(snapshot.canonical_source_id, "9876543210");
        assert_eq!(snapshot.price, Some(Price::from_cents(45_000_000)));
        assert_eq!(snapshot.status, ListingStatus::Active);
        assert_eq!(snapshot.address, "123 Main St\nSpringfield, IL 62701");
        assert_eq!(snapshot.photo_urls, vec!["https://img/1.jpg", "https://img/2.jpg"]);
        assert_eq!(snapshot.details.beds, Some(3));
        assert_eq!(snapshot.details.baths_full, Some(2));
        assert_eq!(snapshot.details.sqft, Some(1_076));
        assert_eq!(snapshot.details.lot_sqft, Some(10_890));
        assert_eq!(snapshot.details.property_type, PropertyType::SingleFamily);

        let popularity = snapshot.popularity.unwrap();
        assert_eq!(popularity["views_total_30d"], 120.0);
        assert_eq!(popularity["saves_total_30d"], 4.0);
        assert!(!popularity.contains_key("clicks_total_30d"));
    }

    #[test]
    fn history_sections_are_normalized() {
        let snapshot = normalize(
            property(json!({
                "property_id": "1",
                "details": [
                    {"parent_category": "Interior", "category": "Heating", "text": ["Forced air", " "]},
                    {"parent_category": "Interior", "text": ["no category"]}
                ],
                "estimates": {"current_values": [
                    {"date": "2024-05-01 00:00:00", "estimate": 455000, "estimate_high": "480000",
                     "is_best_home_value": true, "source": {"name": "Quantarium", "type": "avm"}},
                    {"estimate": 1}
                ]},
                "tax_history": [
                    {"year": 2023, "tax": 5210, "assessment": {"total": 300000, "land": 80000}},
                    {"tax": 100}
                ]
            })),
            "1 Oak Ave",
        )
        .unwrap();
        let details = snapshot.details;

        assert_eq!(details.features.len(), 1);
        assert_eq!(details.features[0].category, "Heating");
        assert_eq!(details.features[0].items, vec!["Forced air"]);

        assert_eq!(details.estimates.len(), 1);
        let estimate = &details.estimates[0];
        assert_eq!(estimate.date, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(estimate.high, Some(Price::from_dollars(480_000.0)));
        assert!(estimate.best_home_value);
        assert_eq!(estimate.source_type, "avm");

        assert_eq!(details.tax_history.len(), 1);
        assert_eq!(details.tax_history[0].year, 2023);
        assert_eq!(
            details.tax_history[0].assessment_land,
            Some(Price::from_dollars(80_000.0))
        );
        assert!(details.tax_history[0].assessment_building.is_none());
    }

    #[test]
    fn foreign_currency_is_rejected() {
        let err = normalize(
            property(json!({"property_id": "1", "list_price": 300000, "currency": "CAD"})),
            "1 Bay St",
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::Permanent(msg) if msg.contains("CAD")));
    }

    #[test]
    fn missing_identifier_is_rejected() {
        let err = normalize(property(json!({"status": "sold"})), "1 Bay St").unwrap_err();
        assert!(matches!(err, SourceError::Permanent(_)));
    }

    #[test]
    fn falls_back_to_requested_address_and_listing_id() {
        let snapshot = normalize(
            property(json!({"listing_id": 555, "status": "pending", "address": {"street": "  "}})),
            "9 Elm Rd",
        )
        .unwrap();
        assert_eq!(snapshot.canonical_source_id, "555");
        assert_eq!(snapshot.address, "9 Elm Rd");
        assert_eq!(snapshot.status, ListingStatus::Pending);
        assert!(snapshot.price.is_none());
        assert!(snapshot.popularity.is_none());
    }

    #[test]
    fn formatted_address_wins_over_components() {
        let address = HarvestAddress {
            street: Some("1 Oak Ave".into()),
            formatted_address: Some("1 Oak Ave, Portland, OR 97201".into()),
            ..Default::default()
        };
        assert_eq!(format_address(&address), "1 Oak Ave, Portland, OR 97201");
    }

    #[test]
    fn provider_errors_are_classified() {
        let not_found = classify(HarvestError::Api {
            status: 404,
            message: "no match".into(),
        });
        assert!(matches!(not_found, SourceError::NotFound(_)));

        for status in [429, 500, 503] {
            let err = classify(HarvestError::Api {
                status,
                message: String::new(),
            });
            assert!(matches!(err, SourceError::Transient(_)), "{status}");
        }
        for status in [400, 422] {
            let err = classify(HarvestError::Api {
                status,
                message: String::new(),
            });
            assert!(matches!(err, SourceError::Permanent(_)), "{status}");
        }
        assert!(matches!(classify(HarvestError::Timeout), SourceError::Transient(_)));
        assert!(matches!(
            classify(HarvestError::Parse("eof".into())),
            SourceError::Transient(_)
        ));
    }

    #[test]
    fn blank_address_is_permanent_without_calling_provider() {
        let client =
            HarvestClient::new("http://127.0.0.1:9", None, Duration::from_millis(50)).unwrap();
        let source = HarvestSource::new(client, Duration::ZERO, Duration::from_millis(50));
        let err = tokio_test::block_on(source.fetch("   ", "for_sale")).unwrap_err();
        assert!(matches!(err, SourceError::Permanent(_)));
    }

    // The limiter runs on its own clock, so this one measures wall time.
    #[tokio::test]
    async fn consecutive_fetches_wait_out_min_interval() {
        let client =
            HarvestClient::new("http://127.0.0.1:1", None, Duration::from_millis(500)).unwrap();
        let source = HarvestSource::new(client, Duration::from_millis(150), Duration::from_secs(1));

        let started = std::time::Instant::now();
        for _ in 0..3 {
            let err = source.fetch("123 Main St", "for_sale").await.unwrap_err();
            assert!(matches!(err, SourceError::Transient(_)), "got {err:?}");
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(280), "took {elapsed:?}");
    }

    #[test]
    fn zero_interval_disables_throttle() {
        let client =
            HarvestClient::new("http://127.0.0.1:1", None, Duration::from_millis(500)).unwrap();
        let source = HarvestSource::new(client, Duration::ZERO, Duration::from_secs(1));
        assert!(source.limiter.is_none());
    }
}
