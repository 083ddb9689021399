pub mod error;
pub mod types;

pub use error::{HarvestError, Result};
pub use types::{
    Area, AreaUnit, EstimateSource, HarvestAddress, HarvestAssessment, HarvestDescription,
    HarvestEstimate, HarvestEstimates, HarvestFeature, HarvestPopularity, HarvestProperty,
    HarvestTaxYear, Photo, PopularityPeriod, Scalar, ScrapeInput, ScrapeResponse,
};

use std::time::Duration;

/// Client for a HomeHarvest scrape service: given a free-text location it
/// scrapes the listing sites and returns the matching properties.
pub struct HarvestClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HarvestClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Scrape properties at `location`. An empty list means the service found
    /// nothing for the address.
    pub async fn scrape(&self, input: &ScrapeInput) -> Result<Vec<HarvestProperty>> {
        tracing::debug!(
            location = %input.location,
            listing_type = %input.listing_type,
            limit = input.limit,
            "Requesting property scrape"
        );

        let url = format!("{}/scrape", self.base_url);
        let mut request = self.client.post(&url).json(input);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HarvestError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = resp.text().await?;
        let parsed: ScrapeResponse = serde_json::from_str(&body)?;
        tracing::debug!(count = parsed.properties.len(), "Scrape returned properties");

        Ok(parsed.properties)
    }
}
