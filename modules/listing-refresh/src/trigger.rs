use std::fmt;

use anyhow::{Context, Result};
use tracing::{info, warn};

use listing_common::ScrapeRequest;

use crate::channel::MessageChannel;
use crate::store::RecordStore;

/// Counts from a bulk re-trigger.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TriggerReport {
    pub published: u64,
    pub failed: u64,
}

impl fmt::Display for TriggerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "published={} failed={}", self.published, self.failed)
    }
}

/// Publish one validated scrape request.
pub async fn publish_request(channel: &dyn MessageChannel, request: &ScrapeRequest) -> Result<()> {
    request.validate()?;
    channel
        .publish(request)
        .await
        .with_context(|| format!("publishing scrape request for {}", request.property_id))?;
    info!(
        property_id = %request.property_id,
        address = request.address.as_str(),
        listing_type = request.listing_type.as_str(),
        "Published scrape request"
    );
    Ok(())
}

/// Publish a scrape request for every listing still on the market.
/// A failed publish is counted and the run continues.
pub async fn refresh_active(
    store: &dyn RecordStore,
    channel: &dyn MessageChannel,
    listing_type: &str,
) -> Result<TriggerReport> {
    let listings = store
        .list_active()
        .await
        .context("listing active records")?;
    info!(count = listings.len(), "Scheduling refresh of active listings");

    let mut report = TriggerReport::default();
    for listing in listings {
        let request =
            ScrapeRequest::new(listing.id, listing.address).with_listing_type(listing_type);
        match publish_request(channel, &request).await {
            Ok(()) => report.published += 1,
            Err(e) => {
                warn!(property_id = %listing.id, error = %e, "Failed to schedule refresh");
                report.failed += 1;
            }
        }
    }

    info!("Scheduled refresh complete. {report}");
    Ok(report)
}
