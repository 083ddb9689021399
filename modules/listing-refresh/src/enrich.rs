use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use ai_client::{truncate_to_char_boundary, OpenAi};
use listing_common::{Config, PropertySnapshot};

const SUMMARY_MAX_TOKENS: u32 = 300;
const DESCRIPTION_MAX_BYTES: usize = 4_000;

const SYSTEM_PROMPT: &str = "You write short, factual summaries of real-estate listings for a \
buyer's personal tracker. Use only the facts provided. Two to four sentences, no marketing \
language, no headings.";

/// Optional post-processing of a fresh snapshot.
///
/// Never fails: on any error the snapshot comes back as it went in.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, snapshot: PropertySnapshot) -> PropertySnapshot;
}

/// Used when enrichment is disabled or has no credential.
pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(&self, snapshot: PropertySnapshot) -> PropertySnapshot {
        snapshot
    }
}

/// Adds a written summary through an OpenAI chat model.
pub struct SummaryEnricher {
    agent: OpenAi,
    timeout: Duration,
}

impl SummaryEnricher {
    pub fn new(agent: OpenAi, timeout: Duration) -> Self {
        Self { agent, timeout }
    }
}

/// The enricher the configuration asks for.
pub fn from_config(config: &Config) -> Box<dyn Enricher> {
    match config.enrichment_key() {
        Some(key) => {
            info!(model = config.openai_model.as_str(), "Listing summaries enabled");
            let agent = OpenAi::new(key, &config.openai_model)
                .with_timeout(config.enrich_timeout)
                .with_max_tokens(SUMMARY_MAX_TOKENS);
            Box::new(SummaryEnricher::new(agent, config.enrich_timeout))
        }
        None => {
            info!("Listing summaries disabled");
            Box::new(NoopEnricher)
        }
    }
}

/// Facts handed to the model, one per line.
fn listing_facts(snapshot: &PropertySnapshot) -> String {
    let details = &snapshot.details;
    let mut lines = vec![
        format!("Address: {}", snapshot.address.replace('\n', ", ")),
        format!("Status: {}", snapshot.status),
        format!("Type: {}", details.property_type),
    ];
    if let Some(price) = snapshot.price {
        lines.push(format!("Price: {price}"));
    }
    if let Some(beds) = details.beds {
        lines.push(format!("Bedrooms: {beds}"));
    }
    match (details.baths_full, details.baths_half) {
        (Some(full), Some(half)) => lines.push(format!("Bathrooms: {full} full, {half} half")),
        (Some(full), None) => lines.push(format!("Bathrooms: {full} full")),
        _ => {}
    }
    if let Some(sqft) = details.sqft {
        lines.push(format!("Interior: {sqft} sqft"));
    }
    if let Some(lot) = details.lot_sqft {
        lines.push(format!("Lot: {lot} sqft"));
    }
    if let Some(year) = details.year_built {
        lines.push(format!("Built: {year}"));
    }
    if let Some(hoa) = details.hoa_fee {
        lines.push(format!("HOA fee: {hoa}"));
    }
    if let Some(days) = details.days_on_mls {
        lines.push(format!("Days on market: {days}"));
    }
    if let Some(text) = &details.description {
        lines.push(format!(
            "Listing text: {}",
            truncate_to_char_boundary(text.trim(), DESCRIPTION_MAX_BYTES)
        ));
    }
    lines.join("\n")
}

#[async_trait]
impl Enricher for SummaryEnricher {
    async fn enrich(&self, snapshot: PropertySnapshot) -> PropertySnapshot {
        let facts = listing_facts(&snapshot);
        let call = self.agent.chat_completion(SYSTEM_PROMPT, facts);

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(summary)) => {
                debug!(
                    source_id = snapshot.canonical_source_id.as_str(),
                    chars = summary.chars().count(),
                    "Generated listing summary"
                );
                snapshot.with_summary(summary)
            }
            Ok(Err(e)) => {
                warn!(
                    source_id = snapshot.canonical_source_id.as_str(),
                    error = %e,
                    "Enrichment failed, continuing without summary"
                );
                snapshot
            }
            Err(_) => {
                warn!(
                    source_id = snapshot.canonical_source_id.as_str(),
                    timeout_secs = self.timeout.as_secs(),
                    "Enrichment timed out, continuing without summary"
                );
                snapshot
            }
        }
    }
}
