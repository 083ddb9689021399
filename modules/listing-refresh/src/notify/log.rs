use async_trait::async_trait;
use tracing::{info, warn};

use super::backend::NotifyBackend;
use crate::types::{FailureRecord, SupervisorStats};

/// Writes failures to the structured log. Always enabled.
pub struct LogBackend;

#[async_trait]
impl NotifyBackend for LogBackend {
    async fn send(&self, failure: &FailureRecord) -> anyhow::Result<()> {
        warn!(
            failure_id = %failure.id,
            property_id = %failure.target(),
            address = failure.address.as_deref().unwrap_or("-"),
            kind = %failure.kind,
            attempts = failure.attempts,
            detail = %failure.detail,
            "Listing refresh failed"
        );
        Ok(())
    }

    async fn send_digest(&self, stats: &SupervisorStats) -> anyhow::Result<()> {
        info!("Refresh run complete. {stats}");
        Ok(())
    }
}
