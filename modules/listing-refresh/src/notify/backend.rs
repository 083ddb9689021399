use async_trait::async_trait;

use crate::types::{FailureRecord, SupervisorStats};

/// Pluggable sink for terminal failures and run digests.
#[async_trait]
pub trait NotifyBackend: Send + Sync {
    /// Report a single terminal failure.
    async fn send(&self, failure: &FailureRecord) -> anyhow::Result<()>;

    /// Report the summary of a finished run.
    async fn send_digest(&self, stats: &SupervisorStats) -> anyhow::Result<()>;
}
