use async_trait::async_trait;
use tracing::{info, warn};

use super::backend::NotifyBackend;
use super::log::LogBackend;
use super::webhook::WebhookBackend;
use crate::types::{FailureRecord, SupervisorStats};

/// Fans notifications out to every configured backend. The log backend is
/// always present; delivery errors from one backend never reach the caller.
pub struct NotifyRouter {
    backends: Vec<Box<dyn NotifyBackend>>,
}

impl NotifyRouter {
    pub fn new(backends: Vec<Box<dyn NotifyBackend>>) -> Self {
        Self { backends }
    }

    /// Log backend plus a webhook when `webhook_url` is set.
    pub fn from_config(webhook_url: Option<&str>) -> Self {
        let mut backends: Vec<Box<dyn NotifyBackend>> = vec![Box::new(LogBackend)];
        match webhook_url {
            Some(url) => {
                info!("Failure webhook notifications enabled");
                backends.push(Box::new(WebhookBackend::new(url.to_string())));
            }
            None => info!("No FAILURE_WEBHOOK_URL set, failures are logged only"),
        }
        Self::new(backends)
    }
}

#[async_trait]
impl NotifyBackend for NotifyRouter {
    async fn send(&self, failure: &FailureRecord) -> anyhow::Result<()> {
        for backend in &self.backends {
            if let Err(e) = backend.send(failure).await {
                warn!(error = %e, kind = %failure.kind, "Failed to send failure notification");
            }
        }
        Ok(())
    }

    async fn send_digest(&self, stats: &SupervisorStats) -> anyhow::Result<()> {
        for backend in &self.backends {
            if let Err(e) = backend.send_digest(stats).await {
                warn!(error = %e, "Failed to send digest notification");
            }
        }
        Ok(())
    }
}
