use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use super::backend::NotifyBackend;
use crate::types::{FailureKind, FailureRecord, SupervisorStats};

/// Incoming-webhook backend (Slack-compatible `{"text": ...}` payload).
pub struct WebhookBackend {
    webhook_url: String,
    http: reqwest::Client,
}

impl WebhookBackend {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    fn kind_emoji(kind: &FailureKind) -> &'static str {
        match kind {
            FailureKind::AddressNotFound => ":mag:",
            FailureKind::Rejected => ":no_entry_sign:",
            FailureKind::ExhaustedRetries => ":rotating_light:",
        }
    }

    pub(crate) fn failure_text(failure: &FailureRecord) -> String {
        let emoji = Self::kind_emoji(&failure.kind);
        format!(
            "{emoji} *Listing refresh failed: {}*\n\
             *Property:* `{}`\n\
             *Address:* {}\n\
             *Attempts:* {}\n\n\
             {}",
            failure.kind,
            failure.target(),
            failure.address.as_deref().unwrap_or("-"),
            failure.attempts,
            failure.detail,
        )
    }

    async fn post(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Failure webhook returned non-success");
            anyhow::bail!("failure webhook returned {status}");
        }

        Ok(())
    }
}

#[async_trait]
impl NotifyBackend for WebhookBackend {
    async fn send(&self, failure: &FailureRecord) -> anyhow::Result<()> {
        let payload = json!({
            "text": Self::failure_text(failure),
            "unfurl_links": false,
        });

        self.post(payload).await
    }

    async fn send_digest(&self, stats: &SupervisorStats) -> anyhow::Result<()> {
        let failures = stats.permanent_failures + stats.not_found;
        if failures == 0 {
            // Nothing to report
            return Ok(());
        }

        let lines = [
            ":clipboard: *Listing refresh run complete*".to_string(),
            format!("*Updated:* {}  *Unchanged:* {}", stats.updated, stats.unchanged),
            format!(
                "*Not found:* {}  *Failed:* {} (exhausted retries: {}, malformed: {})",
                stats.not_found, stats.permanent_failures, stats.exhausted, stats.malformed
            ),
        ];

        let payload = json!({
            "text": lines.join("\n"),
            "unfurl_links": false,
        });

        self.post(payload).await
    }
}
