pub mod error;
pub mod types;

pub use error::{OdooError, Result};
pub use types::{nullify_false, ErrorBody, Record, DATETIME_FORMAT};

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Client for the Odoo JSON-2 API (`POST /json/2/<model>/<method>`),
/// authenticated with a user API key.
pub struct OdooClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    database: Option<String>,
}

impl OdooClient {
    pub fn new(
        url: &str,
        api_key: String,
        database: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| OdooError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            base_url: format!("{}/json/2", url.trim_end_matches('/')),
            api_key,
            database,
        })
    }

    /// Call `method` on `model` with keyword arguments in `body`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        model: &str,
        method: &str,
        body: Value,
    ) -> Result<T> {
        let url = format!("{}/{}/{}", self.base_url, model, method);
        let keys = body.as_object().map(|o| o.keys().collect::<Vec<_>>());
        tracing::debug!(%url, ?keys, "Odoo request");

        let mut request = self.client.post(&url).bearer_auth(&self.api_key).json(&body);
        if let Some(db) = &self.database {
            request = request.header("X-Odoo-Database", db);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
            let message = body.message.clone().unwrap_or_else(|| text.clone());
            if body.is_missing_record() || status.as_u16() == 404 {
                return Err(OdooError::MissingRecord(message));
            }
            if body.is_access_denied() || status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(OdooError::AccessDenied(message));
            }
            return Err(OdooError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Current user context. Used to verify the API key at startup.
    pub async fn context_get(&self) -> Result<Value> {
        self.call("res.users", "context_get", json!({})).await
    }

    pub async fn read(&self, model: &str, ids: &[i64], fields: &[&str]) -> Result<Vec<Record>> {
        self.call(model, "read", json!({ "ids": ids, "fields": fields }))
            .await
    }

    pub async fn write(&self, model: &str, ids: &[i64], vals: &Record) -> Result<bool> {
        self.call(model, "write", json!({ "ids": ids, "vals": vals }))
            .await
    }

    /// Create one record per entry in `vals_list`, returning the new ids.
    pub async fn create(&self, model: &str, vals_list: &[Record]) -> Result<Vec<i64>> {
        self.call(model, "create", json!({ "vals_list": vals_list }))
            .await
    }

    /// Field definitions of `model`, keyed by field name, limited to the
    /// `type` attribute.
    pub async fn fields_get(&self, model: &str) -> Result<Record> {
        self.call(model, "fields_get", json!({ "attributes": ["type"] }))
            .await
    }

    pub async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: &[&str],
    ) -> Result<Vec<Record>> {
        self.call(
            model,
            "search_read",
            json!({ "domain": domain, "fields": fields }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_json2_under_base_url() {
        let client = OdooClient::new(
            "https://odoo.example.com/",
            "key".to_string(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.base_url, "https://odoo.example.com/json/2");
    }

    #[test]
    fn refused_connection_is_network_error() {
        let client = OdooClient::new(
            "http://127.0.0.1:1",
            "key".to_string(),
            Some("odoo".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = tokio_test::block_on(client.context_get()).unwrap_err();
        assert!(matches!(err, OdooError::Network(_)), "got {err:?}");
    }
}
