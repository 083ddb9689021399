use std::str::FromStr;
use std::time::Duration;

use crate::error::ListingError;

/// Worker configuration loaded from environment variables (and `.env`).
/// Everything except the record-store API key has a default.
#[derive(Debug, Clone)]
pub struct Config {
    // Logging
    pub log_level: String,
    pub log_json: bool,

    // RabbitMQ
    pub rabbitmq_host: String,
    pub rabbitmq_port: u16,
    pub rabbitmq_user: String,
    pub rabbitmq_pass: String,
    pub rabbitmq_exchange: String,
    pub rabbitmq_queue: String,
    pub rabbitmq_routing_key: String,
    pub rabbitmq_connect_retries: u32,

    // Record store (Odoo JSON-2)
    pub odoo_url: String,
    pub odoo_db: Option<String>,
    pub odoo_api_key: String,
    pub odoo_model: String,
    pub store_timeout: Duration,

    // Scrape source
    pub harvest_url: String,
    pub harvest_api_key: Option<String>,
    pub source_min_interval: Duration,
    pub source_timeout: Duration,

    // Enrichment
    pub enrichment_enabled: bool,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub enrich_timeout: Duration,

    // Supervisor
    pub max_concurrency: usize,
    pub retry_max_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub defer_delay: Duration,
    pub defer_max: u32,
    pub shutdown_grace: Duration,

    // Notifications
    pub failure_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ListingError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ListingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let odoo_api_key = env.optional("ODOO_API_KEY").ok_or_else(|| {
            ListingError::Config("ODOO_API_KEY environment variable is required".to_string())
        })?;

        let config = Self {
            log_level: env.string("LOG_LEVEL", "info"),
            log_json: env.string("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),

            rabbitmq_host: env.string("RABBITMQ_HOST", "rabbitmq"),
            rabbitmq_port: env.parse("RABBITMQ_PORT", 5672)?,
            rabbitmq_user: env.string("RABBITMQ_USER", "guest"),
            rabbitmq_pass: env.string("RABBITMQ_PASS", "guest"),
            rabbitmq_exchange: env.string("RABBITMQ_EXCHANGE", "property_exchange"),
            rabbitmq_queue: env.string("RABBITMQ_QUEUE", "property_scrape_queue"),
            rabbitmq_routing_key: env.string("RABBITMQ_ROUTING_KEY", "property.scrape"),
            rabbitmq_connect_retries: env.parse("RABBITMQ_CONNECT_RETRIES", 10)?,

            odoo_url: env.string("ODOO_URL", "http://localhost:8069"),
            odoo_db: Some(env.string("ODOO_DB_NAME", "odoo")).filter(|db| !db.is_empty()),
            odoo_api_key,
            odoo_model: env.string("ODOO_MODEL", "real_estate.listing"),
            store_timeout: Duration::from_secs(env.parse("STORE_TIMEOUT_SECS", 30)?),

            harvest_url: env.string("HARVEST_URL", "http://localhost:8000"),
            harvest_api_key: env.optional("HARVEST_API_KEY"),
            source_min_interval: Duration::from_millis(env.parse("SOURCE_MIN_INTERVAL_MS", 1000)?),
            source_timeout: Duration::from_secs(env.parse("SOURCE_TIMEOUT_SECS", 30)?),

            enrichment_enabled: env.parse_bool("ENRICHMENT_ENABLED", true)?,
            openai_api_key: env.optional("OPENAI_API_KEY"),
            openai_model: env.string("OPENAI_MODEL", "gpt-4o-mini"),
            enrich_timeout: Duration::from_secs(env.parse("ENRICH_TIMEOUT_SECS", 30)?),

            max_concurrency: env.parse("MAX_CONCURRENCY", 4)?,
            retry_max_attempts: env.parse("RETRY_MAX_ATTEMPTS", 5)?,
            retry_base: Duration::from_millis(env.parse("RETRY_BASE_MS", 2000)?),
            retry_cap: Duration::from_millis(env.parse("RETRY_CAP_MS", 60_000)?),
            defer_delay: Duration::from_millis(env.parse("DEFER_DELAY_MS", 500)?),
            defer_max: env.parse("DEFER_MAX", 20)?,
            shutdown_grace: Duration::from_secs(env.parse("SHUTDOWN_GRACE_SECS", 30)?),

            failure_webhook_url: env.optional("FAILURE_WEBHOOK_URL"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ListingError> {
        if self.max_concurrency == 0 {
            return Err(ListingError::Config("MAX_CONCURRENCY must be at least 1".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(ListingError::Config("RETRY_MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.retry_cap < self.retry_base {
            return Err(ListingError::Config(
                "RETRY_CAP_MS must not be smaller than RETRY_BASE_MS".into(),
            ));
        }
        if self.source_min_interval.is_zero() {
            return Err(ListingError::Config("SOURCE_MIN_INTERVAL_MS must be positive".into()));
        }
        Ok(())
    }

    /// Enrichment runs only when enabled and a credential is present.
    pub fn enrichment_key(&self) -> Option<&str> {
        if !self.enrichment_enabled {
            return None;
        }
        self.openai_api_key.as_deref()
    }

    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f",
            self.rabbitmq_user, self.rabbitmq_pass, self.rabbitmq_host, self.rabbitmq_port
        )
    }

    /// Log the effective configuration with secrets shortened to a preview.
    pub fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let n = val.char_indices().nth(4).map(|(i, _)| i).unwrap_or(val.len());
            format!("{}...({} chars)", &val[..n], val.len())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!(
            "  RABBITMQ: {}:{} exchange={} queue={} routing_key={} user={}",
            self.rabbitmq_host,
            self.rabbitmq_port,
            self.rabbitmq_exchange,
            self.rabbitmq_queue,
            self.rabbitmq_routing_key,
            self.rabbitmq_user
        );
        tracing::info!(
            "  ODOO_URL: {} db={:?} model={}",
            self.odoo_url,
            self.odoo_db,
            self.odoo_model
        );
        tracing::info!("  ODOO_API_KEY: {}", preview(&self.odoo_api_key));
        tracing::info!("  HARVEST_URL: {}", self.harvest_url);
        tracing::info!("  HARVEST_API_KEY: {}", preview_opt(&self.harvest_api_key));
        tracing::info!("  OPENAI_API_KEY: {}", preview_opt(&self.openai_api_key));
        tracing::info!(
            "  ENRICHMENT: {}",
            if self.enrichment_key().is_some() { "enabled" } else { "disabled" }
        );
        tracing::info!(
            "  SUPERVISOR: max_concurrency={} max_attempts={} backoff={}ms..{}ms",
            self.max_concurrency,
            self.retry_max_attempts,
            self.retry_base.as_millis(),
            self.retry_cap.as_millis()
        );
        tracing::info!("  FAILURE_WEBHOOK_URL: {}", preview_opt(&self.failure_webhook_url));
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ListingError> {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ListingError::Config(format!("{key} has an invalid value: {raw}"))),
            None => Ok(default),
        }
    }

    fn parse_bool(&self, key: &str, default: bool) -> Result<bool, ListingError> {
        match self.optional(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ListingError::Config(format!("{key} must be a boolean, got {v}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ListingError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_api_key_is_set() {
        let config = config_from(&[("ODOO_API_KEY", "secret-key")]).unwrap();
        assert_eq!(config.rabbitmq_queue, "property_scrape_queue");
        assert_eq!(config.rabbitmq_exchange, "property_exchange");
        assert_eq!(config.rabbitmq_routing_key, "property.scrape");
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.retry_base, Duration::from_secs(2));
        assert_eq!(config.retry_cap, Duration::from_secs(60));
        assert_eq!(config.source_timeout, Duration::from_secs(30));
        assert_eq!(config.odoo_db.as_deref(), Some("odoo"));
        assert!(config.enrichment_key().is_none());
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("ODOO_API_KEY"));
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        assert!(config_from(&[("ODOO_API_KEY", "   ")]).is_err());
    }

    #[test]
    fn enrichment_requires_both_flag_and_key() {
        let config = config_from(&[("ODOO_API_KEY", "k"), ("OPENAI_API_KEY", "sk-abc")]).unwrap();
        assert_eq!(config.enrichment_key(), Some("sk-abc"));

        let config = config_from(&[
            ("ODOO_API_KEY", "k"),
            ("OPENAI_API_KEY", "sk-abc"),
            ("ENRICHMENT_ENABLED", "false"),
        ])
        .unwrap();
        assert!(config.enrichment_key().is_none());
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = config_from(&[("ODOO_API_KEY", "k"), ("MAX_CONCURRENCY", "lots")]).unwrap_err();
        assert!(err.to_string().contains("MAX_CONCURRENCY"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(config_from(&[("ODOO_API_KEY", "k"), ("MAX_CONCURRENCY", "0")]).is_err());
    }

    #[test]
    fn backoff_cap_below_base_is_rejected() {
        let result = config_from(&[
            ("ODOO_API_KEY", "k"),
            ("RETRY_BASE_MS", "5000"),
            ("RETRY_CAP_MS", "1000"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn amqp_uri_uses_default_vhost() {
        let config = config_from(&[("ODOO_API_KEY", "k"), ("RABBITMQ_HOST", "mq")]).unwrap();
        assert_eq!(config.amqp_uri(), "amqp://guest:guest@mq:5672/%2f");
    }

    #[test]
    fn json_log_format_is_case_insensitive() {
        let config = config_from(&[("ODOO_API_KEY", "k"), ("LOG_FORMAT", "JSON")]).unwrap();
        assert!(config.log_json);
    }
}
