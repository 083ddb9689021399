mod client;
pub(crate) mod types;

use std::time::Duration;

use crate::error::{AiError, Result};

use client::{OpenAiClient, OPENAI_API_URL};
use types::{ChatRequest, WireMessage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// OpenAi Agent
// =============================================================================

#[derive(Clone)]
pub struct OpenAi {
    api_key: String,
    model: String,
    base_url: Option<String>,
    timeout: Duration,
    max_tokens: Option<u32>,
}

impl OpenAi {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            max_tokens: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn client(&self) -> Result<OpenAiClient> {
        if self.api_key.trim().is_empty() {
            return Err(AiError::Config("OpenAI API key is empty".into()));
        }
        let base_url = self.base_url.as_deref().unwrap_or(OPENAI_API_URL);
        OpenAiClient::new(&self.api_key, base_url, self.timeout)
    }

    /// Simple chat completion: one system prompt, one user message, text back.
    pub async fn chat_completion(
        &self,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<String> {
        let mut request = ChatRequest::new(&self.model)
            .message(WireMessage::system(system))
            .message(WireMessage::user(user));

        // gpt-5 and the o-series reject a custom temperature.
        if !types::uses_max_completion_tokens(&self.model) {
            request = request.temperature(0.2);
        }
        if let Some(limit) = self.max_tokens {
            request = request.token_limit(limit);
        }

        let response = self.client()?.chat(&request).await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(AiError::EmptyResponse)
    }
}
