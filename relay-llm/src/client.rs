use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, Completion, SamplingParams};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";
pub const DEFAULT_MODEL: &str = "grok-2-latest";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct LlmClient {
    inner: OpenAiClient,
    model: String,
    params: SamplingParams,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: &str, api_key: &str, model: &str, params: SamplingParams) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            inner: OpenAiClient::new(http, base_url, api_key.trim(), model.trim()),
            model: model.trim().to_string(),
            params,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One request: system instruction followed by the user's message.
    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<Completion> {
        let messages = [ChatMessage::system(system_prompt), ChatMessage::user(user_text)];
        self.inner.chat(&messages, self.params).await
    }
}
