//! [`ModelProvider`] for OpenAI-compatible `/chat/completions` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use lattice_mcp_client::http_client::create_client_with_timeout;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AssistantError, Result};
use crate::provider::{Message, ModelProvider};

/// Completions can take a while on local models.
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionsProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
}

impl ChatCompletionsProvider {
    /// `base_url` is the API root, e.g. `http://localhost:1234/v1`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: create_client_with_timeout(COMPLETION_TIMEOUT)?,
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            temperature: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn error(&self, message: impl Into<String>) -> AssistantError {
        AssistantError::model(self.name(), message)
    }
}

#[async_trait]
impl ModelProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[Message]) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(model = %self.model, messages = messages.len(), "Requesting chat completion");
        let response = builder
            .send()
            .await
            .map_err(|e| self.error(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.error(format!("chat completion failed: {status} - {body}")));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| self.error(format!("invalid response body: {e}")))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| self.error("response contained no message"))
    }
}
