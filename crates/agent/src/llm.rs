//! Wire-level chat-completions client. Speaks the OpenAI-compatible
//! `/chat/completions` shape, which Ollama also serves.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskpilot_core::config::{LlmConfig, LlmProvider};

use crate::resolver::ResolverError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WireMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// Arguments arrive as a JSON-encoded string, per the wire format.
    pub arguments: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [Value],
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

/// Pluggable chat transport, so the resolver can be exercised without a
/// network in tests.
#[async_trait]
pub trait LlmChat: Send + Sync {
    async fn chat(
        &self,
        messages: &[WireMessage],
        tools: &[Value],
    ) -> Result<WireMessage, ResolverError>;
}

pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
}

impl OpenAiChat {
    pub fn from_config(config: &LlmConfig) -> Result<Self, ResolverError> {
        let base_url = config.base_url.clone().unwrap_or_else(|| match config.provider {
            LlmProvider::Ollama => "http://localhost:11434/v1".to_string(),
            _ => "https://api.openai.com/v1".to_string(),
        });
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ResolverError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl LlmChat for OpenAiChat {
    async fn chat(
        &self,
        messages: &[WireMessage],
        tools: &[Value],
    ) -> Result<WireMessage, ResolverError> {
        let request = ChatCompletionRequest { model: &self.model, messages, tools };

        let mut builder =
            self.client.post(format!("{}/chat/completions", self.base_url)).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ResolverError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| ResolverError::Transport(e.to_string()))?;

        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| ResolverError::Decode(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or(ResolverError::EmptyResponse)
    }
}
