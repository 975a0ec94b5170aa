//! Non-streaming [`ModelClient`] over the OpenRouter chat completions API.

use super::{ModelClient, ModelFuture, ModelResponse, SendOptions};
use crate::error::{GuardError, Result};
use crate::{Message, MessageRole, ToolCall};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for summarization calls.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

/// Wire shape of a message. Local-only fields (id, metadata, timestamp)
/// never leave the process.
#[derive(Serialize, Debug)]
struct WireMessage<'a> {
    role: &'a MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<&'a [ToolCall]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(msg: &'a Message) -> Self {
        Self {
            role: &msg.role,
            content: msg.content.as_deref(),
            name: msg.name.as_deref(),
            tool_calls: msg.tool_calls.as_deref(),
            tool_call_id: msg.tool_call_id.as_deref(),
        }
    }
}

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    /// Create a client that summarizes with [`DEFAULT_MODEL`].
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("ballast/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| GuardError::Model(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    /// Read the API key from `OPENROUTER_KEY`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("OPENROUTER_KEY")
            .map_err(|_| GuardError::Config("OPENROUTER_KEY not set".into()))?;
        Self::new(key)
    }

    /// Override the model used for completions.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[Message], options: &SendOptions) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            stream: options.stream,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };
        debug!(
            "LLM request: model={}, messages={}, max_tokens={:?}",
            self.model,
            messages.len(),
            options.max_tokens
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| GuardError::Model(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GuardError::Model(format!("failed to read response: {e}")))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(GuardError::Model(format!("OpenRouter API HTTP {status}: {text}")));
        }
        parse_completion(&text)
    }
}

/// Extract the first choice's text from a raw response body.
fn parse_completion(body: &str) -> Result<String> {
    let parsed: RawChatResponse = serde_json::from_str(body)
        .map_err(|e| GuardError::Model(format!("failed to parse response: {e}")))?;
    if let Some(err) = parsed.error {
        return Err(GuardError::Model(format!("OpenRouter API error: {}", err.message)));
    }
    Ok(parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message.content)
        .unwrap_or_default())
}

impl ModelClient for OpenRouterClient {
    fn send<'a>(&'a self, messages: &'a [Message], options: SendOptions) -> ModelFuture<'a> {
        Box::pin(async move {
            match self.chat(messages, &options).await {
                Ok(content) => ModelResponse::ok(content),
                Err(e) => ModelResponse::failed(e.to_string()),
            }
        })
    }
}
