//! Model-client seam used by summarization.
//!
//! The compactor never talks HTTP itself. It hands a message list to a
//! [`ModelClient`] and gets back a [`ModelResponse`] whose `error` flag says
//! whether the call failed. Retry policy, if any, belongs to the client
//! implementation.
//!
//! - [`openrouter`]: [`OpenRouterClient`], a non-streaming client for the
//!   OpenRouter chat completions endpoint.

pub mod openrouter;

pub use openrouter::OpenRouterClient;

use crate::Message;
use futures::future::BoxFuture;

/// Boxed future returned by [`ModelClient::send`].
pub type ModelFuture<'a> = BoxFuture<'a, ModelResponse>;

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    /// Compaction always sends `false`.
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl SendOptions {
    /// Options for a one-shot, non-streaming completion.
    pub fn non_streaming() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// What a model call produced.
///
/// Failures are reported in-band through `error`/`error_message` rather than
/// as a `Result`, so a client can return partial content alongside an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    pub content: String,
    pub error: bool,
    pub error_message: Option<String>,
}

impl ModelResponse {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: false,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            error: true,
            error_message: Some(message.into()),
        }
    }
}

/// The model-client collaborator.
///
/// # Example
///
/// ```ignore
/// struct Canned;
///
/// impl ModelClient for Canned {
///     fn send<'a>(&'a self, _messages: &'a [Message], _options: SendOptions) -> ModelFuture<'a> {
///         Box::pin(async { ModelResponse::ok("summary") })
///     }
/// }
/// ```
pub trait ModelClient: Send + Sync {
    fn send<'a>(&'a self, messages: &'a [Message], options: SendOptions) -> ModelFuture<'a>;
}
