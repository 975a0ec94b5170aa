//! Runtime guardrails for long-running, tool-calling LLM agents.
//!
//! `ballast` is the homeostasis layer of a coding agent: it keeps the
//! conversation inside a finite context window and notices when the agent's
//! own behavior says it is stuck. It does not run the agent. The host agent
//! owns the loop, feeds this crate what happened, and decides what to do with
//! the advisory signals that come back.
//!
//! # Where to find things
//!
//! - **Token accounting and deduplication:** [`TokenAccountant`](context::TokenAccountant)
//!   estimates per-message cost through a pluggable [`Tokenizer`](context::Tokenizer),
//!   caches costs by message id, and detects unchanged file contents and
//!   duplicate tool results by content hash.
//!
//! - **Compaction:** [`ContextCompactor`](context::ContextCompactor) decides
//!   when the conversation must shrink and either summarizes old history
//!   through a [`ModelClient`](api::ModelClient) or, under emergency pressure,
//!   truncates it without a model call.
//!
//! - **Tool cycles:** [`ToolCycleDetector`](loops::ToolCycleDetector) keeps a
//!   bounded history of tool-call signatures and flags exact repeats,
//!   near-repeats, and degrading search quality.
//!
//! - **Text loops:** [`TextLoopDetector`](loops::TextLoopDetector) watches
//!   streamed thinking/response text on a timer and fires a single callback
//!   when the model keeps reconsidering, re-asking, or re-announcing the
//!   same thing.
//!
//! - **Observing decisions:** implement [`EventHandler`](events::EventHandler)
//!   or use [`LoggingHandler`](events::LoggingHandler) to see compaction and
//!   loop signals as [`GuardEvent`](events::GuardEvent)s.
//!
//! # Example
//!
//! ```ignore
//! use ballast::prelude::*;
//! use std::sync::{Arc, Mutex};
//!
//! let config = GuardConfig::default().with_context_size(128_000);
//! let accountant = Arc::new(Mutex::new(TokenAccountant::new(
//!     Arc::new(CharRatioTokenizer::default()),
//!     config.compaction.context_size,
//! )));
//! let compactor = ContextCompactor::new(config.compaction.clone(), accountant.clone(), client)
//!     .with_event_handler(Arc::new(LoggingHandler));
//!
//! // Before each model turn:
//! match compactor.compact_if_needed(&conversation).await {
//!     Ok(outcome) => tracing::debug!("compaction: {outcome:?}"),
//!     Err(e) if e.is_fatal() => return Err(e),
//!     Err(e) => tracing::warn!("compaction failed: {e}"),
//! }
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod loops;
pub mod prelude;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{GuardError, Result};

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Files a compacted span touched, split by how they were touched.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSources {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub edited: Vec<String>,
    #[serde(default)]
    pub written: Vec<String>,
}

impl FileSources {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.edited.is_empty() && self.written.is_empty()
    }
}

/// Files the user explicitly mentioned in a message (e.g. `@src/main.rs`).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Mentions {
    #[serde(default)]
    pub files: Vec<String>,
}

/// Optional bag of flags and annotations attached to a message.
///
/// Field names serialize in camelCase so transcripts written by other hosts
/// round-trip without a mapping layer.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageMetadata {
    /// Never baked into a summary or persisted history.
    pub ephemeral: bool,
    /// Set on the system message produced by summarization.
    pub is_conversation_summary: bool,
    /// Set on the synthetic notice produced by emergency truncation.
    pub is_truncation_notice: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context_file_references: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_file_sources: Option<FileSources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_compaction_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Mentions>,
}

/// A message in the conversation.
///
/// Messages are created by the host per turn and never mutated in place by
/// this crate; compaction replaces the whole list.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    /// Stable identity used as the token-cost cache key. Messages without an
    /// id are recomputed on every pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    fn with_role(role: MessageRole, content: Option<String>) -> Self {
        Self {
            role,
            id: None,
            content,
            name: None,
            tool_calls: None,
            tool_call_id: None,
            timestamp: None,
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, Some(content.into()))
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, Some(content.into()))
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::with_role(MessageRole::Assistant, None)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::with_role(MessageRole::Tool, Some(content.into()))
        }
    }

    /// Attach a stable id (builder style).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a participant name (builder style).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the metadata bag (builder style).
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Stamp the message with the current time (builder style).
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }

    /// Mark the message ephemeral (builder style).
    pub fn ephemeral(mut self) -> Self {
        self.metadata.get_or_insert_with(MessageMetadata::default).ephemeral = true;
        self
    }

    /// Content as a string slice, empty when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn is_ephemeral(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.ephemeral)
    }

    pub fn is_conversation_summary(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(|m| m.is_conversation_summary)
    }

    /// Tool calls carried by this message, empty for non-assistant messages.
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

// ── Tool call types ────────────────────────────────────────────────

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub enum CallType {
    #[default]
    #[serde(rename = "function")]
    Function,
}

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    /// Build a function call with raw JSON `arguments`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Build a function call from a JSON value.
    pub fn from_value(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: &serde_json::Value,
    ) -> Self {
        Self::new(id, name, arguments.to_string())
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Function name plus raw JSON-encoded arguments, as the model produced them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}
