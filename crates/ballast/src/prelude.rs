//! Convenience re-exports for common `ballast` types.
//!
//! Meant to be glob-imported by host agents:
//!
//! ```ignore
//! use ballast::prelude::*;
//! ```
//!
//! This pulls in the message types, configuration, the four guardrail
//! components, and the event handlers. Building blocks (ring buffer,
//! canonical JSON, truncation internals) stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    FileSources, GuardError, Message, MessageMetadata, MessageRole, Result, ToolCall,
};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{CompactionConfig, CycleConfig, GuardConfig, TextLoopConfig};

// ── Model client ────────────────────────────────────────────────────
pub use crate::api::{ModelClient, ModelFuture, ModelResponse, OpenRouterClient, SendOptions};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    CharRatioTokenizer, CompactionOutcome, CompactionReport, CompactionStrategy,
    ContextCompactor, ConversationStore, InMemoryConversation, SkipReason, TokenAccountant,
    Tokenizer,
};

// ── Loop detection ──────────────────────────────────────────────────
pub use crate::loops::{
    CycleInfo, CycleKind, DetectorState, LoopDetection, LoopPattern, PatternMatch, StreamKind,
    TextLoopDetector, ToolCycleDetector, ToolOutcome, steering_message,
};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeEventHandler, EventEnvelope, EventHandler, FnEventHandler, GuardEvent,
    LoggingHandler, NoopHandler, RecordingHandler,
};
