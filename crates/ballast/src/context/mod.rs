//! Context window management: token accounting and compaction.
//!
//! The context window is the scarcest resource in any LLM agent. This module
//! keeps usage under control in two layers:
//!
//! 1. **[`accountant`]**: [`TokenAccountant`] prices every message through a
//!    [`Tokenizer`], caches costs by message id, and detects unchanged file
//!    contents and duplicate tool results by content hash.
//!
//! 2. **[`compactor`]**: [`ContextCompactor`] shrinks the conversation once
//!    usage crosses a threshold:
//!    - **Summarize** ([`summarizer`]): old history is condensed by the model
//!      into a single system message; the system prompt and the live user
//!      request survive verbatim.
//!    - **Truncate** ([`truncation`]): under emergency pressure the oldest
//!      messages are dropped without a model call and replaced by a notice.
//!
//! Both paths carry file references ([`file_refs`]) forward so the agent
//! keeps track of what it was working on.

pub mod accountant;
pub mod compactor;
pub mod file_refs;
pub mod store;
pub mod summarizer;
pub mod tokenizer;
pub mod truncation;

pub use accountant::{CACHE_CLEANUP_TARGET, MAX_CACHE_SIZE, TokenAccountant, content_hash};
pub use compactor::{
    CompactionOutcome, CompactionReport, CompactionStrategy, ContextCompactor, SkipReason,
};
pub use file_refs::{FileReferences, extract_file_references};
pub use store::{ConversationStore, InMemoryConversation};
pub use tokenizer::{CharRatioTokenizer, DEFAULT_CHARS_PER_TOKEN, Tokenizer};
