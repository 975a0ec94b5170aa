use thiserror::Error;

/// Errors surfaced by the guardrail layer.
///
/// Configuration-fatal variants ([`is_fatal`](GuardError::is_fatal)) mean no
/// automatic action can recover and the user must change the configured
/// context size. Everything else is recoverable by the host.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error(
        "context window of {context_size} tokens is too small for the system prompt alone; \
         configure at least {required} tokens"
    )]
    ContextTooSmall { context_size: usize, required: usize },

    #[error(
        "compaction did not bring usage under the threshold ({old_percent}% -> {new_percent}% \
         of {context_size} tokens); the context size is too small for the fixed system prompt"
    )]
    CompactionIneffective {
        old_percent: u8,
        new_percent: u8,
        context_size: usize,
    },

    #[error("summarization failed: {0}")]
    Summarization(String),

    #[error("model client error: {0}")]
    Model(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("pattern {pattern} failed: {message}")]
    Pattern { pattern: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GuardError>;

impl GuardError {
    /// Whether the error is a configuration problem that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GuardError::ContextTooSmall { .. }
                | GuardError::CompactionIneffective { .. }
                | GuardError::Config(_)
        )
    }
}
