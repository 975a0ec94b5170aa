//! Events and handlers for guardrail decisions.
//!
//! Components report what they decided through [`GuardEvent`] variants
//! wrapped in an [`EventEnvelope`] (id + timestamp). Callers implement
//! [`EventHandler`] to observe these events for logging, UI progress
//! indicators, metrics, or any other side effects. Signals are advisory:
//! the host decides whether to inject a reminder, abort a turn, or ignore it.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget use |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`RecordingHandler`] | Collect envelopes for later inspection |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::context::CompactionStrategy;
use crate::loops::{CycleKind, StreamKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

// ── Events ─────────────────────────────────────────────────────────

/// Whether a compaction finished cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Error,
}

/// Events emitted by the guardrail components.
///
/// Serializes as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GuardEvent {
    /// Compaction passed both gates and is about to run.
    CompactionStart {
        usage_percent: u8,
        threshold: u8,
        message_count: usize,
    },
    /// Compaction finished, successfully or not. Always follows a
    /// `CompactionStart` so a waiting UI never hangs.
    CompactionComplete {
        status: CompletionStatus,
        strategy: CompactionStrategy,
        old_percent: u8,
        new_percent: u8,
        threshold: u8,
        file_references: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A streamed-text loop was confirmed.
    LoopDetected {
        stream: StreamKind,
        pattern_name: String,
        reason: String,
        match_count: usize,
    },
    /// A tool call was flagged by the cycle detector.
    CycleDetected {
        call_id: String,
        tool_name: String,
        kind: CycleKind,
        count: usize,
    },
}

/// An event plus its identity and emission time.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GuardEvent,
}

impl EventEnvelope {
    pub fn new(event: GuardEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Handler for guardrail events.
///
/// The default implementation ignores everything.
///
/// # Example
///
/// ```ignore
/// struct MyHandler;
///
/// impl EventHandler for MyHandler {
///     fn on_event(&self, envelope: &EventEnvelope) {
///         if let GuardEvent::LoopDetected { reason, .. } = &envelope.event {
///             eprintln!("agent looks stuck: {reason}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, envelope: &EventEnvelope) {
        let _ = envelope;
    }
}

/// Wrap `event` in a fresh envelope and hand it to `handler`.
pub fn emit(handler: &dyn EventHandler, event: GuardEvent) {
    handler.on_event(&EventEnvelope::new(event));
}

/// A handler that ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|envelope| {
///     println!("{}", serde_json::to_string(envelope).unwrap_or_default());
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&EventEnvelope) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&EventEnvelope) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&EventEnvelope) + Send + Sync,
{
    fn on_event(&self, envelope: &EventEnvelope) {
        (self.0)(envelope)
    }
}

/// An event handler that delegates to multiple inner handlers in
/// registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(my_ui_handler);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Add an already shared handler to the chain.
    pub fn with_shared(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, envelope: &EventEnvelope) {
        for handler in &self.handlers {
            handler.on_event(envelope);
        }
    }
}

/// Collects every envelope it sees.
///
/// Clones share the same buffer, so one clone can be handed to a component
/// while another is kept for inspection.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded envelopes, oldest first.
    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Snapshot of the recorded events without their envelopes.
    pub fn events(&self) -> Vec<GuardEvent> {
        self.envelopes().into_iter().map(|e| e.event).collect()
    }
}

impl EventHandler for RecordingHandler {
    fn on_event(&self, envelope: &EventEnvelope) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope.clone());
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, envelope: &EventEnvelope) {
        match &envelope.event {
            GuardEvent::CompactionStart {
                usage_percent,
                threshold,
                message_count,
            } => {
                info!(
                    "compaction starting: {usage_percent}% used (threshold {threshold}%), \
                     {message_count} messages"
                );
            }
            GuardEvent::CompactionComplete {
                status: CompletionStatus::Success,
                strategy,
                old_percent,
                new_percent,
                file_references,
                ..
            } => {
                info!(
                    "compaction complete ({strategy:?}): {old_percent}% -> {new_percent}%, \
                     {} file reference(s) preserved",
                    file_references.len()
                );
            }
            GuardEvent::CompactionComplete {
                status: CompletionStatus::Error,
                strategy,
                old_percent,
                error,
                ..
            } => {
                warn!(
                    "compaction failed ({strategy:?}) at {old_percent}%: {}",
                    error.as_deref().unwrap_or("unknown error")
                );
            }
            GuardEvent::LoopDetected {
                stream,
                pattern_name,
                match_count,
                ..
            } => {
                warn!("{stream:?} loop detected by {pattern_name} ({match_count} matches)");
            }
            GuardEvent::CycleDetected {
                tool_name,
                kind,
                count,
                ..
            } => {
                warn!("tool cycle on {tool_name}: {kind:?} x{count}");
            }
        }
    }
}
