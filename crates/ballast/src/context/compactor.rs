//! Context compaction: keep the conversation under its token budget.
//!
//! [`ContextCompactor`] is checked by the host before each model turn. When
//! usage crosses the compaction threshold it either summarizes old history
//! through the [`ModelClient`] or, past the emergency threshold, truncates it
//! with no model call at all.
//!
//! ```text
//!             usage >= compact_threshold
//!             && messages >= min_messages_to_attempt
//!   Idle ─────────────────────────────────────────────▶ Compacting
//!    ▲                                                      │
//!    │            usage <  emergency ─▶ summarize ──┐       │
//!    │            usage >= emergency ─▶ truncate  ──┤       │
//!    │                                              ▼       │
//!    └──────────── guard released ◀──── verify new usage ◀──┘
//! ```
//!
//! A failed summarization (model error, empty summary, or a result still over
//! the threshold) gets exactly one fallback: truncation of the history as it
//! was before the attempt. When the summarization request itself would not
//! fit, truncation runs directly instead. Failures of the truncation path
//! propagate. Overlapping calls while a compaction is in flight return
//! [`SkipReason::InProgress`] instead of queueing.

use super::accountant::TokenAccountant;
use super::file_refs::{FileReferences, extract_file_references};
use super::store::ConversationStore;
use super::summarizer;
use super::truncation;
use crate::api::{ModelClient, SendOptions};
use crate::config::CompactionConfig;
use crate::error::{GuardError, Result};
use crate::events::{CompletionStatus, EventHandler, GuardEvent, NoopHandler, emit};
use crate::{Message, MessageRole};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Summarization is abandoned when less than this many tokens remain for
/// the history after the fixed request overhead.
pub const MIN_SUMMARY_BUDGET: usize = 500;

/// Which compaction path produced (or failed to produce) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    Summarize,
    Truncate,
    /// Nothing to compact.
    None,
}

/// Why a compaction check did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another compaction is in flight.
    InProgress,
    BelowThreshold { usage_percent: u8, threshold: u8 },
    TooFewMessages { count: usize, minimum: usize },
}

/// Summary of a compaction that replaced the message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub strategy: CompactionStrategy,
    pub old_percent: u8,
    pub new_percent: u8,
    pub messages_before: usize,
    pub messages_after: usize,
    pub file_references: Vec<String>,
    /// Summarization failed and truncation took over.
    pub used_fallback: bool,
}

/// Result of a compaction check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    Skipped(SkipReason),
    /// Compaction ran but there was not enough history to summarize.
    Unchanged,
    Compacted(CompactionReport),
}

impl CompactionOutcome {
    pub fn is_compacted(&self) -> bool {
        matches!(self, CompactionOutcome::Compacted(_))
    }
}

/// Marks the compactor busy for as long as it lives.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Which gates a run honors and which strategies it may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Usage gate applies; the emergency threshold picks the strategy.
    Gated,
    /// No usage gate; the emergency threshold picks the strategy.
    Forced,
    /// No usage gate; always truncate.
    ForcedTruncate,
}

/// What the summarize path decided to do before any model call.
enum SummaryPlan {
    /// Too little durable history to be worth summarizing.
    NoOp,
    /// The request itself would not fit; truncate instead.
    OverBudget,
    Request(SummaryRequest),
}

struct SummaryRequest {
    system: Option<Message>,
    candidates: Vec<Message>,
    live: Option<Message>,
    file_refs: FileReferences,
}

/// A successfully verified compaction, before it becomes a report.
struct Applied {
    strategy: CompactionStrategy,
    new_percent: u8,
    messages_after: usize,
    file_refs: FileReferences,
}

/// Failure of one strategy, remembering which one so the error event can
/// name it.
struct Failed {
    strategy: CompactionStrategy,
    error: GuardError,
}

/// Decides when and how to shrink a conversation.
///
/// The accountant is shared with the host, which keeps using it for its own
/// budget checks; the lock is never held across the model call.
pub struct ContextCompactor {
    config: CompactionConfig,
    accountant: Arc<Mutex<TokenAccountant>>,
    client: Arc<dyn ModelClient>,
    handler: Arc<dyn EventHandler>,
    compacting: AtomicBool,
}

impl ContextCompactor {
    /// Build a compactor. The accountant's context size is set to
    /// `config.context_size` so both agree on the budget.
    pub fn new(
        config: CompactionConfig,
        accountant: Arc<Mutex<TokenAccountant>>,
        client: Arc<dyn ModelClient>,
    ) -> Self {
        accountant
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_context_size(config.context_size);
        Self {
            config,
            accountant,
            client,
            handler: Arc::new(NoopHandler),
            compacting: AtomicBool::new(false),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    /// Compact `store` if usage has reached the compaction threshold.
    pub async fn compact_if_needed(
        &self,
        store: &dyn ConversationStore,
    ) -> Result<CompactionOutcome> {
        self.run(store, Mode::Gated).await
    }

    /// Compact `store` regardless of usage. The message-count floor and the
    /// in-flight guard still apply.
    pub async fn force_compact(&self, store: &dyn ConversationStore) -> Result<CompactionOutcome> {
        self.run(store, Mode::Forced).await
    }

    /// Truncate `store` regardless of usage, never calling the model. The
    /// message-count floor and the in-flight guard still apply.
    pub async fn force_truncate(
        &self,
        store: &dyn ConversationStore,
    ) -> Result<CompactionOutcome> {
        self.run(store, Mode::ForcedTruncate).await
    }

    async fn run(&self, store: &dyn ConversationStore, mode: Mode) -> Result<CompactionOutcome> {
        let Some(_busy) = BusyGuard::acquire(&self.compacting) else {
            debug!("compaction already in progress, skipping");
            return Ok(CompactionOutcome::Skipped(SkipReason::InProgress));
        };

        let messages = store.messages();
        let usage = self.measure(&messages);
        let threshold = self.config.compact_threshold;

        if mode == Mode::Gated && usage < threshold {
            return Ok(CompactionOutcome::Skipped(SkipReason::BelowThreshold {
                usage_percent: usage,
                threshold,
            }));
        }
        if messages.len() < self.config.min_messages_to_attempt {
            return Ok(CompactionOutcome::Skipped(SkipReason::TooFewMessages {
                count: messages.len(),
                minimum: self.config.min_messages_to_attempt,
            }));
        }

        emit(
            self.handler.as_ref(),
            GuardEvent::CompactionStart {
                usage_percent: usage,
                threshold,
                message_count: messages.len(),
            },
        );

        let truncate_only =
            mode == Mode::ForcedTruncate || usage >= self.config.emergency_threshold;
        debug!(
            "compacting {} messages at {usage}% via {}",
            messages.len(),
            if truncate_only { "truncation" } else { "summarization" }
        );

        let mut used_fallback = false;
        let result = if truncate_only {
            self.truncate(store, &messages, usage)
        } else {
            match self.plan_summary(&messages) {
                SummaryPlan::NoOp => Ok(None),
                SummaryPlan::OverBudget => {
                    debug!("summarization request would not fit, truncating instead");
                    self.truncate(store, &messages, usage)
                }
                SummaryPlan::Request(request) => {
                    match self.summarize(store, request, usage).await {
                        Ok(applied) => Ok(Some(applied)),
                        Err(failed) => {
                            warn!(
                                "summarization failed, falling back to truncation: {}",
                                failed.error
                            );
                            used_fallback = true;
                            self.truncate(store, &messages, usage)
                        }
                    }
                }
            }
        };

        match result {
            Ok(Some(applied)) => {
                info!(
                    "compaction complete ({:?}): {usage}% -> {}%, {} -> {} messages",
                    applied.strategy,
                    applied.new_percent,
                    messages.len(),
                    applied.messages_after
                );
                self.emit_complete(
                    CompletionStatus::Success,
                    applied.strategy,
                    usage,
                    applied.new_percent,
                    applied.file_refs.references.clone(),
                    None,
                );
                Ok(CompactionOutcome::Compacted(CompactionReport {
                    strategy: applied.strategy,
                    old_percent: usage,
                    new_percent: applied.new_percent,
                    messages_before: messages.len(),
                    messages_after: applied.messages_after,
                    file_references: applied.file_refs.references,
                    used_fallback,
                }))
            }
            Ok(None) => {
                debug!("not enough history to summarize, leaving conversation unchanged");
                self.emit_complete(
                    CompletionStatus::Success,
                    CompactionStrategy::None,
                    usage,
                    usage,
                    Vec::new(),
                    None,
                );
                Ok(CompactionOutcome::Unchanged)
            }
            Err(failed) => {
                error!("compaction failed: {}", failed.error);
                self.emit_complete(
                    CompletionStatus::Error,
                    failed.strategy,
                    usage,
                    usage,
                    Vec::new(),
                    Some(failed.error.to_string()),
                );
                Err(failed.error)
            }
        }
    }

    /// Send the planned request and install the summary.
    async fn summarize(
        &self,
        store: &dyn ConversationStore,
        request: SummaryRequest,
        old_percent: u8,
    ) -> std::result::Result<Applied, Failed> {
        let SummaryRequest {
            system,
            candidates,
            live,
            file_refs,
        } = request;
        let failed = |error| Failed {
            strategy: CompactionStrategy::Summarize,
            error,
        };

        debug!("summarizing {} messages", candidates.len());
        let request = summarizer::build_request(&candidates);
        let response = self
            .client
            .send(&request, SendOptions::non_streaming())
            .await;
        if response.error {
            let reason = response
                .error_message
                .unwrap_or_else(|| "model returned an error".into());
            return Err(failed(GuardError::Summarization(reason)));
        }
        if response.content.trim().is_empty() {
            return Err(failed(GuardError::Summarization(
                "model returned an empty summary".into(),
            )));
        }

        let mut compacted = Vec::with_capacity(3);
        compacted.extend(system);
        compacted.push(summarizer::summary_message(
            &response.content,
            &file_refs,
            Utc::now(),
        ));
        compacted.extend(live);

        self.apply(store, compacted, old_percent, CompactionStrategy::Summarize, file_refs)
            .map_err(failed)
    }

    fn plan_summary(&self, messages: &[Message]) -> SummaryPlan {
        let min = self.config.min_messages_to_summarize;
        let (system, rest) = match messages.split_first() {
            Some((first, rest)) if first.role == MessageRole::System => (Some(first.clone()), rest),
            _ => (None, messages),
        };

        let mut candidates: Vec<Message> =
            rest.iter().filter(|m| !m.is_ephemeral()).cloned().collect();
        if candidates.len() < min {
            return SummaryPlan::NoOp;
        }
        let live = candidates
            .iter()
            .rposition(|m| m.role == MessageRole::User)
            .map(|idx| candidates.remove(idx));
        if candidates.len() < min {
            return SummaryPlan::NoOp;
        }

        let acc = self.accountant.lock().unwrap_or_else(|e| e.into_inner());
        let allowance =
            self.config.context_size * self.config.summary_budget_percent as usize / 100;
        let overhead = summarizer::fixed_overhead(&acc);
        let budget = match allowance.checked_sub(overhead) {
            Some(b) if b >= MIN_SUMMARY_BUDGET => b,
            _ => return SummaryPlan::OverBudget,
        };

        let total: usize = candidates.iter().map(|m| acc.cost_of(m)).sum();
        if total > budget {
            candidates = summarizer::trim_to_budget(&acc, candidates, budget, min);
            debug!("trimmed summarization input to {} messages", candidates.len());
        }
        drop(acc);
        summarizer::strip_leading_orphans(&mut candidates, min);

        let file_refs = extract_file_references(&candidates, self.config.max_file_references);
        SummaryPlan::Request(SummaryRequest {
            system,
            candidates,
            live,
            file_refs,
        })
    }

    fn truncate(
        &self,
        store: &dyn ConversationStore,
        messages: &[Message],
        old_percent: u8,
    ) -> std::result::Result<Option<Applied>, Failed> {
        let failed = |error| Failed {
            strategy: CompactionStrategy::Truncate,
            error,
        };
        let truncated = {
            let acc = self.accountant.lock().unwrap_or_else(|e| e.into_inner());
            truncation::truncate(&acc, messages, &self.config).map_err(failed)?
        };
        debug!("truncation dropped {} messages", truncated.dropped);
        self.apply(
            store,
            truncated.messages,
            old_percent,
            CompactionStrategy::Truncate,
            truncated.file_refs,
        )
        .map(Some)
        .map_err(failed)
    }

    /// Replace the store's messages, then check that usage actually fell
    /// below the threshold.
    fn apply(
        &self,
        store: &dyn ConversationStore,
        compacted: Vec<Message>,
        old_percent: u8,
        strategy: CompactionStrategy,
        file_refs: FileReferences,
    ) -> Result<Applied> {
        let new_percent = self.measure(&compacted);
        let messages_after = compacted.len();
        store.set_messages(compacted);

        if new_percent >= self.config.compact_threshold {
            return Err(GuardError::CompactionIneffective {
                old_percent,
                new_percent,
                context_size: self.config.context_size,
            });
        }
        Ok(Applied {
            strategy,
            new_percent,
            messages_after,
            file_refs,
        })
    }

    fn measure(&self, messages: &[Message]) -> u8 {
        let mut acc = self.accountant.lock().unwrap_or_else(|e| e.into_inner());
        acc.total_cost(messages);
        acc.usage_percent()
    }

    fn emit_complete(
        &self,
        status: CompletionStatus,
        strategy: CompactionStrategy,
        old_percent: u8,
        new_percent: u8,
        file_references: Vec<String>,
        error: Option<String>,
    ) {
        emit(
            self.handler.as_ref(),
            GuardEvent::CompactionComplete {
                status,
                strategy,
                old_percent,
                new_percent,
                threshold: self.config.compact_threshold,
                file_references,
                error,
            },
        );
    }
}
