//! Tool-call cycle detection.
//!
//! [`ToolCycleDetector`] keeps a bounded history of call signatures and, for
//! each call in a batch, reports whether it repeats recent work:
//!
//! | Kind | Fires when |
//! |------|------------|
//! | `exact_duplicate` | the signature occurs `cycle_threshold` times in the history |
//! | `empty_streak` | a search call follows `empty_streak_threshold` empty searches in a row |
//! | `low_hit_rate` | a search call is made while fewer than 30% of searches found anything |
//! | `similar_calls` | the call shares most arguments with recent calls to the same tool |
//!
//! At most one flag is reported per call, in the priority order of the table.
//!
//! The host records a batch and then detects on it:
//!
//! ```ignore
//! detector.record(&calls, &outcomes);
//! for (call_id, info) in detector.detect(&calls) {
//!     conversation.push(Message::user(steering_message(&info)).ephemeral());
//! }
//! ```

use super::history::RingBuffer;
use super::signature::{parameter_overlap, parse_arguments, signature};
use crate::config::CycleConfig;
use crate::events::{EventHandler, GuardEvent, NoopHandler, emit};
use crate::{Message, MessageRole, ToolCall};
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Tools whose results are judged for hits and misses.
pub const SEARCH_TOOLS: &[&str] = &["grep", "glob", "search", "find", "ripgrep", "file_search"];

/// Search output that reports nothing found.
static NO_MATCHES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(no (matches|results|files?)( found)?|0 (matches|results|files)|found 0\b|nothing found)",
    )
    .expect("failed to compile no-matches regex")
});

pub fn is_search_tool(name: &str) -> bool {
    SEARCH_TOOLS.contains(&name.to_ascii_lowercase().as_str())
}

/// Which kind of repetition a call was flagged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    ExactDuplicate,
    EmptyStreak,
    LowHitRate,
    SimilarCalls,
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleKind::ExactDuplicate => write!(f, "exact_duplicate"),
            CycleKind::EmptyStreak => write!(f, "empty_streak"),
            CycleKind::LowHitRate => write!(f, "low_hit_rate"),
            CycleKind::SimilarCalls => write!(f, "similar_calls"),
        }
    }
}

/// A flagged call.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleInfo {
    pub kind: CycleKind,
    pub tool_name: String,
    /// Occurrences for duplicates, similar calls including this one, empty
    /// searches in a row, or total searches for a low hit rate.
    pub count: usize,
    pub signature: String,
    /// Set for `low_hit_rate`.
    pub hit_rate: Option<f64>,
}

/// The result of one tool call, as far as cycle detection cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn new(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(call_id, content)
        }
    }

    /// Outcome carried by a `tool` message, if it is one.
    pub fn from_message(msg: &Message) -> Option<Self> {
        if msg.role != MessageRole::Tool {
            return None;
        }
        msg.tool_call_id
            .as_ref()
            .map(|id| Self::new(id.clone(), msg.text()))
    }

    /// Whether a search produced at least one match.
    pub fn is_hit(&self) -> bool {
        !self.is_error && !self.content.trim().is_empty() && !NO_MATCHES_RE.is_match(&self.content)
    }
}

/// Snapshot of detector state for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleStats {
    pub history_size: usize,
    pub unique_signatures: usize,
    pub total_searches: usize,
    pub total_hits: usize,
    pub empty_streak: usize,
    /// Most frequent signature in the history and its count.
    pub most_repeated: Option<(String, usize)>,
}

#[derive(Debug, Clone)]
struct Entry {
    signature: String,
    tool_name: String,
    arguments: Value,
}

/// Bounded-history detector for repeated tool calls.
pub struct ToolCycleDetector {
    config: CycleConfig,
    history: RingBuffer<Entry>,
    consecutive_empty: usize,
    total_searches: usize,
    total_hits: usize,
    handler: Arc<dyn EventHandler>,
}

impl Default for ToolCycleDetector {
    fn default() -> Self {
        Self::new(CycleConfig::default())
    }
}

impl ToolCycleDetector {
    pub fn new(config: CycleConfig) -> Self {
        Self {
            history: RingBuffer::new(config.max_tool_history),
            config,
            consecutive_empty: 0,
            total_searches: 0,
            total_hits: 0,
            handler: Arc::new(NoopHandler),
        }
    }

    /// Emit a `cycle-detected` event for every flag [`detect`](Self::detect)
    /// returns.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Append `calls` to the history and fold any matching search results
    /// into the hit counters.
    pub fn record(&mut self, calls: &[ToolCall], results: &[ToolOutcome]) {
        let by_id: HashMap<&str, &ToolOutcome> =
            results.iter().map(|r| (r.call_id.as_str(), r)).collect();

        for call in calls {
            let arguments = parse_arguments(&call.function.arguments);
            self.history.push(Entry {
                signature: signature(call.name(), &arguments),
                tool_name: call.name().to_string(),
                arguments,
            });

            if !is_search_tool(call.name()) {
                continue;
            }
            if let Some(outcome) = by_id.get(call.id.as_str()) {
                self.total_searches += 1;
                if outcome.is_hit() {
                    self.total_hits += 1;
                    self.consecutive_empty = 0;
                } else {
                    self.consecutive_empty += 1;
                }
            }
        }
    }

    /// Flag calls that repeat recent work, keyed by call id in call order.
    pub fn detect(&self, calls: &[ToolCall]) -> IndexMap<String, CycleInfo> {
        let mut flags = IndexMap::new();
        for call in calls {
            if let Some(info) = self.check(call) {
                debug!(
                    "cycle flag on {} ({}): {} x{}",
                    info.tool_name, call.id, info.kind, info.count
                );
                emit(
                    self.handler.as_ref(),
                    GuardEvent::CycleDetected {
                        call_id: call.id.clone(),
                        tool_name: info.tool_name.clone(),
                        kind: info.kind,
                        count: info.count,
                    },
                );
                flags.insert(call.id.clone(), info);
            }
        }
        flags
    }

    fn check(&self, call: &ToolCall) -> Option<CycleInfo> {
        let arguments = parse_arguments(&call.function.arguments);
        let sig = signature(call.name(), &arguments);
        let flag = |kind, count, hit_rate| CycleInfo {
            kind,
            tool_name: call.name().to_string(),
            count,
            signature: sig.clone(),
            hit_rate,
        };

        let occurrences = self.history.iter().filter(|e| e.signature == sig).count();
        if occurrences >= self.config.cycle_threshold {
            return Some(flag(CycleKind::ExactDuplicate, occurrences, None));
        }

        if is_search_tool(call.name()) {
            if self.consecutive_empty >= self.config.empty_streak_threshold {
                return Some(flag(CycleKind::EmptyStreak, self.consecutive_empty, None));
            }
            if let Some(rate) = self.hit_rate()
                && rate < self.config.low_hit_rate_floor
            {
                return Some(flag(CycleKind::LowHitRate, self.total_searches, Some(rate)));
            }
        }

        let similar = self
            .history
            .iter()
            .filter(|e| e.tool_name == call.name() && e.signature != sig)
            .filter(|e| parameter_overlap(&e.arguments, &arguments) >= self.config.similarity_floor)
            .count();
        if similar + 1 >= self.config.cycle_threshold {
            return Some(flag(CycleKind::SimilarCalls, similar + 1, None));
        }
        None
    }

    /// Hit ratio over all searches, once enough searches have run to judge.
    fn hit_rate(&self) -> Option<f64> {
        (self.total_searches >= self.config.min_searches_for_hit_rate)
            .then(|| self.total_hits as f64 / self.total_searches as f64)
    }

    /// Clear everything if the newest `cycle_threshold` entries are all
    /// different: the agent has moved on. Returns whether it cleared.
    pub fn clear_if_broken(&mut self) -> bool {
        let n = self.config.cycle_threshold;
        if self.history.len() < n {
            return false;
        }
        let recent: Vec<&str> = self
            .history
            .newest(n)
            .map(|e| e.signature.as_str())
            .collect();
        let distinct = recent
            .iter()
            .enumerate()
            .all(|(i, sig)| !recent[i + 1..].contains(sig));
        if distinct {
            debug!("last {n} tool calls are distinct, clearing cycle history");
            self.clear();
        }
        distinct
    }

    /// Empty the history and reset the search counters.
    pub fn clear(&mut self) {
        self.history.clear();
        self.consecutive_empty = 0;
        self.total_searches = 0;
        self.total_hits = 0;
    }

    pub fn history_size(&self) -> usize {
        self.history.len()
    }

    pub fn cycle_threshold(&self) -> usize {
        self.config.cycle_threshold
    }

    pub fn stats(&self) -> CycleStats {
        let mut counts: IndexMap<&str, usize> = IndexMap::new();
        for entry in self.history.iter() {
            *counts.entry(entry.signature.as_str()).or_default() += 1;
        }
        let most_repeated = counts
            .iter()
            .rev()
            .max_by_key(|(_, count)| **count)
            .map(|(sig, count)| (sig.to_string(), *count));
        CycleStats {
            history_size: self.history.len(),
            unique_signatures: counts.len(),
            total_searches: self.total_searches,
            total_hits: self.total_hits,
            empty_streak: self.consecutive_empty,
            most_repeated,
        }
    }
}

/// A corrective reminder the host can inject after a flag.
pub fn steering_message(info: &CycleInfo) -> String {
    let tool = &info.tool_name;
    match info.kind {
        CycleKind::ExactDuplicate => format!(
            "You have called {tool} with identical arguments {} times. Repeating it will not \
             produce a different result. Use what you already have or try a different approach.",
            info.count
        ),
        CycleKind::EmptyStreak => format!(
            "Your last {} searches returned nothing. Stop searching blindly: broaden the \
             pattern, check the path, or read a file you already know about.",
            info.count
        ),
        CycleKind::LowHitRate => format!(
            "Only {:.0}% of your {} searches found anything. Step back and reconsider where \
             the code you need actually lives before searching again.",
            info.hit_rate.unwrap_or(0.0) * 100.0,
            info.count
        ),
        CycleKind::SimilarCalls => format!(
            "You have made {} nearly identical {tool} calls. Small argument tweaks are not \
             making progress; change strategy.",
            info.count
        ),
    }
}
