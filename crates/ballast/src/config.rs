//! Configuration for the guardrail components.
//!
//! Every section has defaults tuned for a 200k-token coding agent, builder
//! methods for the common overrides, and `#[serde(default)]` deserialization
//! so a partial JSON file only overrides what it names.
//!
//! # Examples
//!
//! ```ignore
//! let config = GuardConfig::default()
//!     .with_context_size(32_000)
//!     .with_compact_threshold(90)
//!     .with_cycle_threshold(4);
//! config.validate()?;
//! ```
//!
//! Loading from disk:
//!
//! ```ignore
//! let config = GuardConfig::from_json_file("ballast.json")?;
//! ```

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Compaction ────────────────────────────────────────────────────

/// Settings for [`ContextCompactor`](crate::context::ContextCompactor) and
/// the [`TokenAccountant`](crate::context::TokenAccountant) budget it reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Maximum context window in tokens.
    pub context_size: usize,
    /// Usage percentage at which compaction starts.
    pub compact_threshold: u8,
    /// Usage percentage at which summarization is skipped in favor of
    /// truncation.
    pub emergency_threshold: u8,
    /// Share of the context the summarization request may occupy.
    pub summary_budget_percent: u8,
    /// Share of the context emergency truncation aims for.
    pub truncation_target_percent: u8,
    /// Conversations shorter than this are never compacted.
    pub min_messages_to_attempt: usize,
    /// Summarizing fewer messages than this is a no-op.
    pub min_messages_to_summarize: usize,
    /// Cap on file references carried through compaction.
    pub max_file_references: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_size: 200_000,
            compact_threshold: 95,
            emergency_threshold: 98,
            summary_budget_percent: 70,
            truncation_target_percent: 50,
            min_messages_to_attempt: 3,
            min_messages_to_summarize: 2,
            max_file_references: 15,
        }
    }
}

// ── Tool cycles ───────────────────────────────────────────────────

/// Settings for [`ToolCycleDetector`](crate::loops::ToolCycleDetector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Occurrences of one signature that count as a cycle.
    pub cycle_threshold: usize,
    /// Capacity of the bounded signature history.
    pub max_tool_history: usize,
    /// Consecutive empty search results that flag an empty streak.
    pub empty_streak_threshold: usize,
    /// Hit ratio below which search quality counts as degraded.
    pub low_hit_rate_floor: f64,
    /// Searches required before the hit ratio is judged at all.
    pub min_searches_for_hit_rate: usize,
    /// Parameter overlap at or above which two calls count as similar.
    pub similarity_floor: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            cycle_threshold: 3,
            max_tool_history: 15,
            empty_streak_threshold: 3,
            low_hit_rate_floor: 0.30,
            min_searches_for_hit_rate: 5,
            similarity_floor: 0.60,
        }
    }
}

// ── Text loops ────────────────────────────────────────────────────

/// Settings for [`TextLoopDetector`](crate::loops::TextLoopDetector) and its
/// built-in patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextLoopConfig {
    /// Time after the first chunk before the first check runs.
    pub warmup_period_ms: u64,
    /// Time between checks after warmup.
    pub check_interval_ms: u64,
    /// Reconsideration keywords needed to flag a reconstruction cycle.
    pub reconstruction_min: usize,
    /// Similar questions or intent statements needed to flag repetition.
    pub repetition_min: usize,
    /// Token overlap at which two sentences count as the same.
    pub overlap_floor: f64,
    /// Sentences shorter than this (in chars) are ignored by the
    /// repetition patterns.
    pub min_sentence_chars: usize,
}

impl Default for TextLoopConfig {
    fn default() -> Self {
        Self {
            warmup_period_ms: 20_000,
            check_interval_ms: 5_000,
            reconstruction_min: 2,
            repetition_min: 3,
            overlap_floor: 0.70,
            min_sentence_chars: 15,
        }
    }
}

impl TextLoopConfig {
    pub fn warmup_period(&self) -> Duration {
        Duration::from_millis(self.warmup_period_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

// ── Aggregate ─────────────────────────────────────────────────────

/// All guardrail settings in one place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub compaction: CompactionConfig,
    pub cycles: CycleConfig,
    pub text_loops: TextLoopConfig,
}

impl GuardConfig {
    /// Override the context window size (in tokens).
    pub fn with_context_size(mut self, tokens: usize) -> Self {
        self.compaction.context_size = tokens;
        self
    }

    /// Set the usage percentage that triggers compaction.
    pub fn with_compact_threshold(mut self, percent: u8) -> Self {
        self.compaction.compact_threshold = percent;
        self
    }

    /// Set the usage percentage that forces truncation instead of summarization.
    pub fn with_emergency_threshold(mut self, percent: u8) -> Self {
        self.compaction.emergency_threshold = percent;
        self
    }

    /// Set the repeat count that counts as a tool cycle.
    pub fn with_cycle_threshold(mut self, threshold: usize) -> Self {
        self.cycles.cycle_threshold = threshold;
        self
    }

    /// Set the bounded tool history capacity.
    pub fn with_max_tool_history(mut self, capacity: usize) -> Self {
        self.cycles.max_tool_history = capacity;
        self
    }

    /// Set the text-loop warmup period.
    pub fn with_warmup_period(mut self, period: Duration) -> Self {
        self.text_loops.warmup_period_ms = period.as_millis() as u64;
        self
    }

    /// Set the text-loop check interval.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.text_loops.check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Reject settings the components cannot operate under.
    pub fn validate(&self) -> Result<()> {
        let c = &self.compaction;
        if c.context_size == 0 {
            return Err(GuardError::Config("context_size must be positive".into()));
        }
        for (name, value) in [
            ("compact_threshold", c.compact_threshold),
            ("emergency_threshold", c.emergency_threshold),
            ("summary_budget_percent", c.summary_budget_percent),
            ("truncation_target_percent", c.truncation_target_percent),
        ] {
            if value == 0 || value > 100 {
                return Err(GuardError::Config(format!(
                    "{name} must be within 1..=100, got {value}"
                )));
            }
        }
        if c.compact_threshold > c.emergency_threshold {
            return Err(GuardError::Config(format!(
                "compact_threshold ({}) must not exceed emergency_threshold ({})",
                c.compact_threshold, c.emergency_threshold
            )));
        }

        let cy = &self.cycles;
        if cy.cycle_threshold < 2 {
            return Err(GuardError::Config(format!(
                "cycle_threshold must be at least 2, got {}",
                cy.cycle_threshold
            )));
        }
        if cy.max_tool_history < cy.cycle_threshold {
            return Err(GuardError::Config(format!(
                "max_tool_history ({}) must be at least cycle_threshold ({})",
                cy.max_tool_history, cy.cycle_threshold
            )));
        }
        for (name, value) in [
            ("low_hit_rate_floor", cy.low_hit_rate_floor),
            ("similarity_floor", cy.similarity_floor),
            ("overlap_floor", self.text_loops.overlap_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GuardError::Config(format!(
                    "{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }

        if self.text_loops.check_interval_ms == 0 {
            return Err(GuardError::Config("check_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Load a JSON config file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GuardError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: GuardConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = GuardConfig::default();
        assert_eq!(config.compaction.compact_threshold, 95);
        assert_eq!(config.compaction.emergency_threshold, 98);
        assert_eq!(config.cycles.cycle_threshold, 3);
        assert_eq!(config.cycles.max_tool_history, 15);
        assert_eq!(config.text_loops.warmup_period(), Duration::from_secs(20));
        assert_eq!(config.text_loops.check_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = GuardConfig::default()
            .with_context_size(1000)
            .with_compact_threshold(80)
            .with_emergency_threshold(90)
            .with_cycle_threshold(4)
            .with_warmup_period(Duration::from_millis(100));
        assert_eq!(config.compaction.context_size, 1000);
        assert_eq!(config.compaction.compact_threshold, 80);
        assert_eq!(config.cycles.cycle_threshold, 4);
        assert_eq!(config.text_loops.warmup_period_ms, 100);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = GuardConfig::default()
            .with_compact_threshold(99)
            .with_emergency_threshold(90);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn rejects_history_smaller_than_threshold() {
        let config = GuardConfig::default()
            .with_cycle_threshold(5)
            .with_max_tool_history(4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_context() {
        assert!(GuardConfig::default().with_context_size(0).validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"compaction": {{"context_size": 8000}}, "cycles": {{"cycle_threshold": 4}}}}"#
        )
        .unwrap();

        let config = GuardConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.compaction.context_size, 8000);
        assert_eq!(config.compaction.compact_threshold, 95);
        assert_eq!(config.cycles.cycle_threshold, 4);
        assert_eq!(config.text_loops.check_interval_ms, 5000);
    }

    #[test]
    fn invalid_file_contents_fail_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cycles": {{"cycle_threshold": 1}}}}"#).unwrap();
        assert!(GuardConfig::from_json_file(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = GuardConfig::from_json_file("/nonexistent/ballast.json").unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
    }
}
