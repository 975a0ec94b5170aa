//! Heuristics that recognize a model talking in circles.
//!
//! A [`LoopPattern`] inspects the full accumulated text of a stream and
//! either matches or not. Patterns run in priority order (lowest first) and
//! the first match wins. A pattern that errors or panics is skipped for that
//! check only.
//!
//! Built-ins, all case-insensitive:
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `reconstruction_cycle` | two or more phrases like "reconsider", "rethink", "go back to" |
//! | `repeated_questions` | three or more near-identical questions |
//! | `repeated_actions` | three or more near-identical "I will / Let me ..." statements |

use crate::config::TextLoopConfig;
use crate::error::Result;
use regex::Regex;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;
use tracing::warn;

static RECONSIDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(reconsider\w*|rethink\w*|re-think\w*|revisit\w*|re-?evaluat\w*|go(?:ing)? back to|start(?:ing)? over|on second thought|scratch that)",
    )
    .expect("failed to compile reconsideration regex")
});

/// Openers of a declarative intent statement.
const INTENT_MARKERS: &[&str] = &[
    "i will ",
    "i'll ",
    "i should ",
    "let me ",
    "i need to ",
    "i'm going to ",
    "i am going to ",
    "now i will ",
    "next, i ",
];

/// A pattern hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub reason: String,
    pub match_count: usize,
}

/// What the detector reports when a loop is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDetection {
    pub reason: String,
    pub pattern_name: String,
    pub match_count: usize,
}

/// A loop heuristic over accumulated text.
pub trait LoopPattern: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> u32 {
        100
    }

    fn evaluate(&self, text: &str) -> Result<Option<PatternMatch>>;
}

/// Run `patterns` in slice order and return the first match.
///
/// Errors and panics inside a pattern are logged and treated as "no match".
pub fn evaluate_patterns(patterns: &[Box<dyn LoopPattern>], text: &str) -> Option<LoopDetection> {
    for pattern in patterns {
        match catch_unwind(AssertUnwindSafe(|| pattern.evaluate(text))) {
            Ok(Ok(Some(m))) => {
                return Some(LoopDetection {
                    reason: m.reason,
                    pattern_name: pattern.name().to_string(),
                    match_count: m.match_count,
                });
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("loop pattern {} failed: {e}", pattern.name()),
            Err(_) => warn!("loop pattern {} panicked", pattern.name()),
        }
    }
    None
}

/// The three built-in patterns, in priority order.
pub fn builtin_patterns(config: &TextLoopConfig) -> Vec<Box<dyn LoopPattern>> {
    vec![
        Box::new(ReconstructionCycle {
            min_occurrences: config.reconstruction_min,
        }),
        Box::new(RepeatedQuestions {
            min_repeats: config.repetition_min,
            overlap_floor: config.overlap_floor,
            min_chars: config.min_sentence_chars,
        }),
        Box::new(RepeatedActions {
            min_repeats: config.repetition_min,
            overlap_floor: config.overlap_floor,
            min_chars: config.min_sentence_chars,
        }),
    ]
}

// ── Built-ins ──────────────────────────────────────────────────────

/// The model keeps announcing that it will reconsider its approach.
pub struct ReconstructionCycle {
    pub min_occurrences: usize,
}

impl LoopPattern for ReconstructionCycle {
    fn name(&self) -> &str {
        "reconstruction_cycle"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn evaluate(&self, text: &str) -> Result<Option<PatternMatch>> {
        let count = RECONSIDER_RE.find_iter(text).count();
        Ok((count >= self.min_occurrences).then(|| PatternMatch {
            reason: format!("reconsidered its approach {count} times without settling"),
            match_count: count,
        }))
    }
}

/// The model keeps asking itself the same question.
pub struct RepeatedQuestions {
    pub min_repeats: usize,
    pub overlap_floor: f64,
    pub min_chars: usize,
}

impl LoopPattern for RepeatedQuestions {
    fn name(&self) -> &str {
        "repeated_questions"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn evaluate(&self, text: &str) -> Result<Option<PatternMatch>> {
        let questions: Vec<&str> = sentences(text)
            .into_iter()
            .filter(|s| s.ends_with('?') && s.chars().count() >= self.min_chars)
            .collect();
        let count = largest_cluster(&questions, self.overlap_floor);
        Ok((count >= self.min_repeats).then(|| PatternMatch {
            reason: format!("asked essentially the same question {count} times"),
            match_count: count,
        }))
    }
}

/// The model keeps announcing the same next step.
pub struct RepeatedActions {
    pub min_repeats: usize,
    pub overlap_floor: f64,
    pub min_chars: usize,
}

impl LoopPattern for RepeatedActions {
    fn name(&self) -> &str {
        "repeated_actions"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn evaluate(&self, text: &str) -> Result<Option<PatternMatch>> {
        let statements: Vec<&str> = sentences(text)
            .into_iter()
            .filter(|s| !s.ends_with('?') && s.chars().count() >= self.min_chars)
            .filter(|s| {
                let lower = s.to_lowercase();
                INTENT_MARKERS.iter().any(|m| lower.starts_with(m))
            })
            .collect();
        let count = largest_cluster(&statements, self.overlap_floor);
        Ok((count >= self.min_repeats).then(|| PatternMatch {
            reason: format!("announced the same action {count} times without doing it"),
            match_count: count,
        }))
    }
}

// ── Text helpers ───────────────────────────────────────────────────

/// Split on `.`, `!`, `?`, and newlines, keeping the terminator.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            if let Some(s) = text.get(start..end) {
                let s = s.trim();
                if !s.is_empty() {
                    out.push(s);
                }
            }
            start = end;
        }
    }
    if let Some(rest) = text.get(start..).map(str::trim)
        && !rest.is_empty()
    {
        out.push(rest);
    }
    out
}

fn tokens(sentence: &str) -> HashSet<String> {
    sentence
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Shared tokens over the larger token set.
fn overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let larger = a.len().max(b.len());
    if larger == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / larger as f64
}

/// Size of the largest group of sentences that all overlap one member by at
/// least `floor` (the member itself included).
fn largest_cluster(sentences: &[&str], floor: f64) -> usize {
    let token_sets: Vec<HashSet<String>> = sentences.iter().map(|s| tokens(s)).collect();
    token_sets
        .iter()
        .map(|anchor| {
            token_sets
                .iter()
                .filter(|other| overlap(anchor, other) >= floor)
                .count()
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardError;

    fn detect(text: &str) -> Option<LoopDetection> {
        evaluate_patterns(&builtin_patterns(&TextLoopConfig::default()), text)
    }

    #[test]
    fn reconstruction_needs_two_keywords() {
        assert!(detect("Let me reconsider this.").is_none());
        let hit = detect("Let me reconsider this. Let me reconsider again.").unwrap();
        assert_eq!(hit.pattern_name, "reconstruction_cycle");
        assert_eq!(hit.match_count, 2);
    }

    #[test]
    fn reconstruction_is_case_insensitive_and_mixed() {
        let hit = detect("RETHINKING the parser. Maybe I should go back to the lexer.").unwrap();
        assert_eq!(hit.pattern_name, "reconstruction_cycle");
    }

    #[test]
    fn repeated_questions_match() {
        let text = "What does the parser return here? Hmm. \
                    What does the parser return here now? \
                    What does the parser return here exactly?";
        let hit = detect(text).unwrap();
        assert_eq!(hit.pattern_name, "repeated_questions");
        assert_eq!(hit.match_count, 3);
    }

    #[test]
    fn short_questions_are_ignored() {
        assert!(detect("Why? Why? Why? Why?").is_none());
    }

    #[test]
    fn distinct_questions_do_not_match() {
        let text = "What does the parser return here? Where is the lexer defined? \
                    Which tests cover the tokenizer?";
        assert!(detect(text).is_none());
    }

    #[test]
    fn repeated_actions_match() {
        let text = "I will update the config loader now. Checking. \
                    I will update the config loader next. \
                    Let me update the config loader now.";
        let hit = detect(text).unwrap();
        assert_eq!(hit.pattern_name, "repeated_actions");
        assert_eq!(hit.match_count, 3);
    }

    #[test]
    fn statements_without_intent_marker_are_ignored() {
        let text = "The config loader is updated now. The config loader is updated now. \
                    The config loader is updated now.";
        assert!(detect(text).is_none());
    }

    #[test]
    fn sentence_split_keeps_terminators() {
        assert_eq!(
            sentences("One. Two?\nThree! tail"),
            vec!["One.", "Two?", "Three!", "tail"]
        );
    }

    struct Failing;
    impl LoopPattern for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn evaluate(&self, _: &str) -> Result<Option<PatternMatch>> {
            Err(GuardError::Pattern {
                pattern: "failing".into(),
                message: "bad state".into(),
            })
        }
    }

    struct Panicking;
    impl LoopPattern for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }
        fn evaluate(&self, _: &str) -> Result<Option<PatternMatch>> {
            panic!("pattern bug")
        }
    }

    #[test]
    fn faulty_patterns_are_skipped() {
        let mut patterns: Vec<Box<dyn LoopPattern>> = vec![Box::new(Failing), Box::new(Panicking)];
        patterns.extend(builtin_patterns(&TextLoopConfig::default()));
        let hit =
            evaluate_patterns(&patterns, "I must rethink. Then rethink again.").unwrap();
        assert_eq!(hit.pattern_name, "reconstruction_cycle");
    }

    #[test]
    fn first_match_wins() {
        let text = "Let me reconsider. Let me reconsider. \
                    What does the parser return here? What does the parser return here? \
                    What does the parser return here?";
        assert_eq!(detect(text).unwrap().pattern_name, "reconstruction_cycle");
    }
}
