//! Emergency truncation: drop the oldest history without a model call.
//!
//! Used when usage is too close to the window for a summarization request to
//! fit, and as the fallback when summarization fails. Keeps the leading system
//! message, then as many of the newest messages as fit in the truncation
//! target, and records what was dropped in a synthetic notice.

use super::accountant::TokenAccountant;
use super::file_refs::{FileReferences, extract_file_references};
use super::summarizer::strip_leading_orphans;
use crate::config::CompactionConfig;
use crate::error::{GuardError, Result};
use crate::{Message, MessageMetadata, MessageRole};
use chrono::Utc;
use tracing::debug;

/// Result of a truncation pass.
#[derive(Debug, Clone)]
pub struct Truncation {
    /// The new message list, notice included.
    pub messages: Vec<Message>,
    /// Number of non-ephemeral messages dropped.
    pub dropped: usize,
    /// File references extracted from the dropped messages.
    pub file_refs: FileReferences,
}

/// Truncate `messages` to fit the configured target share of the window.
///
/// Fails with [`GuardError::ContextTooSmall`] when the system message alone
/// meets the target.
pub fn truncate(
    accountant: &TokenAccountant,
    messages: &[Message],
    config: &CompactionConfig,
) -> Result<Truncation> {
    let (system, rest) = match messages.split_first() {
        Some((first, rest)) if first.role == MessageRole::System => (Some(first), rest),
        _ => (None, messages),
    };

    let target = config.context_size * config.truncation_target_percent as usize / 100;
    let system_cost = system.map_or(0, |m| accountant.cost_of(m));
    if system_cost >= target {
        return Err(GuardError::ContextTooSmall {
            context_size: config.context_size,
            required: minimum_context_for(system_cost, config.truncation_target_percent),
        });
    }
    let budget = target - system_cost;

    let durable: Vec<&Message> = rest.iter().filter(|m| !m.is_ephemeral()).collect();
    let mut spent = 0;
    let mut keep = 0;
    for msg in durable.iter().rev() {
        let cost = accountant.cost_of(msg);
        if spent + cost > budget && keep >= 1 {
            break;
        }
        spent += cost;
        keep += 1;
    }
    let split = durable.len() - keep;
    let mut kept: Vec<Message> = durable[split..].iter().map(|m| (*m).clone()).collect();
    let before_strip = kept.len();
    strip_leading_orphans(&mut kept, 1);

    let dropped_msgs: Vec<Message> = durable[..split].iter().map(|m| (*m).clone()).collect();
    let file_refs = extract_file_references(&dropped_msgs, config.max_file_references);
    let dropped = split + (before_strip - kept.len());
    debug!(
        "truncation: keeping {} of {} messages ({spent} tokens, budget {budget})",
        kept.len(),
        durable.len()
    );

    let mut out = Vec::with_capacity(kept.len() + 2);
    if let Some(sys) = system {
        out.push(sys.clone());
    }
    out.push(truncation_notice(dropped, &file_refs));
    out.extend(kept);

    Ok(Truncation {
        messages: out,
        dropped,
        file_refs,
    })
}

/// Smallest window whose truncation target exceeds `system_cost`.
fn minimum_context_for(system_cost: usize, target_percent: u8) -> usize {
    let percent = target_percent.max(1) as usize;
    ((system_cost + 1) * 100).div_ceil(percent)
}

fn truncation_notice(dropped: usize, refs: &FileReferences) -> Message {
    let noun = if dropped == 1 { "message" } else { "messages" };
    let mut content = format!(
        "[Context truncated: {dropped} earlier {noun} removed to stay within the context window.]"
    );
    if !refs.is_empty() {
        content.push_str("\nFiles referenced in the removed messages: ");
        content.push_str(&refs.references.join(", "));
    }
    Message::system(content).stamped().with_metadata(MessageMetadata {
        is_truncation_notice: true,
        context_file_references: refs.references.clone(),
        context_file_sources: (!refs.sources.is_empty()).then(|| refs.sources.clone()),
        context_compaction_timestamp: Some(Utc::now()),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::context::Tokenizer;
    use serde_json::json;
    use std::sync::Arc;

    /// One token per char.
    fn accountant() -> TokenAccountant {
        let chars: Arc<dyn Tokenizer> = Arc::new(|t: &str| t.chars().count());
        TokenAccountant::new(chars, 1000)
    }

    fn config(context_size: usize) -> CompactionConfig {
        CompactionConfig {
            context_size,
            ..Default::default()
        }
    }

    /// A user message costing exactly `tokens` under the char tokenizer.
    fn sized(tokens: usize) -> Message {
        Message::user("x".repeat(tokens - 4))
    }

    #[test]
    fn keeps_newest_within_half_the_window() {
        let acc = accountant();
        let mut messages = vec![Message::system("sys")]; // 7 tokens
        messages.extend((0..10).map(|_| sized(100)));

        let result = truncate(&acc, &messages, &config(1000)).unwrap();
        // target 500, minus system 7 = 493 -> four 100-token messages fit.
        assert_eq!(result.dropped, 6);
        assert_eq!(result.messages.len(), 1 + 1 + 4);
        assert_eq!(result.messages[0].text(), "sys");
        let notice = result.messages[1].metadata.as_ref().unwrap();
        assert!(notice.is_truncation_notice);
        assert!(result.messages[1].text().contains("6 earlier messages"));
    }

    #[test]
    fn always_keeps_at_least_one_message() {
        let acc = accountant();
        let messages = vec![Message::system("sys"), sized(900)];
        let result = truncate(&acc, &messages, &config(1000)).unwrap();
        assert_eq!(result.dropped, 0);
        assert_eq!(result.messages.len(), 3);
    }

    #[test]
    fn oversized_system_prompt_is_fatal() {
        let acc = accountant();
        let messages = vec![Message::system("s".repeat(600)), Message::user("hi")];
        let err = truncate(&acc, &messages, &config(1000)).unwrap_err();
        match err {
            GuardError::ContextTooSmall {
                context_size,
                required,
            } => {
                assert_eq!(context_size, 1000);
                // system costs 604; the window must be at least 1210 for a 50% target of 605.
                assert_eq!(required, 1210);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ephemeral_messages_are_dropped() {
        let acc = accountant();
        let messages = vec![
            Message::system("sys"),
            Message::user("keep me"),
            Message::user("transient").ephemeral(),
        ];
        let result = truncate(&acc, &messages, &config(1000)).unwrap();
        assert!(result.messages.iter().all(|m| !m.is_ephemeral()));
        assert_eq!(result.messages.last().unwrap().text(), "keep me");
    }

    #[test]
    fn works_without_system_message() {
        let acc = accountant();
        let messages: Vec<Message> = (0..10).map(|_| sized(100)).collect();
        let result = truncate(&acc, &messages, &config(1000)).unwrap();
        assert_eq!(result.messages[0].role, MessageRole::System);
        assert_eq!(result.messages.len(), 1 + 5);
    }

    #[test]
    fn notice_carries_refs_from_dropped_messages() {
        let acc = accountant();
        let edit = ToolCall::from_value("c1", "edit", &json!({"file_path": "src/old.rs"}));
        let mut messages = vec![
            Message::system("sys"),
            Message::assistant_tool_calls(vec![edit]),
            Message::tool_result("c1", "ok"),
        ];
        messages.extend((0..6).map(|_| sized(100)));

        let result = truncate(&acc, &messages, &config(1000)).unwrap();
        assert_eq!(result.file_refs.references, vec!["src/old.rs"]);
        let meta = result.messages[1].metadata.as_ref().unwrap();
        assert_eq!(meta.context_file_references, vec!["src/old.rs"]);
    }

    #[test]
    fn orphaned_tool_result_is_not_kept_first() {
        let acc = accountant();
        let call = ToolCall::from_value("c1", "grep", &json!({"pattern": "x"}));
        let messages = vec![
            Message::system("sys"),
            Message::assistant_tool_calls(vec![call]).with_name("a".repeat(400)),
            Message::tool_result("c1", "r".repeat(200)),
            Message::user("latest"),
        ];
        let result = truncate(&acc, &messages, &config(1000)).unwrap();
        assert!(result.messages[2..].iter().all(|m| m.role != MessageRole::Tool));
        assert_eq!(result.dropped, 2);
    }
}
