//! Summarization request assembly for context compaction.
//!
//! The summarization call is a one-shot, non-streaming request shaped as
//! `[instructions, ...history, final request]`. The history goes in as real
//! messages rather than a flattened transcript so the model sees tool calls
//! and their results exactly as they happened.

use super::accountant::TokenAccountant;
use super::file_refs::FileReferences;
use crate::{Message, MessageMetadata, MessageRole};
use chrono::{DateTime, Utc};

/// System instructions for the summarization call.
pub const SUMMARIZATION_PROMPT: &str = "\
You are compacting the history of a coding agent's conversation so the agent \
can continue working with a smaller context. Summarize the messages that follow. \
Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths and function names mentioned
- Current plan state and what remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise. The summary replaces the history entirely.";

/// Trailing instruction appended after the history.
pub const SUMMARY_REQUEST: &str =
    "Summarize the conversation above now. Reply with the summary only, no preamble.";

/// Structural tokens the request costs beyond its messages.
pub const STRUCTURAL_OVERHEAD: usize = 12;

/// Header placed above the summary text in the compacted history.
const SUMMARY_HEADER: &str = "[Summary of earlier conversation]";

/// Token cost of the parts of a summarization request that do not depend on
/// which messages get summarized.
pub fn fixed_overhead(accountant: &TokenAccountant) -> usize {
    accountant.cost_of(&Message::system(SUMMARIZATION_PROMPT))
        + accountant.cost_of(&Message::user(SUMMARY_REQUEST))
        + STRUCTURAL_OVERHEAD
}

/// Keep the newest contiguous run of `candidates` that fits `budget`, but
/// never fewer than `min_keep` messages.
///
/// Walks backward from the newest candidate and stops at the first message
/// that would overflow the budget, so the kept span has no gaps.
pub fn trim_to_budget(
    accountant: &TokenAccountant,
    candidates: Vec<Message>,
    budget: usize,
    min_keep: usize,
) -> Vec<Message> {
    let mut spent = 0;
    let mut keep = 0;
    for msg in candidates.iter().rev() {
        let cost = accountant.cost_of(msg);
        if spent + cost > budget && keep >= min_keep {
            break;
        }
        spent += cost;
        keep += 1;
    }
    let start = candidates.len() - keep;
    candidates.into_iter().skip(start).collect()
}

/// Build the full message list for the summarization call.
pub fn build_request(candidates: &[Message]) -> Vec<Message> {
    let mut request = Vec::with_capacity(candidates.len() + 2);
    request.push(Message::system(SUMMARIZATION_PROMPT));
    request.extend(candidates.iter().cloned());
    request.push(Message::user(SUMMARY_REQUEST));
    request
}

/// The system message that replaces the summarized history.
pub fn summary_message(summary: &str, refs: &FileReferences, now: DateTime<Utc>) -> Message {
    let mut content = format!("{SUMMARY_HEADER}\n\n{}", summary.trim());
    if !refs.is_empty() {
        content.push_str("\n\nFiles referenced: ");
        content.push_str(&refs.references.join(", "));
    }
    Message::system(content).stamped().with_metadata(MessageMetadata {
        is_conversation_summary: true,
        context_file_references: refs.references.clone(),
        context_file_sources: (!refs.sources.is_empty()).then(|| refs.sources.clone()),
        context_compaction_timestamp: Some(now),
        ..Default::default()
    })
}

/// Drop leading tool results whose assistant call is no longer in the list,
/// stopping before the list would shrink below `min_keep`.
pub fn strip_leading_orphans(messages: &mut Vec<Message>, min_keep: usize) {
    let orphans = messages
        .iter()
        .take_while(|m| m.role == MessageRole::Tool)
        .count()
        .min(messages.len().saturating_sub(min_keep));
    if orphans > 0 {
        messages.drain(..orphans);
    }
}
