//! Token accounting and content-hash deduplication.
//!
//! [`TokenAccountant`] owns every piece of mutable bookkeeping the context
//! budget needs: the per-message cost cache, the running total, and two
//! content-hash indexes (file contents by path, tool results by hash).
//! Nothing here is process-global; hosts that need a fresh slate call
//! [`reset()`](TokenAccountant::reset).

use super::tokenizer::Tokenizer;
use crate::Message;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Cache size that triggers a prune pass.
pub const MAX_CACHE_SIZE: usize = 1000;

/// Upper bound on cache size after a prune pass.
pub const CACHE_CLEANUP_TARGET: usize = 500;

/// Fixed framing cost charged for every message.
const MESSAGE_OVERHEAD: usize = 4;

/// Marker appended by [`TokenAccountant::truncate_to_tokens`].
pub const TRUNCATION_MARKER: &str = "...";

/// Tracks context budget consumption for one conversation.
///
/// # Example
///
/// ```ignore
/// let mut accountant = TokenAccountant::new(Arc::new(CharRatioTokenizer::default()), 128_000);
/// accountant.total_cost(&messages);
/// if accountant.usage_percent() >= 95 {
///     // time to compact
/// }
/// ```
pub struct TokenAccountant {
    tokenizer: Arc<dyn Tokenizer>,
    context_size: usize,
    current_tokens: usize,
    /// message id -> cost, in insertion order.
    cost_cache: IndexMap<String, usize>,
    /// path -> hash of the last content seen for it.
    file_hashes: HashMap<String, String>,
    /// content hash -> first tool call id that produced it.
    result_owners: HashMap<String, String>,
}

impl std::fmt::Debug for TokenAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAccountant")
            .field("context_size", &self.context_size)
            .field("current_tokens", &self.current_tokens)
            .field("cached_costs", &self.cost_cache.len())
            .field("tracked_files", &self.file_hashes.len())
            .field("tracked_results", &self.result_owners.len())
            .finish()
    }
}

impl TokenAccountant {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, context_size: usize) -> Self {
        Self {
            tokenizer,
            context_size,
            current_tokens: 0,
            cost_cache: IndexMap::new(),
            file_hashes: HashMap::new(),
            result_owners: HashMap::new(),
        }
    }

    /// Token count of raw text, straight from the tokenizer.
    pub fn estimate(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// Cost of one message including framing, name, tool calls, and
    /// tool-call id.
    pub fn cost_of(&self, message: &Message) -> usize {
        let mut cost = MESSAGE_OVERHEAD + self.estimate(message.text());
        if let Some(ref name) = message.name {
            cost += self.estimate(name) + 1;
        }
        for call in message.calls() {
            cost += self.estimate(&call.id)
                + self.estimate(&call.function.name)
                + self.estimate(&call.function.arguments);
        }
        if let Some(ref id) = message.tool_call_id {
            cost += self.estimate(id);
        }
        cost
    }

    /// Sum of message costs. Becomes the new running total.
    ///
    /// Costs of messages with an id are cached; messages without one are
    /// recomputed every time so synthetic messages never pollute the cache.
    pub fn total_cost(&mut self, messages: &[Message]) -> usize {
        let mut total = 0;
        for msg in messages {
            total += match msg.id {
                Some(ref id) => match self.cost_cache.get(id) {
                    Some(&cached) => cached,
                    None => {
                        let cost = self.cost_of(msg);
                        self.cost_cache.insert(id.clone(), cost);
                        cost
                    }
                },
                None => self.cost_of(msg),
            };
        }

        if self.cost_cache.len() > MAX_CACHE_SIZE {
            self.prune_cache(messages);
        }

        self.current_tokens = total;
        trace!("token total: {total} across {} messages", messages.len());
        total
    }

    /// Drop cache entries for messages no longer in `messages`, then the
    /// oldest survivors until the cache is at [`CACHE_CLEANUP_TARGET`].
    fn prune_cache(&mut self, messages: &[Message]) {
        let before = self.cost_cache.len();
        let live: HashSet<&str> = messages.iter().filter_map(|m| m.id.as_deref()).collect();
        self.cost_cache.retain(|id, _| live.contains(id.as_str()));

        if self.cost_cache.len() > CACHE_CLEANUP_TARGET {
            let excess = self.cost_cache.len() - CACHE_CLEANUP_TARGET;
            self.cost_cache.drain(..excess);
        }
        debug!(
            "token cache pruned: {before} -> {} entries",
            self.cost_cache.len()
        );
    }

    /// Percentage of the context window in use, floored and capped at 100.
    ///
    /// Floor, not round: 94.6% reports as 94 so that a post-compaction check
    /// against a 95% threshold does not trip on a rounding artifact.
    pub fn usage_percent(&self) -> u8 {
        if self.context_size == 0 {
            return 100;
        }
        (self.current_tokens.saturating_mul(100) / self.context_size).min(100) as u8
    }

    /// Tokens left before the window is full.
    pub fn remaining(&self) -> usize {
        self.context_size.saturating_sub(self.current_tokens)
    }

    pub fn current_tokens(&self) -> usize {
        self.current_tokens
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn set_context_size(&mut self, tokens: usize) {
        self.context_size = tokens;
    }

    pub fn cache_len(&self) -> usize {
        self.cost_cache.len()
    }

    /// Record the content seen for `path`. Returns `true` if the path is new
    /// or its content changed since the last call.
    pub fn track_file_content(&mut self, path: &str, content: &str) -> bool {
        let hash = content_hash(content);
        match self.file_hashes.insert(path.to_string(), hash.clone()) {
            Some(previous) => previous != hash,
            None => true,
        }
    }

    /// Register a tool result by content. Returns the id of an earlier,
    /// different call that produced identical content; the first call to
    /// produce a given content stays its owner.
    pub fn track_tool_result(&mut self, call_id: &str, content: &str) -> Option<String> {
        let hash = content_hash(content);
        match self.result_owners.get(&hash) {
            Some(owner) if owner != call_id => {
                debug!("tool result {call_id} duplicates {owner}");
                Some(owner.clone())
            }
            Some(_) => None,
            None => {
                self.result_owners.insert(hash, call_id.to_string());
                None
            }
        }
    }

    /// Longest prefix of `text` that, with [`TRUNCATION_MARKER`] appended,
    /// costs at most `max_tokens`. Text that already fits is returned as is.
    pub fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> String {
        if self.estimate(text) <= max_tokens {
            return text.to_string();
        }

        // ends[k] is the byte length of the k-char prefix.
        let ends: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let with_marker = |chars: usize| {
            let mut candidate = text.get(..ends[chars]).unwrap_or_default().to_string();
            candidate.push_str(TRUNCATION_MARKER);
            candidate
        };
        let fits = |chars: usize| self.estimate(&with_marker(chars)) <= max_tokens;

        if !fits(0) {
            return String::new();
        }
        let (mut lo, mut hi) = (0, ends.len() - 1);
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            if fits(mid) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        with_marker(lo)
    }

    /// Forget every cached cost, hash, and the running total.
    pub fn reset(&mut self) {
        self.current_tokens = 0;
        self.cost_cache.clear();
        self.file_hashes.clear();
        self.result_owners.clear();
    }
}

/// 128-bit hex digest of `content`.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::context::CharRatioTokenizer;

    /// One token per whitespace-separated word.
    fn words() -> Arc<dyn Tokenizer> {
        Arc::new(|text: &str| text.split_whitespace().count())
    }

    /// One token per char.
    fn chars() -> Arc<dyn Tokenizer> {
        Arc::new(|text: &str| text.chars().count())
    }

    fn accountant(context_size: usize) -> TokenAccountant {
        TokenAccountant::new(words(), context_size)
    }

    #[test]
    fn cost_includes_framing_and_content() {
        let acc = accountant(1000);
        assert_eq!(acc.cost_of(&Message::user("one two three")), 4 + 3);
        assert_eq!(acc.cost_of(&Message::user("")), 4);
    }

    #[test]
    fn cost_includes_name_calls_and_call_id() {
        let acc = accountant(1000);
        let named = Message::user("hi there").with_name("alice");
        assert_eq!(acc.cost_of(&named), 4 + 2 + (1 + 1));

        let call = ToolCall::new("c1", "grep", r#"{"pattern": "foo bar"}"#);
        let assistant = Message::assistant_tool_calls(vec![call]);
        // id(1) + name(1) + arguments(3 words)
        assert_eq!(acc.cost_of(&assistant), 4 + 1 + 1 + 3);

        let result = Message::tool_result("c1", "found it");
        assert_eq!(acc.cost_of(&result), 4 + 2 + 1);
    }

    #[test]
    fn total_cost_sets_running_total() {
        let mut acc = accountant(1000);
        let messages = vec![Message::system("a b"), Message::user("c d e")];
        assert_eq!(acc.total_cost(&messages), 6 + 7);
        assert_eq!(acc.current_tokens(), 13);
        assert_eq!(acc.remaining(), 987);
    }

    #[test]
    fn only_messages_with_ids_are_cached() {
        let mut acc = accountant(1000);
        let messages = vec![
            Message::user("with id").with_id("m1"),
            Message::user("without id"),
        ];
        acc.total_cost(&messages);
        assert_eq!(acc.cache_len(), 1);
    }

    #[test]
    fn cached_cost_is_reused_for_same_id() {
        let mut acc = accountant(1000);
        acc.total_cost(&[Message::user("one").with_id("m1")]);
        // Same id, different content: the cached cost wins.
        let total = acc.total_cost(&[Message::user("one two three four").with_id("m1")]);
        assert_eq!(total, 5);
    }

    #[test]
    fn prune_prefers_live_entries() {
        let mut acc = accountant(1_000_000);
        let stale: Vec<Message> = (0..MAX_CACHE_SIZE)
            .map(|i| Message::user("x").with_id(format!("old-{i}")))
            .collect();
        acc.total_cost(&stale);
        assert_eq!(acc.cache_len(), MAX_CACHE_SIZE);

        let live: Vec<Message> = (0..10)
            .map(|i| Message::user("y").with_id(format!("new-{i}")))
            .collect();
        acc.total_cost(&live);
        assert_eq!(acc.cache_len(), 10);
    }

    #[test]
    fn prune_caps_at_cleanup_target_keeping_newest() {
        let mut acc = accountant(1_000_000);
        let messages: Vec<Message> = (0..MAX_CACHE_SIZE + 1)
            .map(|i| Message::user("x").with_id(format!("m{i}")))
            .collect();
        acc.total_cost(&messages);
        assert_eq!(acc.cache_len(), CACHE_CLEANUP_TARGET);
        assert!(acc.cost_cache.contains_key(&format!("m{MAX_CACHE_SIZE}")));
        assert!(!acc.cost_cache.contains_key("m0"));
    }

    #[test]
    fn cache_never_exceeds_max_after_total_cost() {
        let mut acc = accountant(1_000_000);
        for round in 0..5 {
            let batch: Vec<Message> = (0..400)
                .map(|i| Message::user("z").with_id(format!("r{round}-{i}")))
                .collect();
            acc.total_cost(&batch);
            assert!(acc.cache_len() <= MAX_CACHE_SIZE);
        }
    }

    #[test]
    fn usage_percent_floors() {
        let mut acc = TokenAccountant::new(chars(), 1000);
        // 4 framing + 942 chars = 946 tokens -> 94.6%
        acc.total_cost(&[Message::user("a".repeat(942))]);
        assert_eq!(acc.current_tokens(), 946);
        assert_eq!(acc.usage_percent(), 94);
    }

    #[test]
    fn usage_percent_caps_at_100() {
        let mut acc = TokenAccountant::new(chars(), 10);
        acc.total_cost(&[Message::user("a".repeat(500))]);
        assert_eq!(acc.usage_percent(), 100);
        assert_eq!(acc.remaining(), 0);
    }

    #[test]
    fn usage_percent_is_monotonic() {
        let mut acc = TokenAccountant::new(chars(), 1000);
        let mut last = 0;
        for n in (0..1200).step_by(37) {
            acc.total_cost(&[Message::user("a".repeat(n))]);
            let pct = acc.usage_percent();
            assert!(pct >= last);
            assert!(pct <= 100);
            last = pct;
        }
    }

    #[test]
    fn file_tracking_detects_changes() {
        let mut acc = accountant(1000);
        assert!(acc.track_file_content("src/lib.rs", "fn a() {}"));
        assert!(!acc.track_file_content("src/lib.rs", "fn a() {}"));
        assert!(acc.track_file_content("src/lib.rs", "fn b() {}"));
        assert!(acc.track_file_content("src/main.rs", "fn b() {}"));
    }

    #[test]
    fn tool_result_first_writer_wins() {
        let mut acc = accountant(1000);
        assert_eq!(acc.track_tool_result("c1", "same output"), None);
        assert_eq!(acc.track_tool_result("c2", "same output").as_deref(), Some("c1"));
        assert_eq!(acc.track_tool_result("c3", "same output").as_deref(), Some("c1"));
        assert_eq!(acc.track_tool_result("c4", "other output"), None);
    }

    #[test]
    fn reset_clears_all_state() {
        let mut acc = accountant(1000);
        acc.total_cost(&[Message::user("a").with_id("m1")]);
        acc.track_file_content("a.rs", "x");
        acc.track_tool_result("c1", "out");
        acc.reset();

        assert_eq!(acc.current_tokens(), 0);
        assert_eq!(acc.cache_len(), 0);
        assert!(acc.track_file_content("a.rs", "x"));
        assert_eq!(acc.track_tool_result("c2", "out"), None);
    }

    #[test]
    fn truncate_returns_fitting_text_unchanged() {
        let acc = TokenAccountant::new(chars(), 1000);
        assert_eq!(acc.truncate_to_tokens("short", 10), "short");
    }

    #[test]
    fn truncate_finds_longest_prefix_with_marker() {
        let acc = TokenAccountant::new(chars(), 1000);
        let out = acc.truncate_to_tokens("abcdefghijklmnop", 8);
        assert_eq!(out, "abcde...");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let acc = TokenAccountant::new(chars(), 1000);
        let out = acc.truncate_to_tokens("ééééééééé", 6);
        assert_eq!(out, "ééé...");
    }

    #[test]
    fn truncate_with_no_room_for_marker_is_empty() {
        let acc = TokenAccountant::new(chars(), 1000);
        assert_eq!(acc.truncate_to_tokens("abcdef", 2), "");
    }

    #[test]
    fn truncate_with_char_ratio_tokenizer_fits_budget() {
        let acc = TokenAccountant::new(Arc::new(CharRatioTokenizer::default()), 1000);
        let text = "lorem ipsum ".repeat(200);
        let out = acc.truncate_to_tokens(&text, 50);
        assert!(acc.estimate(&out) <= 50);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn content_hash_is_128_bit_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 32);
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello!"));
    }
}
