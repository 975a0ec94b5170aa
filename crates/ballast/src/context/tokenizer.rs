//! Tokenizer seam.
//!
//! The accountant never guesses token counts on its own; it asks a
//! [`Tokenizer`]. Hosts plug in the tokenizer matching their model. When
//! none is available, [`CharRatioTokenizer`] gives a conservative estimate.

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; 3.5 sits in the middle.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// The tokenizer collaborator. Must be pure: the same text always yields
/// the same count.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count(&self, text: &str) -> usize {
        self(text)
    }
}

/// Estimates tokens from character count.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioTokenizer {
    chars_per_token: f64,
}

impl CharRatioTokenizer {
    /// Use a calibrated ratio, e.g. one derived from reported API usage.
    pub fn with_ratio(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token > 0.0 {
                chars_per_token
            } else {
                DEFAULT_CHARS_PER_TOKEN
            },
        }
    }
}

impl Default for CharRatioTokenizer {
    fn default() -> Self {
        Self::with_ratio(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl Tokenizer for CharRatioTokenizer {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_free() {
        assert_eq!(CharRatioTokenizer::default().count(""), 0);
    }

    #[test]
    fn rounds_partial_tokens_up() {
        let t = CharRatioTokenizer::with_ratio(4.0);
        assert_eq!(t.count("abcd"), 1);
        assert_eq!(t.count("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let t = CharRatioTokenizer::with_ratio(1.0);
        assert_eq!(t.count("héllo"), 5);
    }

    #[test]
    fn non_positive_ratio_falls_back_to_default() {
        let t = CharRatioTokenizer::with_ratio(0.0);
        assert_eq!(t.count(&"a".repeat(35)), 10);
    }

    #[test]
    fn closures_are_tokenizers() {
        let words = |text: &str| text.split_whitespace().count();
        assert_eq!(words.count("one two three"), 3);
    }
}
