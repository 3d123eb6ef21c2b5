/// Token estimation shared by the chunker and the embedding batcher.
///
/// Every budget decision in the crate goes through one estimator so that
/// chunk sizes and batch sizes agree on how many tokens a text holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f32,
}

/// Average characters per token for English prose with BPE tokenizers.
pub const DEFAULT_CHARS_PER_TOKEN: f32 = 4.0;

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator {
    /// Ratios below 1 are clamped to 1.
    pub fn new(chars_per_token: f32) -> Self {
        let chars_per_token = if chars_per_token.is_finite() {
            chars_per_token.max(1.0)
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f32 {
        self.chars_per_token
    }

    /// Estimated token count of `text` (never zero for non-empty text).
    pub fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f32 / self.chars_per_token).ceil() as usize
    }

    /// Number of characters that fit in `tokens`.
    pub fn char_budget(&self, tokens: usize) -> usize {
        (tokens as f32 * self.chars_per_token).floor() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ratio_is_realistic() {
        let est = TokenEstimator::default();
        assert!(est.chars_per_token() >= 3.0);
        assert_eq!(est.estimate("abcdefgh"), 2);
        assert_eq!(est.estimate("abcdefghi"), 3);
        assert_eq!(est.estimate(""), 0);
    }

    #[test]
    fn char_budget_matches_ratio() {
        let est = TokenEstimator::new(3.5);
        assert_eq!(est.char_budget(100), 350);
    }

    #[test]
    fn clamps_degenerate_ratios() {
        assert_eq!(TokenEstimator::new(0.2).chars_per_token(), 1.0);
        assert_eq!(
            TokenEstimator::new(f32::NAN).chars_per_token(),
            DEFAULT_CHARS_PER_TOKEN
        );
    }

    #[test]
    fn counts_chars_not_bytes() {
        let est = TokenEstimator::new(4.0);
        // 4 multi-byte chars -> one token
        assert_eq!(est.estimate("ñäöü"), 1);
    }
}
