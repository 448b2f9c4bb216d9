//! Token-budgeted text chunking.
//!
//! Text is split on whitespace into words and words are packed greedily into
//! chunks whose approximate token count stays within a budget. Words are never
//! split, so a single word larger than the budget forms a chunk of its own.
//!
//! # Example
//!
//! ```
//! use chunkcast::chunk;
//!
//! let chunks = chunk("a bb ccc dddd", 3).unwrap();
//! let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(texts, ["a bb", "ccc", "dddd"]);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A bounded slice of the input text tagged with its position.
///
/// Sequence indices are contiguous from zero and are the only ordering key
/// used for reassembly; delivery order carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub sequence_index: usize,
    pub text: String,
    pub approx_token_count: usize,
}

/// A cheap approximation of how many model tokens a word costs.
pub trait TokenEstimator {
    fn estimate(&self, word: &str) -> usize;
}

/// Uses the word's length in characters as its token count.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordLength;

impl TokenEstimator for WordLength {
    fn estimate(&self, word: &str) -> usize {
        word.chars().count()
    }
}

/// Assumes one token per `n` characters, rounded up, at least one per word.
#[derive(Debug, Clone, Copy)]
pub struct CharsPerToken(pub usize);

impl TokenEstimator for CharsPerToken {
    fn estimate(&self, word: &str) -> usize {
        let chars = word.chars().count();
        chars.div_ceil(self.0.max(1)).max(1)
    }
}

/// Splits text into [`Chunk`]s under a fixed token budget.
///
/// The budget is validated once, at construction.
#[derive(Debug, Clone)]
pub struct Chunker<E = WordLength> {
    max_tokens: usize,
    estimator: E,
}

impl Chunker<WordLength> {
    /// Creates a chunker that uses [`WordLength`] as its token proxy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `max_tokens` is zero.
    pub fn new(max_tokens: usize) -> Result<Self> {
        Self::with_estimator(max_tokens, WordLength)
    }
}

impl<E: TokenEstimator> Chunker<E> {
    /// Creates a chunker with a custom [`TokenEstimator`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `max_tokens` is zero.
    pub fn with_estimator(max_tokens: usize, estimator: E) -> Result<Self> {
        if max_tokens == 0 {
            return Err(Error::InvalidConfiguration {
                reason: "max_tokens must be greater than 0".to_string(),
            });
        }
        Ok(Self {
            max_tokens,
            estimator,
        })
    }

    pub const fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Splits `text` into ordered chunks.
    ///
    /// A running chunk is closed before a word that would push it past the
    /// budget, and right after a word that makes it reach the budget exactly.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut words: Vec<&str> = Vec::new();
        let mut running = 0;

        for word in text.split_whitespace() {
            let cost = self.estimator.estimate(word);

            if !words.is_empty() && running + cost > self.max_tokens {
                Self::close(&mut chunks, &mut words, &mut running);
            }

            words.push(word);
            running += cost;

            if running >= self.max_tokens {
                Self::close(&mut chunks, &mut words, &mut running);
            }
        }

        if !words.is_empty() {
            Self::close(&mut chunks, &mut words, &mut running);
        }

        chunks
    }

    fn close(chunks: &mut Vec<Chunk>, words: &mut Vec<&str>, running: &mut usize) {
        chunks.push(Chunk {
            sequence_index: chunks.len(),
            text: words.join(" "),
            approx_token_count: *running,
        });
        words.clear();
        *running = 0;
    }
}

/// Splits `text` into chunks of at most `max_tokens` approximate tokens.
///
/// Convenience wrapper around [`Chunker::new`] and [`Chunker::chunk`].
///
/// # Errors
///
/// Returns [`Error::InvalidConfiguration`] if `max_tokens` is zero.
pub fn chunk(text: &str, max_tokens: usize) -> Result<Vec<Chunk>> {
    Ok(Chunker::new(max_tokens)?.chunk(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn closes_on_reaching_budget() {
        let chunks = chunk("a bb ccc dddd", 3).unwrap();
        assert_eq!(texts(&chunks), ["a bb", "ccc", "dddd"]);
        assert_eq!(
            chunks.iter().map(|c| c.approx_token_count).collect::<Vec<_>>(),
            [3, 3, 4]
        );
        assert_eq!(
            chunks.iter().map(|c| c.sequence_index).collect::<Vec<_>>(),
            [0, 1, 2]
        );
    }

    #[test]
    fn closes_before_overflowing_word() {
        let chunks = chunk("aa bb c", 3).unwrap();
        assert_eq!(texts(&chunks), ["aa", "bb c"]);
    }

    #[test]
    fn empty_and_blank_input_yield_nothing() {
        assert!(chunk("", 5).unwrap().is_empty());
        assert!(chunk(" \n\t  ", 5).unwrap().is_empty());
    }

    #[test]
    fn oversized_word_stands_alone() {
        let chunks = chunk("x supercalifragilistic y", 4).unwrap();
        assert_eq!(texts(&chunks), ["x", "supercalifragilistic", "y"]);
        assert_eq!(chunks[1].approx_token_count, 20);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let err = chunk("hello", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
    }

    #[test]
    fn collapses_whitespace_runs() {
        let chunks = chunk("one\n\ntwo\t three", 100).unwrap();
        assert_eq!(texts(&chunks), ["one two three"]);
    }

    #[test]
    fn chars_per_token_estimator() {
        let chunker = Chunker::with_estimator(2, CharsPerToken(4)).unwrap();
        // "abcdefgh" = 2, "ab" = 1, "c" = 1
        let chunks = chunker.chunk("abcdefgh ab c");
        assert_eq!(texts(&chunks), ["abcdefgh", "ab c"]);
        assert_eq!(CharsPerToken(0).estimate("abc"), 3);
    }

    #[test]
    fn preserves_word_sequence_and_budget() {
        let text = "The quick brown fox jumps over the lazy dog while \
                    an extraordinarily verbose narrator keeps on talking \
                    about nothing in particular for quite some time";
        for max_tokens in 1..=40 {
            let chunks = chunk(text, max_tokens).unwrap();

            let rejoined: Vec<&str> = chunks
                .iter()
                .flat_map(|c| c.text.split_whitespace())
                .collect();
            let original: Vec<&str> = text.split_whitespace().collect();
            assert_eq!(rejoined, original, "max_tokens = {max_tokens}");

            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.sequence_index, i);
                let words = c.text.split_whitespace().count();
                assert!(
                    c.approx_token_count <= max_tokens || words == 1,
                    "chunk {i} {:?} over budget {max_tokens}",
                    c.text
                );
            }
        }
    }
}
