use std::collections::BTreeSet;

use thiserror::Error;

use crate::alphabet::Alphabet;
use crate::Time;

/// A single timed string: a sequence of (symbol id, delay) pairs, immutable
/// for the whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedWord {
    symbols: Vec<usize>,
    delays: Vec<Time>,
}

impl TimedWord {
    /// Number of (symbol, delay) positions.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the word has no positions at all.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbol id at a position.
    pub fn symbol(&self, i: usize) -> usize {
        self.symbols[i]
    }

    /// Delay at a position.
    pub fn delay(&self, i: usize) -> Time {
        self.delays[i]
    }
}

/// Error raised while reading a corpus file.
#[derive(Debug, Error)]
pub enum CorpusParseError {
    /// The input ended although more tokens were declared.
    #[error("unexpected end of input while reading {0}")]
    UnexpectedEnd(&'static str),
    /// A token could not be read as a non-negative integer.
    #[error("expected a non-negative integer for {what}, got {token:?}")]
    InvalidInt {
        /// What the token was supposed to encode.
        what: &'static str,
        /// The offending token.
        token: String,
    },
    /// A symbol token was not a single character.
    #[error("expected a single-character symbol, got {0:?}")]
    InvalidSymbol(String),
}

/// The parsed corpus: the discovered alphabet, the timed words, and the
/// delay percentiles the histogram bins are built from.
///
/// The input format is whitespace separated ASCII: a header line
/// `N A` (number of strings, alphabet capacity) followed by `N` records
/// `L c t c t ... c t` of `L` (symbol, delay) pairs each.
#[derive(Clone, Debug)]
pub struct TimedSample {
    alphabet: Alphabet,
    words: Vec<TimedWord>,
    /// Starting offset of each word in the dense tail numbering.
    offsets: Vec<usize>,
    total_positions: usize,
    max_time: Time,
    time_iqr: [Time; 3],
}

fn next_int<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    what: &'static str,
) -> Result<usize, CorpusParseError> {
    let token = tokens
        .next()
        .ok_or(CorpusParseError::UnexpectedEnd(what))?;
    token.parse().map_err(|_| CorpusParseError::InvalidInt {
        what,
        token: token.to_string(),
    })
}

impl TimedSample {
    /// Parse a corpus from its textual form.
    pub fn parse(input: &str) -> Result<Self, CorpusParseError> {
        let mut tokens = input.split_whitespace();
        let num_words = next_int(&mut tokens, "the number of strings")?;
        let capacity = next_int(&mut tokens, "the alphabet size")?;

        let mut alphabet = Alphabet::with_capacity(capacity);
        let mut words = Vec::with_capacity(num_words);
        let mut delays_seen = BTreeSet::new();
        for _ in 0..num_words {
            let length = next_int(&mut tokens, "a string length")?;
            let mut symbols = Vec::with_capacity(length);
            let mut delays = Vec::with_capacity(length);
            for _ in 0..length {
                let token = tokens
                    .next()
                    .ok_or(CorpusParseError::UnexpectedEnd("a symbol"))?;
                let mut chars = token.chars();
                let c = chars
                    .next()
                    .ok_or_else(|| CorpusParseError::InvalidSymbol(token.to_string()))?;
                if chars.next().is_some() {
                    return Err(CorpusParseError::InvalidSymbol(token.to_string()));
                }
                symbols.push(alphabet.intern(c));
                let delay = next_int(&mut tokens, "a delay")? as Time;
                delays_seen.insert(delay);
                delays.push(delay);
            }
            words.push(TimedWord { symbols, delays });
        }

        let mut offsets = Vec::with_capacity(words.len());
        let mut total_positions = 0;
        for word in &words {
            offsets.push(total_positions);
            total_positions += word.len();
        }

        // Index-based percentiles over the set of distinct delays.
        let distinct: Vec<Time> = delays_seen.into_iter().collect();
        let mut time_iqr = [0; 3];
        if !distinct.is_empty() {
            time_iqr = [
                distinct[distinct.len() / 4],
                distinct[distinct.len() / 2],
                distinct[distinct.len() * 3 / 4],
            ];
        }
        let max_time = distinct.last().copied().unwrap_or(0);

        Ok(Self {
            alphabet,
            words,
            offsets,
            total_positions,
            max_time,
            time_iqr,
        })
    }

    /// The discovered alphabet.
    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    /// All words of the corpus.
    pub fn words(&self) -> &[TimedWord] {
        &self.words
    }

    /// A single word by index.
    pub fn word(&self, i: usize) -> &TimedWord {
        &self.words[i]
    }

    /// Number of words in the corpus.
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Total number of (symbol, delay) positions, i.e. of tails.
    pub fn total_positions(&self) -> usize {
        self.total_positions
    }

    pub(crate) fn offset(&self, word: usize) -> usize {
        self.offsets[word]
    }

    /// Largest delay observed anywhere in the corpus.
    pub fn max_time(&self) -> Time {
        self.max_time
    }

    /// The 25/50/75 percentiles of the distinct delay values.
    pub fn time_iqrs(&self) -> [Time; 3] {
        self.time_iqr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sample() {
        let sample = TimedSample::parse("2 2\n2 a 3 b 1\n1 b 7\n").unwrap();
        assert_eq!(sample.num_words(), 2);
        assert_eq!(sample.alphabet().len(), 2);
        assert_eq!(sample.alphabet().index('a'), Some(0));
        assert_eq!(sample.alphabet().index('b'), Some(1));
        assert_eq!(sample.word(0).len(), 2);
        assert_eq!(sample.word(0).symbol(1), 1);
        assert_eq!(sample.word(0).delay(1), 1);
        assert_eq!(sample.max_time(), 7);
        assert_eq!(sample.total_positions(), 3);
    }

    #[test]
    fn percentiles_are_index_based() {
        // Distinct delays 1..=40; the percentile indices are 10, 20 and 30.
        let mut input = String::from("40 1\n");
        for t in 1..=40 {
            input.push_str(&format!("1 a {t}\n"));
        }
        let sample = TimedSample::parse(&input).unwrap();
        assert_eq!(sample.time_iqrs(), [11, 21, 31]);
        assert_eq!(sample.max_time(), 40);
    }

    #[test]
    fn empty_words_are_legal() {
        let sample = TimedSample::parse("2 1\n0\n1 a 0\n").unwrap();
        assert_eq!(sample.num_words(), 2);
        assert!(sample.word(0).is_empty());
        assert_eq!(sample.total_positions(), 1);
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(matches!(
            TimedSample::parse("1 1\n2 a 0\n"),
            Err(CorpusParseError::UnexpectedEnd(_))
        ));
        assert!(matches!(
            TimedSample::parse("1 1\n1 ab 0\n"),
            Err(CorpusParseError::InvalidSymbol(_))
        ));
        assert!(matches!(
            TimedSample::parse("1 1\n1 a x\n"),
            Err(CorpusParseError::InvalidInt { .. })
        ));
    }
}
