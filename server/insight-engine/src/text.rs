//! Replaceable text heuristics: string similarity and token extraction.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use similar::TextDiff;

/// Similarity of two strings in `[0, 1]`.
pub trait TextSimilarity: Send + Sync + fmt::Debug {
  fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Word-level diff ratio: `2 * matched_tokens / (tokens_a + tokens_b)`.
/// Whitespace runs count as tokens, as in `similar`'s word tokenizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordDiffSimilarity;

impl TextSimilarity for WordDiffSimilarity {
  fn similarity(&self, a: &str, b: &str) -> f64 {
    if a == b {
      return 1.0;
    }
    if a.is_empty() || b.is_empty() {
      return 0.0;
    }
    f64::from(TextDiff::from_words(a, b).ratio())
  }
}

/// Calls `sim` with the arguments in a fixed order so the result never
/// depends on which side was passed first.
pub fn symmetric(sim: &dyn TextSimilarity, a: &str, b: &str) -> f64 {
  if a <= b {
    sim.similarity(a, b)
  } else {
    sim.similarity(b, a)
  }
}

/// Pulls comparable tokens out of a log message.
pub trait TokenExtractor: Send + Sync + fmt::Debug {
  fn extract(&self, text: &str) -> BTreeSet<String>;
}

static TOKEN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
  [
    // integers
    r"\b\d+\b",
    // UUIDs
    r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
    // error / exception type names
    r"\b[A-Za-z_][A-Za-z0-9_]*(?:Error|Exception)\b",
    // HTTP verbs
    r"\b(?:GET|POST|PUT|DELETE|PATCH|HEAD|OPTIONS)\b",
    // HTTP status codes
    r"\b[1-5][0-9]{2}\b",
  ]
  .iter()
  .filter_map(|pattern| Regex::new(pattern).ok())
  .collect()
});

/// Integers, UUIDs, `*Error`/`*Exception` names, HTTP verbs and status codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternTokenExtractor;

impl TokenExtractor for PatternTokenExtractor {
  fn extract(&self, text: &str) -> BTreeSet<String> {
    TOKEN_PATTERNS
      .iter()
      .flat_map(|re| re.find_iter(text).map(|m| m.as_str().to_string()))
      .collect()
  }
}

/// Jaccard index of two sets; 0 when both are empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
  let union = a.union(b).count();
  if union == 0 {
    return 0.0;
  }
  a.intersection(b).count() as f64 / union as f64
}
