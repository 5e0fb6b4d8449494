//! Weighted pairwise similarity between two error reports.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::config::SimilarityWeights;
use crate::text::{symmetric, TextSimilarity, WordDiffSimilarity};
use crate::types::{ErrorData, SimilarityScore};

/// Stack lines compared per trace.
const STACK_LINES: usize = 10;
/// A pair of stack lines matches above this text similarity.
const STACK_LINE_MATCH: f64 = 0.8;
/// Line distance at which the proximity bonus reaches zero.
const LINE_PROXIMITY_SPAN: f64 = 10.0;
/// Added to `confidence` for each kind of data both errors carry.
const CONFIDENCE_STEP: f64 = 0.2;

/// `:line` / `:line:col` suffixes, stripped before comparing stack lines.
static LINE_COL_SUFFIX: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r":\d+(?::\d+)?").ok());

#[derive(Debug, Clone)]
pub struct SimilarityCalculator {
  weights: SimilarityWeights,
  text: Arc<dyn TextSimilarity>,
}

impl Default for SimilarityCalculator {
  fn default() -> Self {
    Self::new(SimilarityWeights::default())
  }
}

impl SimilarityCalculator {
  pub fn new(weights: SimilarityWeights) -> Self {
    Self::with_text(weights, Arc::new(WordDiffSimilarity))
  }

  pub fn with_text(weights: SimilarityWeights, text: Arc<dyn TextSimilarity>) -> Self {
    Self { weights, text }
  }

  /// Compare two errors. Components neither side has data for are left out
  /// of the weighted mean; a component only one side has scores 0.
  pub fn calculate(&self, a: &ErrorData, b: &ErrorData) -> SimilarityScore {
    let w = &self.weights;
    let mut score = SimilarityScore::default();
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    let mut include = |value: Option<f64>, weight: f64| -> f64 {
      match value {
        Some(v) => {
          weighted += v * weight;
          total_weight += weight;
          v
        }
        None => 0.0,
      }
    };

    score.message = include(self.message(a, b), w.message);
    score.stack = include(self.stack(a, b), w.stack);
    score.error_type = include(error_type(a, b), w.error_type);
    score.context = include(context(a, b), w.context);
    score.location = include(location(a, b), w.location);
    score.overall = if total_weight > 0.0 {
      (weighted / total_weight).clamp(0.0, 1.0)
    } else {
      0.0
    };
    score.confidence = confidence(a, b);
    score
  }

  fn message(&self, a: &ErrorData, b: &ErrorData) -> Option<f64> {
    both_or_one(!a.message.is_empty(), !b.message.is_empty())
      .map(|_| symmetric(self.text.as_ref(), &a.message, &b.message))
  }

  fn stack(&self, a: &ErrorData, b: &ErrorData) -> Option<f64> {
    match (a.stack(), b.stack()) {
      (Some(x), Some(y)) => Some(self.stack_similarity(x, y)),
      (None, None) => None,
      _ => Some(0.0),
    }
  }

  /// Fraction of leading stack lines on either side that have a close
  /// counterpart on the other side.
  pub fn stack_similarity(&self, a: &str, b: &str) -> f64 {
    let lines_a = stack_lines(a);
    let lines_b = stack_lines(b);
    if lines_a.is_empty() || lines_b.is_empty() {
      return 0.0;
    }
    let matches = |from: &[String], to: &[String]| {
      from
        .iter()
        .filter(|line| {
          to.iter()
            .any(|other| symmetric(self.text.as_ref(), line, other) > STACK_LINE_MATCH)
        })
        .count()
    };
    let matched = matches(&lines_a, &lines_b) + matches(&lines_b, &lines_a);
    matched as f64 / (lines_a.len() + lines_b.len()) as f64
  }
}

/// `Some(())` when at least one side has data, i.e. the component counts.
fn both_or_one(a: bool, b: bool) -> Option<()> {
  (a || b).then_some(())
}

fn stack_lines(stack: &str) -> Vec<String> {
  stack
    .lines()
    .map(str::trim)
    .filter(|l| !l.is_empty())
    .take(STACK_LINES)
    .map(|line| match LINE_COL_SUFFIX.as_ref() {
      Some(re) => re.replace_all(line, "").into_owned(),
      None => line.to_string(),
    })
    .collect()
}

fn error_type(a: &ErrorData, b: &ErrorData) -> Option<f64> {
  both_or_one(!a.error_type.is_empty(), !b.error_type.is_empty())
    .map(|_| if a.error_type == b.error_type { 1.0 } else { 0.0 })
}

fn context(a: &ErrorData, b: &ErrorData) -> Option<f64> {
  match (a.context(), b.context()) {
    (Some(x), Some(y)) => {
      let keys: BTreeSet<&String> = x.keys().chain(y.keys()).collect();
      let equal = keys
        .iter()
        .filter(|k| matches!((x.get(**k), y.get(**k)), (Some(l), Some(r)) if l == r))
        .count();
      Some(equal as f64 / keys.len() as f64)
    }
    (None, None) => None,
    _ => Some(0.0),
  }
}

fn has_location(e: &ErrorData) -> bool {
  e.filename.is_some() || e.url.is_some() || e.lineno.is_some()
}

fn location(a: &ErrorData, b: &ErrorData) -> Option<f64> {
  both_or_one(has_location(a), has_location(b))?;
  let mut score = 0.0;
  if a.filename.is_some() && a.filename == b.filename {
    score += 0.5;
  }
  if a.url.is_some() && a.url == b.url {
    score += 0.3;
  }
  if let (Some(x), Some(y)) = (a.lineno, b.lineno) {
    let distance = f64::from(x.abs_diff(y)).min(LINE_PROXIMITY_SPAN);
    score += 0.2 * (1.0 - distance / LINE_PROXIMITY_SPAN);
  }
  Some(score.min(1.0))
}

fn confidence(a: &ErrorData, b: &ErrorData) -> f64 {
  let present = [
    !a.message.is_empty() && !b.message.is_empty(),
    a.stack().is_some() && b.stack().is_some(),
    !a.error_type.is_empty() && !b.error_type.is_empty(),
    a.filename.is_some() && b.filename.is_some(),
    a.context().is_some() && b.context().is_some(),
  ];
  let steps = present.iter().filter(|p| **p).count();
  (steps as f64 * CONFIDENCE_STEP).min(1.0)
}
