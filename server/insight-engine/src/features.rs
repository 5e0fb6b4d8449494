//! Fixed-length numeric features for error reports.
//!
//! Every error maps to four vectors of constant length (text, stack,
//! location, context) plus their concatenation. Counts and lengths are
//! damped with `ln(1 + x)`; flags stay 0/1.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;

use crate::config::FeatureStrategy;
use crate::types::{ClusterFeatures, ErrorData};

/// Common failure terms counted in the message.
pub const VOCABULARY: &[&str] = &[
  "undefined",
  "null",
  "cannot",
  "read",
  "property",
  "function",
  "object",
  "timeout",
  "timed",
  "network",
  "connection",
  "refused",
  "reset",
  "permission",
  "denied",
  "forbidden",
  "unauthorized",
  "invalid",
  "json",
  "syntax",
  "unexpected",
  "token",
  "parse",
  "format",
  "failed",
  "fetch",
  "missing",
  "found",
  "module",
  "memory",
  "overflow",
  "maximum",
  "exceeded",
  "quota",
  "abort",
  "cancelled",
  "cors",
  "internal",
  "server",
  "unavailable",
];

pub const TEXT_LEN: usize = VOCABULARY.len();
pub const STACK_LEN: usize = 50;
pub const LOCATION_LEN: usize = 6;
pub const CONTEXT_LEN: usize = 20;
pub const COMBINED_LEN: usize = TEXT_LEN + STACK_LEN + LOCATION_LEN + CONTEXT_LEN;

/// Stack slots before the hashed function/file buckets.
const STACK_FIXED: usize = 7;
const STACK_BUCKETS: usize = STACK_LEN - STACK_FIXED;

/// Context keys with a dedicated presence flag, from slot 2 on.
const WELL_KNOWN_CONTEXT_KEYS: &[&str] = &[
  "userId",
  "sessionId",
  "version",
  "environment",
  "release",
  "component",
  "action",
  "route",
  "requestId",
  "build",
];

static FUNCTION_PATTERN: LazyLock<Option<Regex>> =
  LazyLock::new(|| Regex::new(r"\bat\s+([A-Za-z_$][\w$.<>]*)\s+\(").ok());

static FILE_PATTERN: LazyLock<Option<Regex>> =
  LazyLock::new(|| Regex::new(r"\(([^()\s]+?):\d+(?::\d+)?\)").ok());

fn damp(x: f64) -> f64 {
  (1.0 + x.max(0.0)).ln()
}

fn flag(on: bool) -> f64 {
  if on {
    1.0
  } else {
    0.0
  }
}

fn is_vendor_path(path: &str) -> bool {
  path.contains("node_modules") || path.contains("/vendor/")
}

fn basename(path: &str) -> &str {
  path.rsplit('/').next().unwrap_or(path)
}

fn bucket(token: &str) -> usize {
  let hash = blake3::hash(token.as_bytes());
  let mut word = [0u8; 8];
  word.copy_from_slice(&hash.as_bytes()[..8]);
  (u64::from_le_bytes(word) % STACK_BUCKETS as u64) as usize
}

/// Lower-cased alphanumeric words of `text`.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
  text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|w| !w.is_empty())
    .map(str::to_lowercase)
}

pub fn text_features(message: &str) -> Vec<f64> {
  let mut counts = vec![0.0; TEXT_LEN];
  for word in tokenize(message) {
    if let Some(slot) = VOCABULARY.iter().position(|v| *v == word) {
      counts[slot] += 1.0;
    }
  }
  counts.into_iter().map(damp).collect()
}

pub fn stack_features(stack: Option<&str>) -> Vec<f64> {
  let mut out = vec![0.0; STACK_LEN];
  let Some(stack) = stack else {
    return out;
  };

  let functions: Vec<&str> = FUNCTION_PATTERN
    .as_ref()
    .map(|re| re.captures_iter(stack).filter_map(|c| c.get(1)).map(|m| m.as_str()).collect())
    .unwrap_or_default();
  let files: Vec<&str> = FILE_PATTERN
    .as_ref()
    .map(|re| re.captures_iter(stack).filter_map(|c| c.get(1)).map(|m| m.as_str()).collect())
    .unwrap_or_default();
  let lines = stack.lines().filter(|l| !l.trim().is_empty()).count();

  out[0] = damp(functions.len() as f64);
  out[1] = damp(files.len() as f64);
  out[2] = damp(lines as f64);
  out[3] = flag(is_vendor_path(stack));
  out[4] = flag(stack.contains("webpack") || stack.contains("chunk") || stack.contains("bundle"));
  out[5] = flag(stack.contains("async"));
  out[6] = flag(stack.contains("Promise"));

  let mut buckets = vec![0.0; STACK_BUCKETS];
  for function in &functions {
    buckets[bucket(function)] += 1.0;
  }
  for file in &files {
    buckets[bucket(basename(file))] += 1.0;
  }
  for (slot, count) in buckets.into_iter().enumerate() {
    out[STACK_FIXED + slot] = damp(count);
  }
  out
}

pub fn location_features(error: &ErrorData) -> Vec<f64> {
  let filename = error.filename.as_deref().unwrap_or("");
  let url = error.url.as_deref().unwrap_or("");
  vec![
    damp(f64::from(error.lineno.unwrap_or(0))),
    damp(f64::from(error.colno.unwrap_or(0))),
    damp(filename.len() as f64),
    damp(url.len() as f64),
    flag(is_vendor_path(filename) || is_vendor_path(url)),
    flag(filename.contains(".min.")),
  ]
}

pub fn context_features(error: &ErrorData) -> Vec<f64> {
  let mut out = vec![0.0; CONTEXT_LEN];
  let Some(context) = error.context() else {
    return out;
  };
  let serialized = serde_json::to_string(context).map(|s| s.len()).unwrap_or(0);
  out[0] = damp(context.len() as f64);
  out[1] = damp(serialized as f64);
  for (slot, key) in WELL_KNOWN_CONTEXT_KEYS.iter().enumerate() {
    out[2 + slot] = flag(context.contains_key(*key));
  }
  out
}

/// Compute the features of one error without memoization.
pub fn extract(error: &ErrorData, strategy: FeatureStrategy) -> ClusterFeatures {
  let text = text_features(&error.message);
  let stack = stack_features(error.stack());
  let location = location_features(error);
  let context = context_features(error);

  let mut combined_features = Vec::with_capacity(COMBINED_LEN);
  match strategy {
    FeatureStrategy::Combined => {
      combined_features.extend_from_slice(&text);
      combined_features.extend_from_slice(&stack);
      combined_features.extend_from_slice(&location);
      combined_features.extend_from_slice(&context);
    }
    FeatureStrategy::Text => {
      combined_features.extend_from_slice(&text);
      combined_features.resize(COMBINED_LEN, 0.0);
    }
    FeatureStrategy::Structural => {
      combined_features.resize(TEXT_LEN, 0.0);
      combined_features.extend_from_slice(&stack);
      combined_features.extend_from_slice(&location);
      combined_features.extend_from_slice(&context);
    }
  }

  ClusterFeatures {
    text,
    stack,
    location,
    context,
    combined_features,
  }
}

/// Memoizing extractor keyed by error id.
#[derive(Debug)]
pub struct FeatureExtractor {
  strategy: FeatureStrategy,
  memo: Mutex<HashMap<String, Arc<ClusterFeatures>>>,
}

impl FeatureExtractor {
  pub fn new(strategy: FeatureStrategy) -> Self {
    Self {
      strategy,
      memo: Mutex::new(HashMap::new()),
    }
  }

  pub fn extract(&self, error: &ErrorData) -> Arc<ClusterFeatures> {
    if let Some(hit) = self.memo.lock().get(&error.id) {
      return hit.clone();
    }
    let features = Arc::new(extract(error, self.strategy));
    self.memo.lock().entry(error.id.clone()).or_insert(features).clone()
  }

  pub fn len(&self) -> usize {
    self.memo.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn clear(&self) {
    self.memo.lock().clear();
  }
}

// ---------------------------------------------------------------------------
// Vector math
// ---------------------------------------------------------------------------

/// Cosine similarity. Two all-zero vectors count as identical; one
/// all-zero vector against a non-zero one scores 0.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
  let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
  for (x, y) in a.iter().zip(b) {
    dot += x * y;
    norm_a += x * x;
    norm_b += y * y;
  }
  match (norm_a == 0.0, norm_b == 0.0) {
    (true, true) => 1.0,
    (true, false) | (false, true) => 0.0,
    _ => (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0),
  }
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Element-wise mean of member features. Empty input gives zero vectors.
pub fn centroid<'a, I>(members: I) -> ClusterFeatures
where
  I: IntoIterator<Item = &'a ClusterFeatures>,
{
  let mut sum = ClusterFeatures {
    text: vec![0.0; TEXT_LEN],
    stack: vec![0.0; STACK_LEN],
    location: vec![0.0; LOCATION_LEN],
    context: vec![0.0; CONTEXT_LEN],
    combined_features: vec![0.0; COMBINED_LEN],
  };
  let mut n = 0usize;
  for member in members {
    n += 1;
    add_into(&mut sum.text, &member.text);
    add_into(&mut sum.stack, &member.stack);
    add_into(&mut sum.location, &member.location);
    add_into(&mut sum.context, &member.context);
    add_into(&mut sum.combined_features, &member.combined_features);
  }
  if n > 0 {
    let scale = 1.0 / n as f64;
    for v in [
      &mut sum.text,
      &mut sum.stack,
      &mut sum.location,
      &mut sum.context,
      &mut sum.combined_features,
    ] {
      v.iter_mut().for_each(|x| *x *= scale);
    }
  }
  sum
}

/// Fold one more member into a running mean over `count` members
/// (`count` includes the new one).
pub fn update_centroid(centroid: &mut ClusterFeatures, added: &ClusterFeatures, count: usize) {
  let n = count.max(1) as f64;
  let step = |c: &mut Vec<f64>, x: &[f64]| {
    for (c, x) in c.iter_mut().zip(x) {
      *c += (x - *c) / n;
    }
  };
  step(&mut centroid.text, &added.text);
  step(&mut centroid.stack, &added.stack);
  step(&mut centroid.location, &added.location);
  step(&mut centroid.context, &added.context);
  step(&mut centroid.combined_features, &added.combined_features);
}

fn add_into(acc: &mut [f64], x: &[f64]) {
  for (a, x) in acc.iter_mut().zip(x) {
    *a += x;
  }
}
