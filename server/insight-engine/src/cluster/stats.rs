//! Cluster statistics, confidence and representative selection.

use std::collections::{HashMap, HashSet};

use crate::similarity::SimilarityCalculator;
use crate::types::{ClusterStats, ErrorCluster, ErrorData};

const MS_PER_HOUR: f64 = 60.0 * 60.0 * 1000.0;

/// Confidence never exceeds this, whatever the size.
const CONFIDENCE_CAP: f64 = 0.95;
/// Clusters above this size are treated as over-generalized.
const GIANT_CLUSTER: usize = 100;

pub fn compute_stats(errors: &[ErrorData]) -> ClusterStats {
  let first_seen = errors.iter().map(|e| e.timestamp).min().unwrap_or(0);
  let last_seen = errors.iter().map(|e| e.timestamp).max().unwrap_or(0);
  let count = errors.len();
  let span_hours = (last_seen - first_seen) as f64 / MS_PER_HOUR;
  let frequency = if span_hours > 0.0 {
    count as f64 / span_hours
  } else {
    count as f64
  };

  let users: HashSet<&str> = errors.iter().filter_map(|e| e.user_id.as_deref()).collect();
  let sessions: HashSet<&str> = errors.iter().filter_map(|e| e.session_id.as_deref()).collect();

  ClusterStats {
    count,
    first_seen,
    last_seen,
    frequency,
    affected_users: users.len(),
    affected_sessions: sessions.len(),
    common_browser: most_common(
      errors
        .iter()
        .filter_map(|e| e.user_agent.as_deref())
        .map(browser_family),
    )
    .map(str::to_string),
    common_url: most_common(errors.iter().filter_map(|e| e.url.as_deref())).map(str::to_string),
  }
}

/// Modal value; ties go to the value seen first.
fn most_common<'a, I>(values: I) -> Option<&'a str>
where
  I: IntoIterator<Item = &'a str>,
{
  let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
  for (order, value) in values.into_iter().enumerate() {
    counts.entry(value).or_insert((0, order)).0 += 1;
  }
  counts
    .into_iter()
    .max_by(|(_, (ca, oa)), (_, (cb, ob))| ca.cmp(cb).then(ob.cmp(oa)))
    .map(|(value, _)| value)
}

pub fn browser_family(user_agent: &str) -> &'static str {
  if user_agent.contains("Edg") {
    "Edge"
  } else if user_agent.contains("OPR") || user_agent.contains("Opera") {
    "Opera"
  } else if user_agent.contains("Firefox") {
    "Firefox"
  } else if user_agent.contains("Chrome") || user_agent.contains("CriOS") {
    "Chrome"
  } else if user_agent.contains("Safari") {
    "Safari"
  } else {
    "Other"
  }
}

/// `min(0.95, 0.5 + 0.05 * size)`, scaled by 0.8 above 100 members.
pub fn cluster_confidence(size: usize) -> f64 {
  let base = (0.5 + 0.05 * size as f64).min(CONFIDENCE_CAP);
  if size > GIANT_CLUSTER {
    base * 0.8
  } else {
    base
  }
}

/// Index of the member with the highest mean similarity to all the others.
/// Ties keep the earliest member.
pub fn select_representative<F>(len: usize, mut similarity: F) -> usize
where
  F: FnMut(usize, usize) -> f64,
{
  if len <= 2 {
    return 0;
  }
  let mut best = (0, f64::MIN);
  for i in 0..len {
    let total: f64 = (0..len).filter(|j| *j != i).map(|j| similarity(i, j)).sum();
    let mean = total / (len - 1) as f64;
    if mean > best.1 {
      best = (i, mean);
    }
  }
  best.0
}

/// Representative search over a member list with direct comparisons.
pub fn representative_of(errors: &[ErrorData], calc: &SimilarityCalculator) -> usize {
  select_representative(errors.len(), |i, j| calc.calculate(&errors[i], &errors[j]).overall)
}

/// Mean cluster confidence discounted by how uneven the cluster sizes are.
pub fn accuracy(clusters: &[ErrorCluster]) -> f64 {
  if clusters.is_empty() {
    return 0.0;
  }
  let n = clusters.len() as f64;
  let mean_confidence = clusters.iter().map(|c| c.confidence).sum::<f64>() / n;
  let mean_size = clusters.iter().map(|c| c.size() as f64).sum::<f64>() / n;
  let variance = clusters
    .iter()
    .map(|c| (c.size() as f64 - mean_size).powi(2))
    .sum::<f64>()
    / n;
  let variation = if mean_size > 0.0 {
    variance.sqrt() / mean_size
  } else {
    0.0
  };
  (mean_confidence / (1.0 + variation)).clamp(0.0, 1.0)
}
