//! Full-pass clustering algorithms.
//!
//! Each algorithm partitions input positions `0..n` into groups. Every
//! position ends up in exactly one group; anything an algorithm leaves
//! unassigned comes back as a singleton.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::cluster::stats::select_representative;
use crate::config::{ClusteringAlgorithm, ClusteringConfig};
use crate::error::EngineError;
use crate::features::{cosine_similarity, euclidean_distance};
use crate::similarity::SimilarityCalculator;
use crate::types::{ClusterFeatures, ErrorData};

/// Lloyd iterations before k-means gives up converging.
const KMEANS_MAX_ITERATIONS: usize = 50;
/// Target errors per k-means cluster.
const KMEANS_ERRORS_PER_CLUSTER: usize = 5;

/// Pairwise similarity memo for one reclustering pass.
pub struct PairwiseCache<'a> {
  errors: &'a [ErrorData],
  calc: &'a SimilarityCalculator,
  memo: HashMap<(usize, usize), f64>,
}

impl<'a> PairwiseCache<'a> {
  pub fn new(errors: &'a [ErrorData], calc: &'a SimilarityCalculator) -> Self {
    Self {
      errors,
      calc,
      memo: HashMap::new(),
    }
  }

  pub fn get(&mut self, i: usize, j: usize) -> f64 {
    if i == j {
      return 1.0;
    }
    let key = (i.min(j), i.max(j));
    let (errors, calc) = (self.errors, self.calc);
    *self
      .memo
      .entry(key)
      .or_insert_with(|| calc.calculate(&errors[key.0], &errors[key.1]).overall)
  }
}

/// Inputs shared by every algorithm, in reclustering order.
pub struct ClusterInput<'a> {
  pub errors: &'a [ErrorData],
  pub features: &'a [Arc<ClusterFeatures>],
  pub calc: &'a SimilarityCalculator,
}

pub fn run(
  algorithm: ClusteringAlgorithm,
  input: &ClusterInput<'_>,
  config: &ClusteringConfig,
) -> Result<Vec<Vec<usize>>, EngineError> {
  let min_size = config.min_errors_per_cluster.max(1);
  match algorithm {
    ClusteringAlgorithm::Kmeans => {
      let n = input.errors.len();
      let k = n
        .div_ceil(KMEANS_ERRORS_PER_CLUSTER)
        .min(config.max_clusters)
        .max(1);
      let groups = kmeans(&combined(input), k, KMEANS_MAX_ITERATIONS)?;
      Ok(enforce_min_size(groups, min_size))
    }
    ClusteringAlgorithm::Dbscan => {
      let eps = 1.0 - config.min_similarity;
      dbscan(&combined(input), eps, min_size)
    }
    ClusteringAlgorithm::Hierarchical => Ok(hierarchical(
      input,
      (config.max_clusters / 2).max(1),
      config.min_similarity,
    )),
    ClusteringAlgorithm::Adaptive => Ok(adaptive(input, config.min_similarity, min_size)),
  }
}

/// `run`, falling back to `adaptive` when the requested algorithm fails.
/// Returns the groups and the algorithm that produced them.
pub fn run_with_fallback(
  algorithm: ClusteringAlgorithm,
  input: &ClusterInput<'_>,
  config: &ClusteringConfig,
) -> (Vec<Vec<usize>>, ClusteringAlgorithm) {
  match run(algorithm, input, config) {
    Ok(groups) => (groups, algorithm),
    Err(e) => {
      warn!(algorithm = algorithm.as_str(), error = %e, "falling back to adaptive clustering");
      let min_size = config.min_errors_per_cluster.max(1);
      (
        adaptive(input, config.min_similarity, min_size),
        ClusteringAlgorithm::Adaptive,
      )
    }
  }
}

fn combined<'a>(input: &'a ClusterInput<'_>) -> Vec<&'a [f64]> {
  input.features.iter().map(|f| f.combined_features.as_slice()).collect()
}

fn check_finite(points: &[&[f64]]) -> Result<(), EngineError> {
  if points.iter().all(|p| p.iter().all(|x| x.is_finite())) {
    Ok(())
  } else {
    Err(EngineError::numerical("non-finite feature value"))
  }
}

/// Groups below `min_size` dissolve into singletons.
fn enforce_min_size(groups: Vec<Vec<usize>>, min_size: usize) -> Vec<Vec<usize>> {
  let mut out = Vec::with_capacity(groups.len());
  for group in groups {
    if group.len() >= min_size {
      out.push(group);
    } else {
      out.extend(group.into_iter().map(|i| vec![i]));
    }
  }
  out
}

// ---------------------------------------------------------------------------
// k-means
// ---------------------------------------------------------------------------

pub fn kmeans(points: &[&[f64]], k: usize, max_iterations: usize) -> Result<Vec<Vec<usize>>, EngineError> {
  let n = points.len();
  if n == 0 {
    return Ok(Vec::new());
  }
  check_finite(points)?;
  let k = k.clamp(1, n);
  let dims = points[0].len();

  // Seeds at evenly spaced input positions.
  let mut centroids: Vec<Vec<f64>> = (0..k).map(|c| points[c * n / k].to_vec()).collect();
  let mut assignment = vec![usize::MAX; n];

  for _ in 0..max_iterations {
    let mut changed = false;
    for (i, point) in points.iter().enumerate() {
      let nearest = nearest_centroid(point, &centroids);
      if assignment[i] != nearest {
        assignment[i] = nearest;
        changed = true;
      }
    }
    if !changed {
      break;
    }

    let mut sums = vec![vec![0.0; dims]; k];
    let mut counts = vec![0usize; k];
    for (i, point) in points.iter().enumerate() {
      let c = assignment[i];
      counts[c] += 1;
      for (s, x) in sums[c].iter_mut().zip(point.iter()) {
        *s += x;
      }
    }
    for c in 0..k {
      // An emptied cluster keeps its previous centroid.
      if counts[c] > 0 {
        centroids[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
      }
    }
    if centroids.iter().flatten().any(|x| !x.is_finite()) {
      return Err(EngineError::numerical("k-means centroid diverged"));
    }
  }

  let mut groups = vec![Vec::new(); k];
  for (i, c) in assignment.into_iter().enumerate() {
    groups[c].push(i);
  }
  groups.retain(|g| !g.is_empty());
  Ok(groups)
}

fn nearest_centroid(point: &[f64], centroids: &[Vec<f64>]) -> usize {
  let mut best = (0, f64::INFINITY);
  for (c, centroid) in centroids.iter().enumerate() {
    let d = euclidean_distance(point, centroid);
    if d < best.1 {
      best = (c, d);
    }
  }
  best.0
}

// ---------------------------------------------------------------------------
// DBSCAN
// ---------------------------------------------------------------------------

pub fn dbscan(points: &[&[f64]], eps: f64, min_pts: usize) -> Result<Vec<Vec<usize>>, EngineError> {
  check_finite(points)?;
  let n = points.len();
  let neighbors = |i: usize| -> Vec<usize> {
    (0..n)
      .filter(|j| euclidean_distance(points[i], points[*j]) <= eps)
      .collect()
  };

  let mut visited = vec![false; n];
  let mut assigned = vec![false; n];
  let mut groups: Vec<Vec<usize>> = Vec::new();

  for i in 0..n {
    if visited[i] {
      continue;
    }
    visited[i] = true;
    let seeds = neighbors(i);
    if seeds.len() < min_pts {
      continue;
    }

    let mut group = vec![i];
    assigned[i] = true;
    let mut queue = seeds;
    let mut cursor = 0;
    while cursor < queue.len() {
      let j = queue[cursor];
      cursor += 1;
      if !visited[j] {
        visited[j] = true;
        let around = neighbors(j);
        if around.len() >= min_pts {
          queue.extend(around);
        }
      }
      if !assigned[j] {
        assigned[j] = true;
        group.push(j);
      }
    }
    group.sort_unstable();
    groups.push(group);
  }

  // Noise points stand alone.
  groups.extend((0..n).filter(|i| !assigned[*i]).map(|i| vec![i]));
  Ok(groups)
}

// ---------------------------------------------------------------------------
// Hierarchical
// ---------------------------------------------------------------------------

struct Agglomerate {
  members: Vec<usize>,
  representative: usize,
  centroid: Vec<f64>,
}

/// Merge the most similar pair of clusters until at most `target` remain or
/// the best pair scores below `min_similarity`.
pub fn hierarchical(input: &ClusterInput<'_>, target: usize, min_similarity: f64) -> Vec<Vec<usize>> {
  let mut pairs = PairwiseCache::new(input.errors, input.calc);
  let mut clusters: Vec<Agglomerate> = (0..input.errors.len())
    .map(|i| Agglomerate {
      members: vec![i],
      representative: i,
      centroid: input.features[i].combined_features.clone(),
    })
    .collect();

  while clusters.len() > target {
    let mut best: Option<(usize, usize, f64)> = None;
    for a in 0..clusters.len() {
      for b in (a + 1)..clusters.len() {
        let rep = pairs.get(clusters[a].representative, clusters[b].representative);
        let cos = cosine_similarity(&clusters[a].centroid, &clusters[b].centroid);
        let score = 0.6 * rep + 0.4 * cos;
        if best.map_or(true, |(_, _, s)| score > s) {
          best = Some((a, b, score));
        }
      }
    }
    let Some((a, b, score)) = best else {
      break;
    };
    if score < min_similarity {
      break;
    }

    let absorbed = clusters.remove(b);
    let target_cluster = &mut clusters[a];
    let (na, nb) = (target_cluster.members.len() as f64, absorbed.members.len() as f64);
    for (c, x) in target_cluster.centroid.iter_mut().zip(&absorbed.centroid) {
      *c = (*c * na + x * nb) / (na + nb);
    }
    target_cluster.members.extend(absorbed.members);
    let members = target_cluster.members.clone();
    let pick = select_representative(members.len(), |i, j| pairs.get(members[i], members[j]));
    clusters[a].representative = members[pick];
  }

  clusters.into_iter().map(|c| c.members).collect()
}

// ---------------------------------------------------------------------------
// Adaptive
// ---------------------------------------------------------------------------

/// Exact `(type, message)` groups first, then one similarity sweep over the
/// rest in input order.
pub fn adaptive(input: &ClusterInput<'_>, min_similarity: f64, min_size: usize) -> Vec<Vec<usize>> {
  let errors = input.errors;
  let n = errors.len();
  let mut taken = vec![false; n];
  let mut groups: Vec<Vec<usize>> = Vec::new();

  let mut exact: Vec<((&str, &str), Vec<usize>)> = Vec::new();
  let mut slot_of: HashMap<(&str, &str), usize> = HashMap::new();
  for (i, e) in errors.iter().enumerate() {
    let key = (e.error_type.as_str(), e.message.as_str());
    let slot = *slot_of.entry(key).or_insert_with(|| {
      exact.push((key, Vec::new()));
      exact.len() - 1
    });
    exact[slot].1.push(i);
  }
  for (_, members) in exact {
    if members.len() >= min_size {
      for &i in &members {
        taken[i] = true;
      }
      groups.push(members);
    }
  }

  let mut pairs = PairwiseCache::new(errors, input.calc);
  for i in 0..n {
    if taken[i] {
      continue;
    }
    let mut group = vec![i];
    for j in (i + 1)..n {
      if !taken[j] && pairs.get(i, j) >= min_similarity {
        group.push(j);
      }
    }
    if group.len() >= min_size {
      for &j in &group {
        taken[j] = true;
      }
      groups.push(group);
    } else {
      taken[i] = true;
      groups.push(vec![i]);
    }
  }
  groups
}
