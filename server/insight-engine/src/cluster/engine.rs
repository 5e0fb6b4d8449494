//! Clustering engine: online assignment of incoming errors plus full
//! reclustering passes, merges and queries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::background::BackgroundTask;
use crate::clock::{Clock, SystemClock};
use crate::cluster::algorithms::{self, ClusterInput};
use crate::cluster::stats::{accuracy, cluster_confidence, compute_stats, representative_of};
use crate::config::{ClusteringAlgorithm, ClusteringConfig};
use crate::error::EngineError;
use crate::events::{ClusterEvent, EventBus};
use crate::features::{centroid, cosine_similarity, update_centroid, FeatureExtractor};
use crate::similarity::SimilarityCalculator;
use crate::text::{TextSimilarity, WordDiffSimilarity};
use crate::types::*;

/// Weight of representative similarity in the join score; the centroid
/// cosine gets the rest.
const REPRESENTATIVE_WEIGHT: f64 = 0.7;
const NEW_CLUSTER_CONFIDENCE: f64 = 1.0;
const MERGE_CONFIDENCE_DISCOUNT: f64 = 0.9;
/// Optimistic scoring rounds before `add_error` scores under the write lock.
const PLACEMENT_ATTEMPTS: usize = 3;

struct ClusterSlot {
  cluster: ErrorCluster,
  /// When the representative was last chosen.
  representative_at: i64,
}

#[derive(Default)]
struct ClusterState {
  /// Creation order.
  slots: Vec<ClusterSlot>,
  /// error id -> cluster id.
  error_index: HashMap<String, String>,
  /// Bumped by `clear`; a reclustering that started earlier is discarded.
  epoch: u64,
  /// Bumped whenever the set of clusters changes (create, merge, recluster,
  /// clear). Joins leave it alone.
  generation: u64,
}

impl ClusterState {
  fn position(&self, cluster_id: &str) -> Option<usize> {
    self.slots.iter().position(|s| s.cluster.id == cluster_id)
  }

  fn slot(&self, cluster_id: &str) -> Option<&ClusterSlot> {
    self.slots.iter().find(|s| s.cluster.id == cluster_id)
  }

  fn clusters(&self) -> Vec<ErrorCluster> {
    self.slots.iter().map(|s| s.cluster.clone()).collect()
  }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ClusterEngine {
  inner: Arc<Inner>,
}

struct Inner {
  config: ClusteringConfig,
  clock: Arc<dyn Clock>,
  features: FeatureExtractor,
  similarity: SimilarityCalculator,
  state: RwLock<ClusterState>,
  /// Serializes reclustering passes.
  recluster_gate: tokio::sync::Mutex<()>,
  runs: AtomicU64,
  last_run: Mutex<Option<ClusteringMetadata>>,
  events: EventBus<ClusterEvent>,
  maintenance: Mutex<Option<BackgroundTask>>,
}

/// Outcome of placing one error.
struct Placement {
  cluster: ErrorCluster,
  event: Option<ClusterEvent>,
  /// The representative is due for a refresh.
  refresh: bool,
}

/// Current cluster of an already indexed error.
fn indexed(state: &ClusterState, error_id: &str) -> Option<Placement> {
  let slot = state.error_index.get(error_id).and_then(|id| state.slot(id))?;
  Some(Placement {
    cluster: slot.cluster.clone(),
    event: None,
    refresh: false,
  })
}

impl Inner {
  fn blended_score(&self, error: &ErrorData, features: &ClusterFeatures, cluster: &ErrorCluster) -> f64 {
    let pairwise = self.similarity.calculate(error, &cluster.representative).overall;
    let cosine = cosine_similarity(&features.combined_features, &cluster.features.combined_features);
    REPRESENTATIVE_WEIGHT * pairwise + (1.0 - REPRESENTATIVE_WEIGHT) * cosine
  }

  /// Best-scoring cluster for an error, if any clears `min_similarity`.
  fn best_match(&self, state: &ClusterState, error: &ErrorData, features: &ClusterFeatures) -> Option<(String, f64)> {
    let mut best: Option<(&ErrorCluster, f64)> = None;
    for slot in &state.slots {
      let score = self.blended_score(error, features, &slot.cluster);
      if best.map_or(true, |(_, s)| score > s) {
        best = Some((&slot.cluster, score));
      }
    }
    best
      .filter(|(_, score)| *score >= self.config.min_similarity)
      .map(|(cluster, score)| (cluster.id.clone(), score))
  }

  /// Apply a placement decided by `best_match`. Short; the caller holds the
  /// write lock. A due representative refresh is reported, not performed.
  fn place_locked(
    &self,
    state: &mut ClusterState,
    error: ErrorData,
    features: &ClusterFeatures,
    target: Option<(String, f64)>,
    now: i64,
  ) -> Placement {
    let config = &self.config;
    let error_id = error.id.clone();
    // The chosen cluster may have been merged away or rebuilt since scoring.
    let target = match target {
      Some((id, _)) if state.position(&id).is_none() => self.best_match(state, &error, features),
      other => other,
    };
    let joined = target.and_then(|(id, score)| state.position(&id).map(|i| (i, score)));
    match joined {
      Some((i, score)) => {
        let slot = &mut state.slots[i];
        slot.cluster.errors.push(error);
        let size = slot.cluster.errors.len();
        slot.cluster.stats = compute_stats(&slot.cluster.errors);
        slot.cluster.confidence = cluster_confidence(size);
        slot.cluster.updated_at = now;

        let mut refresh = false;
        if config.online_learning {
          update_centroid(&mut slot.cluster.features, features, size);
          let every = config.representative_refresh_every.max(1);
          if size % every == 0 && now - slot.representative_at >= config.representative_refresh_ms {
            slot.representative_at = now;
            refresh = true;
          }
        }

        let cluster = slot.cluster.clone();
        state.error_index.insert(error_id.clone(), cluster.id.clone());
        debug!(error_id = %error_id, cluster_id = %cluster.id, score, size, "error joined cluster");
        let event = ClusterEvent::ErrorAdded {
          cluster_id: cluster.id.clone(),
          error_id,
        };
        Placement {
          cluster,
          event: Some(event),
          refresh,
        }
      }
      None => {
        let cluster = ErrorCluster {
          id: Uuid::new_v4().to_string(),
          created_at: now,
          updated_at: now,
          representative: error.clone(),
          stats: compute_stats(std::slice::from_ref(&error)),
          features: features.clone(),
          confidence: NEW_CLUSTER_CONFIDENCE,
          errors: vec![error],
        };
        state.error_index.insert(error_id.clone(), cluster.id.clone());
        state.slots.push(ClusterSlot {
          cluster: cluster.clone(),
          representative_at: now,
        });
        state.generation += 1;
        debug!(error_id = %error_id, cluster_id = %cluster.id, "new cluster");
        let event = ClusterEvent::Created {
          cluster_id: cluster.id.clone(),
          error_id,
        };
        Placement {
          cluster,
          event: Some(event),
          refresh: false,
        }
      }
    }
  }

  /// Score and place in one go; used while the write lock is already held.
  fn insert_locked(&self, state: &mut ClusterState, error: ErrorData, now: i64) -> Placement {
    if let Some(existing) = indexed(state, &error.id) {
      return existing;
    }
    let features = self.features.extract(&error);
    let target = self.best_match(state, &error, &features);
    self.place_locked(state, error, &features, target, now)
  }

  /// Re-pick a cluster's representative outside the write lock. Skipped when
  /// the cluster changed size or vanished in the meantime.
  fn refresh_representative(&self, cluster: &ErrorCluster) -> Option<ErrorCluster> {
    let pick = representative_of(&cluster.errors, &self.similarity);
    let representative = cluster.errors.get(pick)?.clone();
    let mut state = self.state.write();
    let i = state.position(&cluster.id)?;
    let slot = &mut state.slots[i];
    if slot.cluster.errors.len() != cluster.errors.len() {
      return None;
    }
    slot.cluster.representative = representative;
    Some(slot.cluster.clone())
  }

  /// Build a cluster from scratch: centroid, full representative search, stats.
  fn assemble(&self, errors: Vec<ErrorData>, confidence: f64, now: i64) -> ErrorCluster {
    let member_features: Vec<Arc<ClusterFeatures>> =
      errors.iter().map(|e| self.features.extract(e)).collect();
    let features = centroid(member_features.iter().map(|f| f.as_ref()));
    let pick = representative_of(&errors, &self.similarity);
    let representative = errors
      .get(pick)
      .cloned()
      .unwrap_or_else(|| ErrorData::new("", "", "", now));
    ErrorCluster {
      id: Uuid::new_v4().to_string(),
      created_at: now,
      updated_at: now,
      representative,
      stats: compute_stats(&errors),
      features,
      confidence,
      errors,
    }
  }

  /// Blocking part of a reclustering pass.
  fn compute_clusters(&self, errors: Vec<ErrorData>, now: i64) -> (Vec<ErrorCluster>, ClusteringAlgorithm) {
    let features: Vec<Arc<ClusterFeatures>> = errors.iter().map(|e| self.features.extract(e)).collect();
    let input = ClusterInput {
      errors: &errors,
      features: &features,
      calc: &self.similarity,
    };

    let (groups, used) = algorithms::run_with_fallback(self.config.algorithm, &input, &self.config);

    let clusters = groups
      .into_iter()
      .filter(|group| !group.is_empty())
      .map(|group| {
        let members: Vec<ErrorData> = group.iter().map(|&i| errors[i].clone()).collect();
        let confidence = cluster_confidence(members.len());
        self.assemble(members, confidence, now)
      })
      .collect();
    (clusters, used)
  }
}

impl ClusterEngine {
  pub fn new(config: ClusteringConfig) -> Self {
    Self::with_components(config, Arc::new(SystemClock), Arc::new(WordDiffSimilarity))
  }

  pub fn with_defaults() -> Self {
    Self::new(ClusteringConfig::default())
  }

  pub fn with_clock(config: ClusteringConfig, clock: Arc<dyn Clock>) -> Self {
    Self::with_components(config, clock, Arc::new(WordDiffSimilarity))
  }

  /// Build with a custom clock and text similarity. Starts automatic
  /// reclustering when enabled and called inside a tokio runtime.
  pub fn with_components(
    config: ClusteringConfig,
    clock: Arc<dyn Clock>,
    text: Arc<dyn TextSimilarity>,
  ) -> Self {
    let inner = Inner {
      features: FeatureExtractor::new(config.feature_strategy),
      similarity: SimilarityCalculator::with_text(config.weights, text),
      state: RwLock::new(ClusterState::default()),
      recluster_gate: tokio::sync::Mutex::new(()),
      runs: AtomicU64::new(0),
      last_run: Mutex::new(None),
      events: EventBus::new(config.event_capacity),
      maintenance: Mutex::new(None),
      config,
      clock,
    };
    let engine = Self {
      inner: Arc::new(inner),
    };
    if engine.inner.config.auto_recluster {
      engine.start_maintenance();
    }
    engine
  }

  fn start_maintenance(&self) {
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    let period = Duration::from_millis(self.inner.config.recluster_interval_ms);
    let task = BackgroundTask::spawn_periodic("auto-recluster", period, move || {
      let weak = weak.clone();
      async move {
        let Some(inner) = weak.upgrade() else {
          return false;
        };
        let engine = ClusterEngine { inner };
        if let Err(e) = engine.perform_reclustering().await {
          warn!(error = %e, "automatic reclustering failed; retrying next tick");
        }
        true
      }
    });
    *self.inner.maintenance.lock() = task;
  }

  pub fn config(&self) -> &ClusteringConfig {
    &self.inner.config
  }

  /// Features of one error (memoized by id).
  pub fn extract_features(&self, error: &ErrorData) -> Arc<ClusterFeatures> {
    self.inner.features.extract(error)
  }

  pub fn calculate_similarity(&self, a: &ErrorData, b: &ErrorData) -> SimilarityScore {
    self.inner.similarity.calculate(a, b)
  }

  // -------------------------------------------------------------------------
  // Mutations
  // -------------------------------------------------------------------------

  /// Assign an error to its best cluster or start a new one. Adding an id
  /// that is already clustered returns its current cluster unchanged.
  ///
  /// Scoring runs under the read lock; the write lock only covers applying
  /// the choice. If clusters were created or removed in between, scoring is
  /// retried, and the last attempt scores under the write lock.
  pub fn add_error(&self, error: ErrorData) -> ErrorCluster {
    let inner = &self.inner;
    let now = inner.clock.now_ms();
    let features = inner.features.extract(&error);

    let mut attempt = 0;
    let placement = loop {
      attempt += 1;
      let (target, generation) = {
        let state = inner.state.read();
        if let Some(existing) = indexed(&state, &error.id) {
          return existing.cluster;
        }
        (inner.best_match(&state, &error, &features), state.generation)
      };

      let mut state = inner.state.write();
      if let Some(existing) = indexed(&state, &error.id) {
        return existing.cluster;
      }
      if state.generation == generation {
        break inner.place_locked(&mut state, error, &features, target, now);
      }
      if attempt >= PLACEMENT_ATTEMPTS {
        let target = inner.best_match(&state, &error, &features);
        break inner.place_locked(&mut state, error, &features, target, now);
      }
    };

    let mut cluster = placement.cluster;
    if placement.refresh {
      if let Some(refreshed) = inner.refresh_representative(&cluster) {
        cluster = refreshed;
      }
    }
    if let Some(event) = placement.event {
      inner.events.publish(event);
    }
    cluster
  }

  /// Combine two clusters into a new one; both source ids stop existing.
  pub fn merge_clusters(&self, first: &str, second: &str) -> Result<ErrorCluster, EngineError> {
    let inner = &self.inner;
    let now = inner.clock.now_ms();
    let merged = {
      let mut state = inner.state.write();
      let pos_a = state
        .position(first)
        .ok_or_else(|| EngineError::cluster_not_found(first))?;
      let pos_b = state
        .position(second)
        .ok_or_else(|| EngineError::cluster_not_found(second))?;
      if pos_a == pos_b {
        return Err(EngineError::SelfMerge(first.to_string()));
      }

      let (low, high) = (pos_a.min(pos_b), pos_a.max(pos_b));
      let later = state.slots.remove(high).cluster;
      let earlier = state.slots.remove(low).cluster;
      let (a, b) = if pos_a < pos_b { (earlier, later) } else { (later, earlier) };

      let confidence = a.confidence.min(b.confidence) * MERGE_CONFIDENCE_DISCOUNT;
      let created_at = a.created_at.min(b.created_at);
      let mut errors = a.errors;
      errors.extend(b.errors);
      let mut cluster = inner.assemble(errors, confidence, now);
      cluster.created_at = created_at;

      for error in &cluster.errors {
        state.error_index.insert(error.id.clone(), cluster.id.clone());
      }
      state.slots.insert(
        low,
        ClusterSlot {
          cluster: cluster.clone(),
          representative_at: now,
        },
      );
      state.generation += 1;
      cluster
    };

    info!(
      first,
      second,
      cluster_id = %merged.id,
      size = merged.size(),
      "clusters merged"
    );
    inner.events.publish(ClusterEvent::Merged {
      sources: [first.to_string(), second.to_string()],
      cluster_id: merged.id.clone(),
    });
    Ok(merged)
  }

  /// Rebuild every cluster from the retained errors with the configured
  /// algorithm. The new set replaces the old one only once it is complete;
  /// dropping the future leaves the current clusters in place.
  pub async fn perform_reclustering(&self) -> Result<ClusteringResult, EngineError> {
    let inner = &self.inner;
    let _gate = inner.recluster_gate.lock().await;
    let started = Instant::now();

    let (mut errors, epoch) = {
      let state = inner.state.read();
      let errors: Vec<ErrorData> = state
        .slots
        .iter()
        .flat_map(|s| s.cluster.errors.iter().cloned())
        .collect();
      (errors, state.epoch)
    };
    errors.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    let snapshot: HashSet<String> = errors.iter().map(|e| e.id.clone()).collect();
    let now = inner.clock.now_ms();

    let worker = inner.clone();
    let (computed, algorithm) =
      tokio::task::spawn_blocking(move || worker.compute_clusters(errors, now)).await?;

    let mut events = Vec::new();
    let mut refresh = Vec::new();
    let mut clusters = {
      let mut state = inner.state.write();
      if state.epoch == epoch {
        // Errors that arrived while the pass ran.
        let arrived: Vec<ErrorData> = state
          .slots
          .iter()
          .flat_map(|s| s.cluster.errors.iter())
          .filter(|e| !snapshot.contains(&e.id))
          .cloned()
          .collect();

        state.error_index = computed
          .iter()
          .flat_map(|c| c.errors.iter().map(move |e| (e.id.clone(), c.id.clone())))
          .collect();
        state.slots = computed
          .into_iter()
          .map(|cluster| ClusterSlot {
            cluster,
            representative_at: now,
          })
          .collect();
        state.generation += 1;
        for error in arrived {
          let placement = inner.insert_locked(&mut state, error, now);
          events.extend(placement.event);
          if placement.refresh {
            refresh.push(placement.cluster);
          }
        }
      } else {
        warn!("engine cleared during reclustering; result discarded");
      }
      state.clusters()
    };
    for stale in refresh {
      if let Some(refreshed) = inner.refresh_representative(&stale) {
        if let Some(c) = clusters.iter_mut().find(|c| c.id == refreshed.id) {
          *c = refreshed;
        }
      }
    }
    for event in events {
      inner.events.publish(event);
    }

    let total_errors: usize = clusters.iter().map(ErrorCluster::size).sum();
    let metadata = ClusteringMetadata {
      algorithm,
      requested_algorithm: inner.config.algorithm,
      total_errors,
      cluster_count: clusters.len(),
      average_cluster_size: if clusters.is_empty() {
        0.0
      } else {
        total_errors as f64 / clusters.len() as f64
      },
      accuracy: accuracy(&clusters),
      duration_ms: started.elapsed().as_secs_f64() * 1000.0,
    };

    inner.runs.fetch_add(1, Ordering::Relaxed);
    *inner.last_run.lock() = Some(metadata.clone());
    info!(
      algorithm = algorithm.as_str(),
      total_errors,
      cluster_count = metadata.cluster_count,
      accuracy = metadata.accuracy,
      duration_ms = metadata.duration_ms,
      "reclustering complete"
    );
    inner.events.publish(ClusterEvent::Reclustered {
      algorithm,
      cluster_count: metadata.cluster_count,
      total_errors,
    });
    Ok(ClusteringResult { clusters, metadata })
  }

  /// Drop every cluster and the feature memo.
  pub fn clear(&self) {
    {
      let mut state = self.inner.state.write();
      state.slots.clear();
      state.error_index.clear();
      state.epoch += 1;
      state.generation += 1;
    }
    self.inner.features.clear();
    self.inner.runs.store(0, Ordering::Relaxed);
    *self.inner.last_run.lock() = None;
  }

  // -------------------------------------------------------------------------
  // Queries
  // -------------------------------------------------------------------------

  /// Clusters passing `query`, sorted descending by `query.sort_by`.
  pub fn get_clusters(&self, query: &ClusterQuery) -> Vec<ErrorCluster> {
    let mut clusters: Vec<ErrorCluster> = self
      .inner
      .state
      .read()
      .slots
      .iter()
      .map(|s| &s.cluster)
      .filter(|c| matches_query(c, query))
      .cloned()
      .collect();

    match query.sort_by.unwrap_or_default() {
      ClusterSortBy::Count => clusters.sort_by(|a, b| b.size().cmp(&a.size())),
      ClusterSortBy::Frequency => clusters.sort_by(|a, b| b.stats.frequency.total_cmp(&a.stats.frequency)),
      ClusterSortBy::LastSeen => clusters.sort_by(|a, b| b.stats.last_seen.cmp(&a.stats.last_seen)),
      ClusterSortBy::FirstSeen => clusters.sort_by(|a, b| b.stats.first_seen.cmp(&a.stats.first_seen)),
      ClusterSortBy::Confidence => clusters.sort_by(|a, b| b.confidence.total_cmp(&a.confidence)),
    }
    clusters
  }

  pub fn get_cluster(&self, cluster_id: &str) -> Result<ErrorCluster, EngineError> {
    self
      .inner
      .state
      .read()
      .slot(cluster_id)
      .map(|s| s.cluster.clone())
      .ok_or_else(|| EngineError::cluster_not_found(cluster_id))
  }

  /// The cluster currently holding `error_id`.
  pub fn cluster_for_error(&self, error_id: &str) -> Result<ErrorCluster, EngineError> {
    let state = self.inner.state.read();
    state
      .error_index
      .get(error_id)
      .and_then(|cluster_id| state.slot(cluster_id))
      .map(|s| s.cluster.clone())
      .ok_or_else(|| EngineError::ErrorNotFound(error_id.to_string()))
  }

  /// The `limit` stored errors closest to `error_id`, most similar first.
  pub fn similar_errors(&self, error_id: &str, limit: usize) -> Result<Vec<SimilarError>, EngineError> {
    let state = self.inner.state.read();
    let target = state
      .error_index
      .get(error_id)
      .and_then(|cluster_id| state.slot(cluster_id))
      .and_then(|s| s.cluster.errors.iter().find(|e| e.id == error_id))
      .ok_or_else(|| EngineError::ErrorNotFound(error_id.to_string()))?;

    let mut found: Vec<SimilarError> = state
      .slots
      .iter()
      .flat_map(|s| s.cluster.errors.iter().map(move |e| (s, e)))
      .filter(|(_, e)| e.id != error_id)
      .map(|(s, e)| SimilarError {
        similarity: self.inner.similarity.calculate(target, e),
        cluster_id: s.cluster.id.clone(),
        error: e.clone(),
      })
      .collect();
    found.sort_by(|a, b| b.similarity.overall.total_cmp(&a.similarity.overall));
    found.truncate(limit);
    Ok(found)
  }

  pub fn statistics(&self) -> ClusteringStatistics {
    let state = self.inner.state.read();
    let sizes: Vec<usize> = state.slots.iter().map(|s| s.cluster.size()).collect();
    let total_errors: usize = sizes.iter().sum();
    ClusteringStatistics {
      total_errors,
      total_clusters: sizes.len(),
      average_cluster_size: if sizes.is_empty() {
        0.0
      } else {
        total_errors as f64 / sizes.len() as f64
      },
      largest_cluster: sizes.iter().copied().max().unwrap_or(0),
      singleton_clusters: sizes.iter().filter(|s| **s == 1).count(),
      reclustering_runs: self.inner.runs.load(Ordering::Relaxed),
      last_reclustering: self.inner.last_run.lock().clone(),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
    self.inner.events.subscribe()
  }

  /// Stop automatic reclustering.
  pub async fn shutdown(&self) {
    let task = self.inner.maintenance.lock().take();
    if let Some(task) = task {
      task.shutdown().await;
    }
  }
}

fn matches_query(cluster: &ErrorCluster, query: &ClusterQuery) -> bool {
  let size = cluster.size();
  if query.min_size.is_some_and(|min| size < min) {
    return false;
  }
  if query.max_size.is_some_and(|max| size > max) {
    return false;
  }
  if let Some(severity) = query.severity {
    if !cluster.errors.iter().any(|e| e.severity == Some(severity)) {
      return false;
    }
  }
  if let Some(range) = query.time_range {
    if !range.overlaps(cluster.stats.first_seen, cluster.stats.last_seen) {
      return false;
    }
  }
  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  const T0: i64 = 1_700_000_000_000;

  fn engine_with(config: ClusteringConfig) -> (ClusterEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let config = ClusteringConfig {
      auto_recluster: false,
      ..config
    };
    (ClusterEngine::with_clock(config, clock.clone()), clock)
  }

  fn engine() -> ClusterEngine {
    engine_with(ClusteringConfig::default()).0
  }

  fn err(id: &str, ty: &str, msg: &str) -> ErrorData {
    ErrorData::new(id, ty, msg, T0)
  }

  #[test]
  fn near_duplicates_share_a_cluster() {
    let engine = engine();
    let first = engine.add_error(err("e1", "TypeError", "Cannot read property of undefined"));
    let second = engine.add_error(err("e2", "TypeError", "Cannot read property of null"));
    assert_eq!(first.id, second.id);
    assert_eq!(second.stats.count, 2);
    assert!((second.confidence - 0.6).abs() < 1e-12);
  }

  #[test]
  fn new_cluster_starts_fully_confident() {
    let engine = engine();
    let cluster = engine.add_error(err("e1", "NetworkError", "Network timeout"));
    assert_eq!(cluster.confidence, 1.0);
    assert_eq!(cluster.representative.id, "e1");
  }

  #[test]
  fn re_adding_an_error_is_idempotent() {
    let engine = engine();
    let a = engine.add_error(err("e1", "NetworkError", "Network timeout"));
    let b = engine.add_error(err("e1", "NetworkError", "Network timeout"));
    assert_eq!(a.id, b.id);
    assert_eq!(b.size(), 1);
    assert_eq!(engine.statistics().total_errors, 1);
  }

  #[test]
  fn placement_rescores_when_target_was_merged_away() {
    let engine = engine();
    let a = engine.add_error(err("e1", "TypeError", "Cannot read property of undefined"));
    let b = engine.add_error(err("e2", "NetworkError", "Network timeout"));
    let late = err("e3", "TypeError", "Cannot read property of undefined");
    let features = engine.extract_features(&late);
    let target = engine.inner.best_match(&engine.inner.state.read(), &late, &features);
    assert_eq!(target.as_ref().map(|(id, _)| id.as_str()), Some(a.id.as_str()));

    let merged = engine.merge_clusters(&a.id, &b.id).unwrap();
    let placement = {
      let mut state = engine.inner.state.write();
      engine.inner.place_locked(&mut state, late, &features, target, T0)
    };
    assert_eq!(placement.cluster.id, merged.id);
    assert_eq!(engine.cluster_for_error("e3").unwrap().id, merged.id);
    assert_eq!(engine.statistics().total_clusters, 1);
  }

  #[test]
  fn concurrent_inserts_keep_every_error_indexed() {
    let engine = engine();
    std::thread::scope(|scope| {
      for t in 0..4 {
        let engine = engine.clone();
        scope.spawn(move || {
          for i in 0..20 {
            let (ty, msg) = if i % 2 == 0 {
              ("TypeError", "Cannot read property of undefined")
            } else {
              ("NetworkError", "Network timeout")
            };
            engine.add_error(err(&format!("t{t}-{i}"), ty, msg));
          }
        });
      }
    });

    let stats = engine.statistics();
    assert_eq!(stats.total_errors, 80);
    assert_eq!(stats.total_clusters, 2);
    for t in 0..4 {
      for i in 0..20 {
        assert!(engine.cluster_for_error(&format!("t{t}-{i}")).is_ok());
      }
    }
  }

  #[test]
  fn merge_repoints_members_and_discounts_confidence() {
    let engine = engine();
    let a = engine.add_error(err("e1", "NetworkError", "Network timeout"));
    let b = engine.add_error(err("e2", "SyntaxError", "Invalid JSON format"));
    assert_ne!(a.id, b.id);

    let merged = engine.merge_clusters(&a.id, &b.id).unwrap();
    assert_eq!(merged.size(), 2);
    assert!((merged.confidence - 0.9).abs() < 1e-12);
    assert_eq!(engine.cluster_for_error("e1").unwrap().id, merged.id);
    assert_eq!(engine.cluster_for_error("e2").unwrap().id, merged.id);
    assert!(engine.get_cluster(&a.id).unwrap_err().is_not_found());
    assert_eq!(engine.statistics().total_clusters, 1);
  }

  #[test]
  fn merge_rejects_unknown_and_self() {
    let engine = engine();
    let a = engine.add_error(err("e1", "NetworkError", "Network timeout"));
    assert!(matches!(
      engine.merge_clusters(&a.id, "missing"),
      Err(EngineError::ClusterNotFound(id)) if id == "missing"
    ));
    assert!(matches!(engine.merge_clusters(&a.id, &a.id), Err(EngineError::SelfMerge(_))));
    assert_eq!(engine.get_cluster(&a.id).unwrap().size(), 1);
  }

  #[test]
  fn representative_refresh_waits_for_interval() {
    let config = ClusteringConfig {
      representative_refresh_every: 2,
      min_similarity: 0.5,
      ..ClusteringConfig::default()
    };
    let (engine, clock) = engine_with(config);
    engine.add_error(err("a", "TypeError", "Cannot read property x of undefined in list"));
    let c = engine.add_error(err("b", "TypeError", "Cannot read property x of undefined"));
    // Size 2 hits the insertion count, but no time has passed.
    assert_eq!(c.representative.id, "a");

    clock.advance(60 * 60 * 1000);
    engine.add_error(err("c", "TypeError", "Cannot read property x of undefined"));
    let d = engine.add_error(err("d", "TypeError", "Cannot read property x of undefined"));
    assert_eq!(d.size(), 4);
    assert_ne!(d.representative.id, "a");
  }

  #[test]
  fn offline_mode_keeps_centroid() {
    let config = ClusteringConfig {
      online_learning: false,
      ..ClusteringConfig::default()
    };
    let (engine, _) = engine_with(config);
    let first = engine.add_error(err("e1", "TypeError", "Cannot read property of undefined"));
    let second = engine.add_error(err("e2", "TypeError", "Cannot read property of null"));
    assert_eq!(second.size(), 2);
    assert_eq!(first.features, second.features);
  }

  #[test]
  fn query_filters_and_sorts() {
    let engine = engine();
    engine.add_error(err("a1", "TypeError", "Cannot read property of undefined"));
    engine.add_error(err("a2", "TypeError", "Cannot read property of undefined"));
    let mut critical = ErrorData::new("b1", "NetworkError", "Network timeout", T0 + 10_000);
    critical.severity = Some(ErrorSeverity::Critical);
    engine.add_error(critical);

    let all = engine.get_clusters(&ClusterQuery::default());
    assert_eq!(all.iter().map(ErrorCluster::size).collect::<Vec<_>>(), vec![2, 1]);

    let big = engine.get_clusters(&ClusterQuery {
      min_size: Some(2),
      ..ClusterQuery::default()
    });
    assert_eq!(big.len(), 1);

    let critical_only = engine.get_clusters(&ClusterQuery {
      severity: Some(ErrorSeverity::Critical),
      ..ClusterQuery::default()
    });
    assert_eq!(critical_only.len(), 1);
    assert_eq!(critical_only[0].errors[0].id, "b1");

    let latest_first = engine.get_clusters(&ClusterQuery {
      sort_by: Some(ClusterSortBy::LastSeen),
      ..ClusterQuery::default()
    });
    assert_eq!(latest_first[0].errors[0].id, "b1");

    let window = engine.get_clusters(&ClusterQuery {
      time_range: Some(TimeRange {
        start: T0 + 5_000,
        end: T0 + 20_000,
      }),
      ..ClusterQuery::default()
    });
    assert_eq!(window.len(), 1);
  }

  #[test]
  fn similar_errors_ranks_closest_first() {
    let engine = engine();
    engine.add_error(err("a", "TypeError", "Cannot read property of undefined"));
    engine.add_error(err("b", "TypeError", "Cannot read property of null"));
    engine.add_error(err("c", "NetworkError", "Network timeout"));

    let similar = engine.similar_errors("a", 5).unwrap();
    assert_eq!(similar.len(), 2);
    assert_eq!(similar[0].error.id, "b");
    assert!(similar[0].similarity.overall > similar[1].similarity.overall);
    assert!(engine.similar_errors("zzz", 5).unwrap_err().is_not_found());
  }

  #[tokio::test]
  async fn reclustering_preserves_every_error() {
    let (engine, _) = engine_with(ClusteringConfig::default());
    for (i, msg) in ["Network timeout", "Network timeout", "Invalid JSON format"].iter().enumerate() {
      engine.add_error(ErrorData::new(format!("e{i}"), "E", *msg, T0 + i as i64));
    }
    let first = engine.perform_reclustering().await.unwrap();
    let second = engine.perform_reclustering().await.unwrap();
    assert_eq!(first.metadata.total_errors, 3);
    assert_eq!(second.metadata.total_errors, 3);
    assert_eq!(first.metadata.cluster_count, second.metadata.cluster_count);
    assert_eq!(first.metadata.algorithm, ClusteringAlgorithm::Adaptive);
    assert_eq!(engine.statistics().reclustering_runs, 2);
    for id in ["e0", "e1", "e2"] {
      assert!(engine.cluster_for_error(id).is_ok());
    }
  }

  #[tokio::test]
  async fn reclustered_singletons_use_size_confidence() {
    let engine = engine();
    let online = engine.add_error(err("a", "NetworkError", "Network timeout"));
    assert_eq!(online.confidence, 1.0);

    let result = engine.perform_reclustering().await.unwrap();
    assert_eq!(result.clusters.len(), 1);
    assert!((result.clusters[0].confidence - cluster_confidence(1)).abs() < 1e-12);
    assert!((result.clusters[0].confidence - 0.55).abs() < 1e-12);
  }

  #[tokio::test]
  async fn reclustering_publishes_event() {
    let engine = engine();
    let mut events = engine.subscribe();
    engine.add_error(err("a", "E", "boom"));
    engine.perform_reclustering().await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), ClusterEvent::Created { .. }));
    assert!(matches!(
      events.recv().await.unwrap(),
      ClusterEvent::Reclustered { total_errors: 1, .. }
    ));
  }

  #[test]
  fn clear_drops_everything() {
    let engine = engine();
    engine.add_error(err("a", "E", "boom"));
    engine.clear();
    let stats = engine.statistics();
    assert_eq!(stats.total_errors, 0);
    assert_eq!(stats.total_clusters, 0);
    assert!(engine.cluster_for_error("a").is_err());
  }
}
