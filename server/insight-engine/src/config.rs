//! Engine configuration with sane defaults.

use serde::{Deserialize, Serialize};

/// Tunables for the correlation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
  /// Half-width of the time-window strategy, in ms.
  pub correlation_window_ms: i64,
  /// Max cached correlation results before oldest-first eviction.
  pub max_correlations: usize,
  /// Lifetime of a cached correlation result, in ms.
  pub cache_ttl_ms: i64,
  /// Max entries held per one-second time bucket.
  pub index_size: usize,
  /// Logs/traces/metrics older than this are dropped by the sweep.
  pub retention_ms: i64,
  /// Period of the retention sweep.
  pub cleanup_interval_ms: u64,
  pub enable_caching: bool,
  /// Correlate error/fatal logs in the background as they are ingested.
  pub enable_realtime: bool,
  /// In-flight correlations for batch requests.
  pub batch_concurrency: usize,
  /// Buffered events per subscriber before lagging.
  pub event_capacity: usize,
}

impl Default for CorrelationConfig {
  fn default() -> Self {
    Self {
      correlation_window_ms: 100,
      max_correlations: 10_000,
      cache_ttl_ms: 5 * 60 * 1000,
      index_size: 1000,
      retention_ms: 24 * 60 * 60 * 1000,
      cleanup_interval_ms: 60 * 1000,
      enable_caching: true,
      enable_realtime: true,
      batch_concurrency: 5,
      event_capacity: 256,
    }
  }
}

/// Which algorithm a full reclustering pass uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusteringAlgorithm {
  Kmeans,
  Dbscan,
  Hierarchical,
  #[default]
  Adaptive,
}

impl ClusteringAlgorithm {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "kmeans" | "k-means" => Some(Self::Kmeans),
      "dbscan" => Some(Self::Dbscan),
      "hierarchical" | "agglomerative" => Some(Self::Hierarchical),
      "adaptive" => Some(Self::Adaptive),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Kmeans => "kmeans",
      Self::Dbscan => "dbscan",
      Self::Hierarchical => "hierarchical",
      Self::Adaptive => "adaptive",
    }
  }
}

/// Which feature groups feed `combined_features`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStrategy {
  /// Text, stack, location and context.
  #[default]
  Combined,
  /// Only the message vocabulary counts.
  Text,
  /// Stack, location and context; text zeroed.
  Structural,
}

/// Per-component weights of the pairwise error similarity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
  pub message: f64,
  pub stack: f64,
  pub error_type: f64,
  pub context: f64,
  pub location: f64,
}

impl Default for SimilarityWeights {
  fn default() -> Self {
    Self {
      message: 0.4,
      stack: 0.3,
      error_type: 0.15,
      context: 0.1,
      location: 0.05,
    }
  }
}

/// Tunables for the clustering engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
  /// Blended score needed to join an existing cluster.
  pub min_similarity: f64,
  pub max_clusters: usize,
  pub algorithm: ClusteringAlgorithm,
  pub feature_strategy: FeatureStrategy,
  /// Period of the automatic reclustering pass.
  pub recluster_interval_ms: u64,
  /// Smallest group a reclustering pass keeps as a multi-member cluster.
  pub min_errors_per_cluster: usize,
  /// Update centroid/representative on every insertion.
  pub online_learning: bool,
  pub weights: SimilarityWeights,
  /// Representative search runs on every Nth insertion into a cluster...
  pub representative_refresh_every: usize,
  /// ...and only when this long has passed since the previous search.
  pub representative_refresh_ms: i64,
  pub auto_recluster: bool,
  pub event_capacity: usize,
}

impl Default for ClusteringConfig {
  fn default() -> Self {
    Self {
      min_similarity: 0.85,
      max_clusters: 100,
      algorithm: ClusteringAlgorithm::Adaptive,
      feature_strategy: FeatureStrategy::Combined,
      recluster_interval_ms: 60 * 60 * 1000,
      min_errors_per_cluster: 2,
      online_learning: true,
      weights: SimilarityWeights::default(),
      representative_refresh_every: 10,
      representative_refresh_ms: 60 * 60 * 1000,
      auto_recluster: true,
      event_capacity: 256,
    }
  }
}
