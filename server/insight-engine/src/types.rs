//! Core types for the insight engines (ingested records + query results).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::ClusteringAlgorithm;

// ---------------------------------------------------------------------------
// Telemetry records (what the instrumentation layer hands us)
// ---------------------------------------------------------------------------

/// Parsed leniently: `WARNING`, `err`, `critical` and friends are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum LogLevel {
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
}

impl LogLevel {
  pub fn from_str_loose(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "debug" | "trace" => Some(Self::Debug),
      "info" => Some(Self::Info),
      "warn" | "warning" => Some(Self::Warn),
      "error" | "err" => Some(Self::Error),
      "fatal" | "critical" => Some(Self::Fatal),
      _ => None,
    }
  }

  /// Error and fatal logs are correlated eagerly when real-time mode is on.
  pub fn is_error(self) -> bool {
    self >= Self::Error
  }
}

impl TryFrom<String> for LogLevel {
  type Error = String;

  fn try_from(s: String) -> Result<Self, <LogLevel as TryFrom<String>>::Error> {
    Self::from_str_loose(s.trim()).ok_or_else(|| format!("unknown log level {s:?}"))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
  pub trace_id: String,
  pub span_id: String,
}

/// One log line. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
  pub id: String,
  /// Epoch milliseconds.
  pub timestamp: i64,
  pub level: LogLevel,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub logger: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub trace_context: Option<TraceContext>,
  #[serde(default, skip_serializing_if = "HashMap::is_empty")]
  pub metadata: HashMap<String, serde_json::Value>,
  #[serde(default, skip_serializing_if = "HashMap::is_empty")]
  pub tags: HashMap<String, String>,
}

impl LogEntry {
  pub fn new(id: impl Into<String>, timestamp: i64, level: LogLevel, message: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      timestamp,
      level,
      message: message.into(),
      logger: None,
      trace_context: None,
      metadata: HashMap::new(),
      tags: HashMap::new(),
    }
  }

  pub fn trace_id(&self) -> Option<&str> {
    self
      .trace_context
      .as_ref()
      .map(|ctx| ctx.trace_id.as_str())
      .filter(|id| !id.is_empty())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
  Ok,
  Error,
  Timeout,
}

/// A completed span. Keyed by `(trace_id, span_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
  pub trace_id: String,
  pub span_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent_span_id: Option<String>,
  pub operation_name: String,
  pub start_time: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_time: Option<i64>,
  #[serde(default, skip_serializing_if = "HashMap::is_empty")]
  pub tags: HashMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<SpanStatus>,
}

impl TraceEntry {
  pub fn new(
    trace_id: impl Into<String>,
    span_id: impl Into<String>,
    operation_name: impl Into<String>,
    start_time: i64,
  ) -> Self {
    Self {
      trace_id: trace_id.into(),
      span_id: span_id.into(),
      parent_span_id: None,
      operation_name: operation_name.into(),
      start_time,
      end_time: None,
      tags: HashMap::new(),
      status: None,
    }
  }

  /// Index key: `trace_id:span_id`.
  pub fn key(&self) -> String {
    format!("{}:{}", self.trace_id, self.span_id)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
  Counter,
  Gauge,
  Histogram,
  Timer,
}

/// A metric sample. Keyed by `(name, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEntry {
  pub name: String,
  pub value: f64,
  pub timestamp: i64,
  #[serde(default, skip_serializing_if = "HashMap::is_empty")]
  pub tags: HashMap<String, String>,
  #[serde(rename = "type")]
  pub metric_type: MetricType,
}

impl MetricEntry {
  pub fn new(name: impl Into<String>, value: f64, timestamp: i64, metric_type: MetricType) -> Self {
    Self {
      name: name.into(),
      value,
      timestamp,
      tags: HashMap::new(),
      metric_type,
    }
  }

  /// Index key: `name:timestamp`.
  pub fn key(&self) -> String {
    format!("{}:{}", self.name, self.timestamp)
  }
}

// ---------------------------------------------------------------------------
// Correlation output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationStrategy {
  TraceId,
  TimeWindow,
  MetadataMatch,
  PatternMatch,
}

impl CorrelationStrategy {
  /// Priority order in which strategies are tried.
  pub const ORDER: [Self; 4] = [
    Self::TraceId,
    Self::TimeWindow,
    Self::MetadataMatch,
    Self::PatternMatch,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::TraceId => "trace_id",
      Self::TimeWindow => "time_window",
      Self::MetadataMatch => "metadata_match",
      Self::PatternMatch => "pattern_match",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationMetadata {
  pub correlation_duration_ms: f64,
  pub items_checked: usize,
  pub strategy: CorrelationStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationResult {
  pub log: LogEntry,
  pub traces: Vec<TraceEntry>,
  pub metrics: Vec<MetricEntry>,
  /// Never contains the subject log.
  pub related_logs: Vec<LogEntry>,
  pub confidence: f64,
  pub correlated_at: i64,
  pub metadata: CorrelationMetadata,
}

impl CorrelationResult {
  pub fn is_empty(&self) -> bool {
    self.traces.is_empty() && self.metrics.is_empty() && self.related_logs.is_empty()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrelationStatistics {
  pub total_logs: usize,
  pub total_traces: usize,
  pub total_metrics: usize,
  pub indexed_entries: usize,
  pub time_buckets: usize,
  pub correlations_performed: u64,
  pub average_correlation_ms: f64,
  pub cache_size: usize,
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub cache_hit_rate: f64,
}

// ---------------------------------------------------------------------------
// Error reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
  Low,
  Medium,
  High,
  Critical,
}

/// One captured error. Immutable once ingested; identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
  pub id: String,
  pub message: String,
  #[serde(rename = "type")]
  pub error_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stack_trace: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub filename: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lineno: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub colno: Option<u32>,
  pub timestamp: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_agent: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub session_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub context: Option<BTreeMap<String, serde_json::Value>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub severity: Option<ErrorSeverity>,
}

impl ErrorData {
  pub fn new(
    id: impl Into<String>,
    error_type: impl Into<String>,
    message: impl Into<String>,
    timestamp: i64,
  ) -> Self {
    Self {
      id: id.into(),
      message: message.into(),
      error_type: error_type.into(),
      stack_trace: None,
      filename: None,
      lineno: None,
      colno: None,
      timestamp,
      user_agent: None,
      url: None,
      user_id: None,
      session_id: None,
      context: None,
      severity: None,
    }
  }

  /// Context map if present and non-empty.
  pub fn context(&self) -> Option<&BTreeMap<String, serde_json::Value>> {
    self.context.as_ref().filter(|ctx| !ctx.is_empty())
  }

  /// Stack trace if present and non-blank.
  pub fn stack(&self) -> Option<&str> {
    self.stack_trace.as_deref().filter(|s| !s.trim().is_empty())
  }
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

/// Fixed-length numeric description of an error (or a cluster centroid).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFeatures {
  pub text: Vec<f64>,
  pub stack: Vec<f64>,
  pub location: Vec<f64>,
  pub context: Vec<f64>,
  pub combined_features: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
  pub count: usize,
  pub first_seen: i64,
  pub last_seen: i64,
  /// Errors per hour over `[first_seen, last_seen]`.
  pub frequency: f64,
  pub affected_users: usize,
  pub affected_sessions: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub common_browser: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub common_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCluster {
  pub id: String,
  pub created_at: i64,
  pub updated_at: i64,
  pub representative: ErrorData,
  pub errors: Vec<ErrorData>,
  pub stats: ClusterStats,
  /// Centroid of the members' features.
  pub features: ClusterFeatures,
  pub confidence: f64,
}

impl ErrorCluster {
  pub fn size(&self) -> usize {
    self.errors.len()
  }

  pub fn contains(&self, error_id: &str) -> bool {
    self.errors.iter().any(|e| e.id == error_id)
  }
}

/// Component breakdown of a pairwise error comparison.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityScore {
  pub overall: f64,
  pub message: f64,
  pub stack: f64,
  pub error_type: f64,
  pub context: f64,
  pub location: f64,
  /// How much comparable data both errors supplied (0..1).
  pub confidence: f64,
}

/// Another stored error and how close it is to the one asked about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarError {
  pub error: ErrorData,
  pub cluster_id: String,
  pub similarity: SimilarityScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringMetadata {
  /// Algorithm that produced the clusters (after any fallback).
  pub algorithm: ClusteringAlgorithm,
  pub requested_algorithm: ClusteringAlgorithm,
  pub total_errors: usize,
  pub cluster_count: usize,
  pub average_cluster_size: f64,
  pub accuracy: f64,
  pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringResult {
  pub clusters: Vec<ErrorCluster>,
  pub metadata: ClusteringMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
  pub start: i64,
  pub end: i64,
}

impl TimeRange {
  pub fn contains(&self, ts: i64) -> bool {
    ts >= self.start && ts <= self.end
  }

  pub fn overlaps(&self, start: i64, end: i64) -> bool {
    start <= self.end && end >= self.start
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSortBy {
  #[default]
  Count,
  Frequency,
  LastSeen,
  FirstSeen,
  Confidence,
}

/// Filter for `get_clusters`. All fields optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQuery {
  #[serde(default)]
  pub min_size: Option<usize>,
  #[serde(default)]
  pub max_size: Option<usize>,
  #[serde(default)]
  pub severity: Option<ErrorSeverity>,
  #[serde(default)]
  pub time_range: Option<TimeRange>,
  #[serde(default)]
  pub sort_by: Option<ClusterSortBy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusteringStatistics {
  pub total_errors: usize,
  pub total_clusters: usize,
  pub average_cluster_size: f64,
  pub largest_cluster: usize,
  pub singleton_clusters: usize,
  pub reclustering_runs: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub last_reclustering: Option<ClusteringMetadata>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn log_levels_parse_leniently() {
    let log: LogEntry =
      serde_json::from_str(r#"{"id": "l1", "timestamp": 1, "level": "WARNING", "message": "disk"}"#).unwrap();
    assert_eq!(log.level, LogLevel::Warn);
    assert_eq!(serde_json::to_string(&LogLevel::Fatal).unwrap(), r#""fatal""#);
    assert!(serde_json::from_str::<LogLevel>(r#""loud""#).is_err());
  }
}
