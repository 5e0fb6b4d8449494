//! Primary tables for logs, traces and metrics plus the shared time index.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::time_index::{EntityKind, IndexEntry, TimeBucketIndex};
use crate::types::{LogEntry, MetricEntry, TraceEntry};

/// What one retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub logs: usize,
  pub traces: usize,
  pub metrics: usize,
  pub index_entries: usize,
  pub cache_entries: usize,
}

impl SweepReport {
  pub fn total(&self) -> usize {
    self.logs + self.traces + self.metrics
  }
}

#[derive(Debug)]
pub struct TelemetryStore {
  pub(crate) logs: HashMap<String, LogEntry>,
  /// Pattern tokens per log id, extracted once at ingestion.
  pub(crate) log_tokens: HashMap<String, BTreeSet<String>>,
  /// Keyed by `trace_id:span_id`.
  pub(crate) traces: HashMap<String, TraceEntry>,
  /// Keyed by `name:timestamp`.
  pub(crate) metrics: HashMap<String, MetricEntry>,
  /// trace_id -> span keys.
  spans_by_trace: HashMap<String, Vec<String>>,
  /// trace_id -> log ids.
  logs_by_trace: HashMap<String, Vec<String>>,
  pub(crate) index: TimeBucketIndex,
}

impl TelemetryStore {
  pub fn new(index_size: usize) -> Self {
    Self {
      logs: HashMap::new(),
      log_tokens: HashMap::new(),
      traces: HashMap::new(),
      metrics: HashMap::new(),
      spans_by_trace: HashMap::new(),
      logs_by_trace: HashMap::new(),
      index: TimeBucketIndex::new(index_size),
    }
  }

  pub fn insert_log(&mut self, log: LogEntry, tokens: BTreeSet<String>) {
    // Re-ingesting an id replaces the old record everywhere.
    if let Some(previous) = self.logs.remove(&log.id) {
      self.unlink_log(&previous);
    }
    if let Some(trace_id) = log.trace_id() {
      self
        .logs_by_trace
        .entry(trace_id.to_string())
        .or_default()
        .push(log.id.clone());
    }
    self.index.insert(IndexEntry::new(log.id.clone(), log.timestamp, EntityKind::Log));
    self.log_tokens.insert(log.id.clone(), tokens);
    self.logs.insert(log.id.clone(), log);
  }

  pub fn insert_trace(&mut self, trace: TraceEntry) {
    let key = trace.key();
    if let Some(previous) = self.traces.remove(&key) {
      self.unlink_trace(&key, &previous);
    }
    self
      .spans_by_trace
      .entry(trace.trace_id.clone())
      .or_default()
      .push(key.clone());
    self.index.insert(IndexEntry::new(key.clone(), trace.start_time, EntityKind::Trace));
    self.traces.insert(key, trace);
  }

  pub fn insert_metric(&mut self, metric: MetricEntry) {
    let key = metric.key();
    if self.metrics.remove(&key).is_some() {
      self.index.remove(&key, EntityKind::Metric, metric.timestamp);
    }
    self.index.insert(IndexEntry::new(key.clone(), metric.timestamp, EntityKind::Metric));
    self.metrics.insert(key, metric);
  }

  pub fn log(&self, id: &str) -> Option<&LogEntry> {
    self.logs.get(id)
  }

  /// True if any span or log carries `trace_id`.
  pub fn knows_trace(&self, trace_id: &str) -> bool {
    self.spans_by_trace.contains_key(trace_id) || self.logs_by_trace.contains_key(trace_id)
  }

  /// Every span recorded for `trace_id`, ordered by start time.
  pub fn traces_for(&self, trace_id: &str) -> Vec<&TraceEntry> {
    let mut spans: Vec<&TraceEntry> = self
      .spans_by_trace
      .get(trace_id)
      .into_iter()
      .flatten()
      .filter_map(|key| self.traces.get(key))
      .collect();
    spans.sort_by_key(|t| t.start_time);
    spans
  }

  /// Every log carrying `trace_id`, ordered by timestamp.
  pub fn logs_for(&self, trace_id: &str) -> Vec<&LogEntry> {
    let mut logs: Vec<&LogEntry> = self
      .logs_by_trace
      .get(trace_id)
      .into_iter()
      .flatten()
      .filter_map(|id| self.logs.get(id))
      .collect();
    logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    logs
  }

  /// Remove everything older than `cutoff` from the tables and the index.
  pub fn sweep(&mut self, cutoff: i64) -> SweepReport {
    let indexed_before = self.index.len();
    let stale_logs: Vec<LogEntry> = self
      .logs
      .values()
      .filter(|l| l.timestamp < cutoff)
      .cloned()
      .collect();
    for log in &stale_logs {
      self.logs.remove(&log.id);
      self.unlink_log(log);
    }

    let stale_traces: Vec<(String, TraceEntry)> = self
      .traces
      .iter()
      .filter(|(_, t)| t.start_time < cutoff)
      .map(|(k, t)| (k.clone(), t.clone()))
      .collect();
    for (key, trace) in &stale_traces {
      self.traces.remove(key);
      self.unlink_trace(key, trace);
    }

    let metrics_before = self.metrics.len();
    self.metrics.retain(|_, m| m.timestamp >= cutoff);
    let metrics = metrics_before - self.metrics.len();

    self.index.prune_before(cutoff);
    let index_entries = indexed_before - self.index.len();

    SweepReport {
      logs: stale_logs.len(),
      traces: stale_traces.len(),
      metrics,
      index_entries,
      cache_entries: 0,
    }
  }

  pub fn clear(&mut self) {
    self.logs.clear();
    self.log_tokens.clear();
    self.traces.clear();
    self.metrics.clear();
    self.spans_by_trace.clear();
    self.logs_by_trace.clear();
    self.index.clear();
  }

  fn unlink_log(&mut self, log: &LogEntry) {
    self.log_tokens.remove(&log.id);
    self.index.remove(&log.id, EntityKind::Log, log.timestamp);
    if let Some(trace_id) = log.trace_id() {
      if let Some(ids) = self.logs_by_trace.get_mut(trace_id) {
        ids.retain(|id| id != &log.id);
        if ids.is_empty() {
          self.logs_by_trace.remove(trace_id);
        }
      }
    }
  }

  fn unlink_trace(&mut self, key: &str, trace: &TraceEntry) {
    self.index.remove(key, EntityKind::Trace, trace.start_time);
    if let Some(keys) = self.spans_by_trace.get_mut(&trace.trace_id) {
      keys.retain(|k| k != key);
      if keys.is_empty() {
        self.spans_by_trace.remove(&trace.trace_id);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{LogLevel, MetricType, TraceContext};

  fn traced_log(id: &str, ts: i64, trace_id: &str) -> LogEntry {
    let mut log = LogEntry::new(id, ts, LogLevel::Info, "hello");
    log.trace_context = Some(TraceContext {
      trace_id: trace_id.into(),
      span_id: "s".into(),
    });
    log
  }

  #[test]
  fn trace_lookups_follow_inserts() {
    let mut store = TelemetryStore::new(100);
    store.insert_trace(TraceEntry::new("t1", "b", "db.query", 2_000));
    store.insert_trace(TraceEntry::new("t1", "a", "http.request", 1_000));
    store.insert_log(traced_log("l1", 1_500, "t1"), BTreeSet::new());

    let spans: Vec<_> = store.traces_for("t1").iter().map(|t| t.span_id.clone()).collect();
    assert_eq!(spans, vec!["a", "b"]);
    assert_eq!(store.logs_for("t1").len(), 1);
    assert_eq!(store.index.len(), 3);
  }

  #[test]
  fn reingesting_a_log_does_not_duplicate() {
    let mut store = TelemetryStore::new(100);
    store.insert_log(traced_log("l1", 1_000, "t1"), BTreeSet::new());
    store.insert_log(traced_log("l1", 1_200, "t1"), BTreeSet::new());
    assert_eq!(store.logs.len(), 1);
    assert_eq!(store.log_tokens.len(), 1);
    assert_eq!(store.logs_for("t1").len(), 1);
    assert_eq!(store.index.len(), 1);
  }

  #[test]
  fn sweep_removes_from_tables_and_index() {
    let mut store = TelemetryStore::new(100);
    store.insert_log(traced_log("old", 1_000, "t1"), BTreeSet::new());
    store.insert_log(traced_log("new", 50_000, "t1"), BTreeSet::new());
    store.insert_trace(TraceEntry::new("t1", "a", "op", 1_000));
    store.insert_metric(MetricEntry::new("cpu", 0.5, 1_000, MetricType::Gauge));

    let report = store.sweep(10_000);
    assert_eq!(report.logs, 1);
    assert_eq!(report.traces, 1);
    assert_eq!(report.metrics, 1);
    assert_eq!(store.index.len(), 1);
    assert!(store.traces_for("t1").is_empty());
    assert_eq!(store.logs_for("t1").len(), 1);
  }
}
