//! The four ranked correlation heuristics.
//!
//! Each strategy scans the store for one subject log and reports what it
//! found, how many records it looked at, and a confidence in `[0, 1]`.

use std::collections::{BTreeSet, HashMap};

use crate::correlation::store::TelemetryStore;
use crate::text::{jaccard, TokenExtractor};
use crate::time_index::EntityKind;
use crate::types::{CorrelationStrategy, LogEntry, MetricEntry, TraceEntry};

const TRACE_ID_CONFIDENCE: f64 = 0.95;
const TIME_WINDOW_CAP: f64 = 0.8;
const TIME_WINDOW_STEP: f64 = 0.1;
const METADATA_CAP: f64 = 0.7;
const METADATA_STEP: f64 = 0.15;
const PATTERN_CAP: f64 = 0.6;
const PATTERN_STEP: f64 = 0.1;
/// Jaccard similarity a sibling log must exceed to count as a pattern match.
const PATTERN_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone)]
pub(crate) struct StrategyOutcome {
  pub strategy: CorrelationStrategy,
  pub traces: Vec<TraceEntry>,
  pub metrics: Vec<MetricEntry>,
  pub logs: Vec<LogEntry>,
  pub confidence: f64,
  pub items_checked: usize,
}

impl StrategyOutcome {
  pub fn empty(strategy: CorrelationStrategy) -> Self {
    Self {
      strategy,
      traces: Vec::new(),
      metrics: Vec::new(),
      logs: Vec::new(),
      confidence: 0.0,
      items_checked: 0,
    }
  }

  fn sorted(mut self) -> Self {
    self
      .traces
      .sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.span_id.cmp(&b.span_id)));
    self
      .metrics
      .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
    self
      .logs
      .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    self
  }
}

pub(crate) struct StrategyContext<'a> {
  pub window_ms: i64,
  pub tokens: &'a dyn TokenExtractor,
}

pub(crate) fn run(
  strategy: CorrelationStrategy,
  store: &TelemetryStore,
  log: &LogEntry,
  ctx: &StrategyContext<'_>,
) -> StrategyOutcome {
  let outcome = match strategy {
    CorrelationStrategy::TraceId => by_trace_id(store, log),
    CorrelationStrategy::TimeWindow => by_time_window(store, log, ctx.window_ms),
    CorrelationStrategy::MetadataMatch => by_metadata(store, log),
    CorrelationStrategy::PatternMatch => by_pattern(store, log, ctx.tokens),
  };
  outcome.sorted()
}

fn by_trace_id(store: &TelemetryStore, log: &LogEntry) -> StrategyOutcome {
  let mut outcome = StrategyOutcome::empty(CorrelationStrategy::TraceId);
  let Some(trace_id) = log.trace_id() else {
    return outcome;
  };

  outcome.traces = store.traces_for(trace_id).into_iter().cloned().collect();
  outcome.logs = store
    .logs_for(trace_id)
    .into_iter()
    .filter(|l| l.id != log.id)
    .cloned()
    .collect();
  outcome.items_checked = outcome.traces.len() + outcome.logs.len();
  if !outcome.traces.is_empty() {
    outcome.confidence = TRACE_ID_CONFIDENCE;
  }
  outcome
}

fn by_time_window(store: &TelemetryStore, log: &LogEntry, window_ms: i64) -> StrategyOutcome {
  let mut outcome = StrategyOutcome::empty(CorrelationStrategy::TimeWindow);
  let start = log.timestamp.saturating_sub(window_ms);
  let end = log.timestamp.saturating_add(window_ms);

  for entry in store.index.range(start, end) {
    outcome.items_checked += 1;
    match entry.kind {
      EntityKind::Log if entry.id != log.id => {
        if let Some(found) = store.logs.get(&entry.id) {
          outcome.logs.push(found.clone());
        }
      }
      EntityKind::Log => {}
      EntityKind::Trace => {
        if let Some(found) = store.traces.get(&entry.id) {
          outcome.traces.push(found.clone());
        }
      }
      EntityKind::Metric => {
        if let Some(found) = store.metrics.get(&entry.id) {
          outcome.metrics.push(found.clone());
        }
      }
    }
  }

  let matches = outcome.traces.len() + outcome.metrics.len() + outcome.logs.len();
  outcome.confidence = (matches as f64 * TIME_WINDOW_STEP).min(TIME_WINDOW_CAP);
  outcome
}

/// Tags plus scalar metadata values of a log, stringified. Tags win on
/// key collisions.
fn match_keys(log: &LogEntry) -> HashMap<&str, String> {
  let mut keys: HashMap<&str, String> = log
    .metadata
    .iter()
    .filter_map(|(k, v)| {
      let value = match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        _ => return None,
      };
      Some((k.as_str(), value))
    })
    .collect();
  for (k, v) in &log.tags {
    keys.insert(k.as_str(), v.clone());
  }
  keys
}

fn shares_tag(keys: &HashMap<&str, String>, tags: &HashMap<String, String>) -> bool {
  tags
    .iter()
    .any(|(k, v)| keys.get(k.as_str()).is_some_and(|mine| mine == v))
}

fn by_metadata(store: &TelemetryStore, log: &LogEntry) -> StrategyOutcome {
  let mut outcome = StrategyOutcome::empty(CorrelationStrategy::MetadataMatch);
  let keys = match_keys(log);
  if keys.is_empty() {
    return outcome;
  }

  for trace in store.traces.values() {
    outcome.items_checked += 1;
    if shares_tag(&keys, &trace.tags) {
      outcome.traces.push(trace.clone());
    }
  }
  for metric in store.metrics.values() {
    outcome.items_checked += 1;
    if shares_tag(&keys, &metric.tags) {
      outcome.metrics.push(metric.clone());
    }
  }

  let matches = outcome.traces.len() + outcome.metrics.len();
  outcome.confidence = (matches as f64 * METADATA_STEP).min(METADATA_CAP);
  outcome
}

fn by_pattern(store: &TelemetryStore, log: &LogEntry, extractor: &dyn TokenExtractor) -> StrategyOutcome {
  let mut outcome = StrategyOutcome::empty(CorrelationStrategy::PatternMatch);
  let subject: BTreeSet<String> = match store.log_tokens.get(&log.id) {
    Some(tokens) => tokens.clone(),
    None => extractor.extract(&log.message),
  };
  if subject.is_empty() {
    return outcome;
  }

  for other in store.logs.values() {
    if other.id == log.id {
      continue;
    }
    outcome.items_checked += 1;
    let similarity = match store.log_tokens.get(&other.id) {
      Some(tokens) => jaccard(&subject, tokens),
      None => jaccard(&subject, &extractor.extract(&other.message)),
    };
    if similarity > PATTERN_THRESHOLD {
      outcome.logs.push(other.clone());
    }
  }

  outcome.confidence = (outcome.logs.len() as f64 * PATTERN_STEP).min(PATTERN_CAP);
  outcome
}
