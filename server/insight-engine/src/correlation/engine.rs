//! Correlation engine: holds the telemetry tables, ranks strategies, caches
//! results and runs the retention sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::background::BackgroundTask;
use crate::cache::CorrelationCache;
use crate::clock::{Clock, SystemClock};
use crate::config::CorrelationConfig;
use crate::correlation::store::{SweepReport, TelemetryStore};
use crate::correlation::strategy::{self, StrategyContext, StrategyOutcome};
use crate::error::EngineError;
use crate::events::{CorrelationEvent, EventBus};
use crate::text::{PatternTokenExtractor, TokenExtractor};
use crate::types::*;

/// A strategy at or above this confidence ends the search early.
const EARLY_STOP_CONFIDENCE: f64 = 0.9;

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CorrelationEngine {
  inner: Arc<Inner>,
}

struct Inner {
  config: CorrelationConfig,
  clock: Arc<dyn Clock>,
  tokens: Arc<dyn TokenExtractor>,
  store: RwLock<TelemetryStore>,
  cache: Mutex<CorrelationCache>,
  correlations: AtomicU64,
  correlation_micros: AtomicU64,
  events: EventBus<CorrelationEvent>,
  maintenance: Mutex<Option<BackgroundTask>>,
}

impl CorrelationEngine {
  pub fn new(config: CorrelationConfig) -> Self {
    Self::with_components(config, Arc::new(SystemClock), Arc::new(PatternTokenExtractor))
  }

  pub fn with_defaults() -> Self {
    Self::new(CorrelationConfig::default())
  }

  pub fn with_clock(config: CorrelationConfig, clock: Arc<dyn Clock>) -> Self {
    Self::with_components(config, clock, Arc::new(PatternTokenExtractor))
  }

  /// Build with a custom clock and token extractor. Starts the retention
  /// sweep when called inside a tokio runtime.
  pub fn with_components(
    config: CorrelationConfig,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenExtractor>,
  ) -> Self {
    let inner = Inner {
      store: RwLock::new(TelemetryStore::new(config.index_size)),
      cache: Mutex::new(CorrelationCache::new(config.max_correlations, config.cache_ttl_ms)),
      events: EventBus::new(config.event_capacity),
      correlations: AtomicU64::new(0),
      correlation_micros: AtomicU64::new(0),
      maintenance: Mutex::new(None),
      config,
      clock,
      tokens,
    };
    let engine = Self {
      inner: Arc::new(inner),
    };
    engine.start_maintenance();
    engine
  }

  fn start_maintenance(&self) {
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    let period = Duration::from_millis(self.inner.config.cleanup_interval_ms);
    let task = BackgroundTask::spawn_periodic("correlation-sweep", period, move || {
      let weak = weak.clone();
      async move {
        let Some(inner) = weak.upgrade() else {
          return false;
        };
        let engine = CorrelationEngine { inner };
        if let Err(e) = tokio::task::spawn_blocking(move || engine.sweep()).await {
          warn!(error = %e, "retention sweep failed; retrying next tick");
        }
        true
      }
    });
    *self.inner.maintenance.lock() = task;
  }

  pub fn config(&self) -> &CorrelationConfig {
    &self.inner.config
  }

  // -------------------------------------------------------------------------
  // Ingestion
  // -------------------------------------------------------------------------

  /// Store a log line. Error and fatal lines are correlated in the
  /// background when real-time mode is on.
  pub fn add_log_entry(&self, log: LogEntry) {
    let tokens = self.inner.tokens.extract(&log.message);
    let realtime = (self.inner.config.enable_realtime && log.level.is_error()).then(|| log.clone());
    let (timestamp, trace_id) = (log.timestamp, log.trace_id().map(str::to_string));
    self.inner.store.write().insert_log(log, tokens);
    self.invalidate_near(timestamp, trace_id.as_deref());
    if let Some(log) = realtime {
      self.schedule_correlation(log);
    }
  }

  pub fn add_trace_entry(&self, trace: TraceEntry) {
    let (timestamp, trace_id) = (trace.start_time, trace.trace_id.clone());
    self.inner.store.write().insert_trace(trace);
    self.invalidate_near(timestamp, Some(&trace_id));
  }

  pub fn add_metric_entry(&self, metric: MetricEntry) {
    let timestamp = metric.timestamp;
    self.inner.store.write().insert_metric(metric);
    self.invalidate_near(timestamp, None);
  }

  /// Drop cached results a new entity at `timestamp` (on `trace_id`) would
  /// change: subject logs within the correlation window or on the same trace.
  fn invalidate_near(&self, timestamp: i64, trace_id: Option<&str>) {
    if !self.inner.config.enable_caching {
      return;
    }
    let window = self.inner.config.correlation_window_ms;
    let mut cache = self.inner.cache.lock();
    if cache.is_empty() {
      return;
    }
    let dropped = cache.invalidate(|result| {
      result.log.timestamp.abs_diff(timestamp) <= window.unsigned_abs()
        || trace_id.is_some_and(|id| result.log.trace_id() == Some(id))
    });
    if dropped > 0 {
      debug!(dropped, timestamp, "cached correlations invalidated");
    }
  }

  /// Real-time passes report through events only; they never populate the
  /// cache, since co-occurring telemetry usually arrives after the log.
  fn schedule_correlation(&self, log: LogEntry) {
    match Handle::try_current() {
      Ok(runtime) => {
        let engine = self.clone();
        runtime.spawn_blocking(move || {
          engine.correlate(&log, false);
        });
      }
      Err(_) => debug!(log_id = %log.id, "no runtime, real-time correlation skipped"),
    }
  }

  // -------------------------------------------------------------------------
  // Queries
  // -------------------------------------------------------------------------

  /// Correlate one log against everything currently stored.
  pub fn correlate_log(&self, log: &LogEntry) -> CorrelationResult {
    self.correlate(log, self.inner.config.enable_caching)
  }

  fn correlate(&self, log: &LogEntry, use_cache: bool) -> CorrelationResult {
    let inner = &self.inner;
    let started = Instant::now();

    if use_cache {
      let now = inner.clock.now_ms();
      let hit = inner.cache.lock().get(&log.id, now);
      if let Some(hit) = hit {
        inner.events.publish(CorrelationEvent::Correlated {
          log_id: log.id.clone(),
          strategy: hit.metadata.strategy,
          confidence: hit.confidence,
          cached: true,
        });
        return hit;
      }
    }

    // The store read guard is held until the result is cached, so an
    // ingestion cannot slip in between and have its invalidation missed.
    let store = inner.store.read();
    let ctx = StrategyContext {
      window_ms: inner.config.correlation_window_ms,
      tokens: inner.tokens.as_ref(),
    };
    let mut best: Option<StrategyOutcome> = None;
    let mut items_checked = 0;
    for strategy in CorrelationStrategy::ORDER {
      let outcome = strategy::run(strategy, &store, log, &ctx);
      items_checked += outcome.items_checked;
      let confidence = outcome.confidence;
      if best.as_ref().map_or(true, |b| confidence > b.confidence) {
        best = Some(outcome);
      }
      if confidence > EARLY_STOP_CONFIDENCE {
        break;
      }
    }

    let outcome = best
      .filter(|b| b.confidence > 0.0)
      .unwrap_or_else(|| StrategyOutcome::empty(CorrelationStrategy::TimeWindow));
    let elapsed = started.elapsed();
    let now = inner.clock.now_ms();

    let result = CorrelationResult {
      log: log.clone(),
      traces: outcome.traces,
      metrics: outcome.metrics,
      related_logs: outcome.logs,
      confidence: outcome.confidence,
      correlated_at: now,
      metadata: CorrelationMetadata {
        correlation_duration_ms: elapsed.as_secs_f64() * 1000.0,
        items_checked,
        strategy: outcome.strategy,
      },
    };

    if use_cache {
      inner.cache.lock().insert(log.id.clone(), result.clone(), now);
    }
    drop(store);

    inner.correlations.fetch_add(1, Ordering::Relaxed);
    inner
      .correlation_micros
      .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

    debug!(
      log_id = %log.id,
      strategy = result.metadata.strategy.as_str(),
      confidence = result.confidence,
      items_checked,
      "log correlated"
    );
    inner.events.publish(CorrelationEvent::Correlated {
      log_id: log.id.clone(),
      strategy: result.metadata.strategy,
      confidence: result.confidence,
      cached: false,
    });
    result
  }

  /// Correlate a stored log by id.
  pub fn correlate_log_by_id(&self, log_id: &str) -> Result<CorrelationResult, EngineError> {
    let log = self
      .inner
      .store
      .read()
      .log(log_id)
      .cloned()
      .ok_or_else(|| EngineError::LogNotFound(log_id.to_string()))?;
    Ok(self.correlate_log(&log))
  }

  /// Correlate many logs with at most `batch_concurrency` in flight.
  /// Results come back in input order.
  pub async fn correlate_logs_batch(
    &self,
    logs: Vec<LogEntry>,
  ) -> Result<Vec<CorrelationResult>, EngineError> {
    let limit = self.inner.config.batch_concurrency.max(1);
    stream::iter(logs)
      .map(|log| {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.correlate_log(&log))
      })
      .buffered(limit)
      .map_err(EngineError::from)
      .try_collect()
      .await
  }

  /// Correlate every stored log that carries `trace_id`.
  pub fn find_by_trace_id(&self, trace_id: &str) -> Result<Vec<CorrelationResult>, EngineError> {
    let logs: Vec<LogEntry> = {
      let store = self.inner.store.read();
      if !store.knows_trace(trace_id) {
        return Err(EngineError::TraceNotFound(trace_id.to_string()));
      }
      store.logs_for(trace_id).into_iter().cloned().collect()
    };
    Ok(logs.iter().map(|log| self.correlate_log(log)).collect())
  }

  /// Correlate every stored log with `start <= timestamp <= end`.
  pub fn find_in_time_range(&self, start: i64, end: i64) -> Vec<CorrelationResult> {
    let range = TimeRange { start, end };
    let mut logs: Vec<LogEntry> = self
      .inner
      .store
      .read()
      .logs
      .values()
      .filter(|log| range.contains(log.timestamp))
      .cloned()
      .collect();
    logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    logs.iter().map(|log| self.correlate_log(log)).collect()
  }

  pub fn statistics(&self) -> CorrelationStatistics {
    let inner = &self.inner;
    let mut stats = {
      let store = inner.store.read();
      CorrelationStatistics {
        total_logs: store.logs.len(),
        total_traces: store.traces.len(),
        total_metrics: store.metrics.len(),
        indexed_entries: store.index.len(),
        time_buckets: store.index.bucket_count(),
        ..CorrelationStatistics::default()
      }
    };

    let correlations = inner.correlations.load(Ordering::Relaxed);
    stats.correlations_performed = correlations;
    if correlations > 0 {
      let micros = inner.correlation_micros.load(Ordering::Relaxed);
      stats.average_correlation_ms = micros as f64 / correlations as f64 / 1000.0;
    }

    let cache = inner.cache.lock();
    stats.cache_size = cache.len();
    stats.cache_hits = cache.hits();
    stats.cache_misses = cache.misses();
    stats.cache_hit_rate = cache.hit_rate();
    stats
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CorrelationEvent> {
    self.inner.events.subscribe()
  }

  // -------------------------------------------------------------------------
  // Maintenance
  // -------------------------------------------------------------------------

  /// Drop records older than the retention horizon and expired cache entries.
  pub fn sweep(&self) -> SweepReport {
    let inner = &self.inner;
    let now = inner.clock.now_ms();
    let cutoff = now.saturating_sub(inner.config.retention_ms);

    let mut report = inner.store.write().sweep(cutoff);
    report.cache_entries = inner.cache.lock().purge_expired(now);

    if report.total() > 0 || report.cache_entries > 0 {
      info!(
        logs = report.logs,
        traces = report.traces,
        metrics = report.metrics,
        cache_entries = report.cache_entries,
        "retention sweep"
      );
    }
    inner.events.publish(CorrelationEvent::Swept {
      logs: report.logs,
      traces: report.traces,
      metrics: report.metrics,
      cache_entries: report.cache_entries,
    });
    report
  }

  /// Reset all tables, the cache and the counters.
  pub fn clear(&self) {
    self.inner.store.write().clear();
    self.inner.cache.lock().clear();
    self.inner.correlations.store(0, Ordering::Relaxed);
    self.inner.correlation_micros.store(0, Ordering::Relaxed);
  }

  /// Stop the background sweep.
  pub async fn shutdown(&self) {
    let task = self.inner.maintenance.lock().take();
    if let Some(task) = task {
      task.shutdown().await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  const T0: i64 = 1_700_000_000_000;

  fn engine_at(clock: Arc<ManualClock>) -> CorrelationEngine {
    let config = CorrelationConfig {
      enable_realtime: false,
      ..CorrelationConfig::default()
    };
    CorrelationEngine::with_clock(config, clock)
  }

  fn traced(id: &str, ts: i64, trace_id: &str) -> LogEntry {
    let mut log = LogEntry::new(id, ts, LogLevel::Error, "payment failed");
    log.trace_context = Some(TraceContext {
      trace_id: trace_id.into(),
      span_id: "s1".into(),
    });
    log
  }

  #[test]
  fn trace_id_wins_and_stops_early() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    engine.add_trace_entry(TraceEntry::new("t1", "s1", "POST /pay", T0));
    let log = traced("l1", T0 + 5, "t1");
    engine.add_log_entry(log.clone());

    let result = engine.correlate_log(&log);
    assert_eq!(result.metadata.strategy, CorrelationStrategy::TraceId);
    assert!(result.confidence >= 0.9);
    assert_eq!(result.traces.len(), 1);
  }

  #[test]
  fn nothing_nearby_yields_empty_time_window_result() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    let log = LogEntry::new("lonely", T0, LogLevel::Info, "started");
    engine.add_log_entry(log.clone());

    let result = engine.correlate_log(&log);
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.metadata.strategy, CorrelationStrategy::TimeWindow);
    assert!(result.is_empty());
  }

  #[test]
  fn correlate_by_unknown_id_is_not_found() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    let err = engine.correlate_log_by_id("missing").unwrap_err();
    assert!(err.is_not_found());
  }

  #[test]
  fn find_by_unknown_trace_is_not_found() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    assert!(matches!(
      engine.find_by_trace_id("nope"),
      Err(EngineError::TraceNotFound(_))
    ));
  }

  #[test]
  fn find_by_trace_id_correlates_each_log() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    engine.add_trace_entry(TraceEntry::new("t1", "s1", "POST /pay", T0));
    engine.add_log_entry(traced("a", T0 + 1, "t1"));
    engine.add_log_entry(traced("b", T0 + 2, "t1"));
    engine.add_log_entry(traced("c", T0 + 3, "t2"));

    let results = engine.find_by_trace_id("t1").unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.log.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(results.iter().all(|r| r.related_logs.len() == 1));
  }

  #[test]
  fn find_in_time_range_is_inclusive_and_ordered() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    engine.add_log_entry(LogEntry::new("late", T0 + 2_000, LogLevel::Info, "x"));
    engine.add_log_entry(LogEntry::new("early", T0, LogLevel::Info, "y"));
    engine.add_log_entry(LogEntry::new("outside", T0 + 5_000, LogLevel::Info, "z"));

    let ids: Vec<_> = engine
      .find_in_time_range(T0, T0 + 2_000)
      .into_iter()
      .map(|r| r.log.id)
      .collect();
    assert_eq!(ids, vec!["early", "late"]);
  }

  #[test]
  fn cache_expires_after_ttl() {
    let clock = Arc::new(ManualClock::new(T0));
    let engine = engine_at(clock.clone());
    let log = LogEntry::new("l", T0, LogLevel::Warn, "slow");
    engine.add_log_entry(log.clone());

    engine.correlate_log(&log);
    clock.advance(engine.config().cache_ttl_ms + 1);
    engine.correlate_log(&log);

    let stats = engine.statistics();
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.cache_misses, 2);
    assert_eq!(stats.correlations_performed, 2);
  }

  #[test]
  fn caching_disabled_never_hits() {
    let config = CorrelationConfig {
      enable_caching: false,
      enable_realtime: false,
      ..CorrelationConfig::default()
    };
    let engine = CorrelationEngine::with_clock(config, Arc::new(ManualClock::new(T0)));
    let log = LogEntry::new("l", T0, LogLevel::Warn, "slow");
    engine.correlate_log(&log);
    engine.correlate_log(&log);
    let stats = engine.statistics();
    assert_eq!(stats.cache_size, 0);
    assert_eq!(stats.correlations_performed, 2);
  }

  #[test]
  fn clear_resets_everything() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    let log = LogEntry::new("l", T0, LogLevel::Warn, "slow");
    engine.add_log_entry(log.clone());
    engine.add_metric_entry(MetricEntry::new("cpu", 0.9, T0, MetricType::Gauge));
    engine.correlate_log(&log);

    engine.clear();
    let stats = engine.statistics();
    assert_eq!(stats.total_logs, 0);
    assert_eq!(stats.total_metrics, 0);
    assert_eq!(stats.indexed_entries, 0);
    assert_eq!(stats.cache_size, 0);
    assert_eq!(stats.correlations_performed, 0);
  }

  #[tokio::test]
  async fn realtime_pass_leaves_later_telemetry_visible() {
    let engine = CorrelationEngine::with_clock(
      CorrelationConfig::default(),
      Arc::new(ManualClock::new(T0)),
    );
    let mut events = engine.subscribe();
    let log = LogEntry::new("boom", T0, LogLevel::Error, "out of memory");
    engine.add_log_entry(log.clone());

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(matches!(event, CorrelationEvent::Correlated { ref log_id, cached: false, .. } if log_id == "boom"));
    assert_eq!(engine.statistics().cache_size, 0);

    engine.add_trace_entry(TraceEntry::new("t1", "s1", "GET /cart", T0 + 50));
    engine.add_metric_entry(MetricEntry::new("heap", 0.97, T0 + 100, MetricType::Gauge));
    let result = engine.correlate_log(&log);
    assert_eq!(result.traces.len(), 1);
    assert_eq!(result.metrics.len(), 1);
    assert_eq!(result.metadata.strategy, CorrelationStrategy::TimeWindow);
    assert!(result.confidence > 0.0);
    engine.shutdown().await;
  }

  #[test]
  fn new_telemetry_invalidates_nearby_cached_results() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    let near = LogEntry::new("near", T0, LogLevel::Warn, "slow");
    let far = LogEntry::new("far", T0 + 60_000, LogLevel::Warn, "slow too");
    engine.add_log_entry(near.clone());
    engine.add_log_entry(far.clone());
    assert!(engine.correlate_log(&near).is_empty());
    engine.correlate_log(&far);
    assert_eq!(engine.statistics().cache_size, 2);

    engine.add_metric_entry(MetricEntry::new("cpu", 0.9, T0 + 80, MetricType::Gauge));
    assert_eq!(engine.statistics().cache_size, 1);
    let refreshed = engine.correlate_log(&near);
    assert_eq!(refreshed.metrics.len(), 1);

    engine.correlate_log(&far);
    assert_eq!(engine.statistics().cache_hits, 1);
  }

  #[test]
  fn new_span_invalidates_results_on_its_trace() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    let log = traced("a", T0, "t9");
    engine.add_log_entry(log.clone());
    assert_eq!(engine.correlate_log(&log).metadata.strategy, CorrelationStrategy::TimeWindow);

    engine.add_trace_entry(TraceEntry::new("t9", "s1", "GET /slow", T0 + 30_000));
    let result = engine.correlate_log(&log);
    assert_eq!(result.metadata.strategy, CorrelationStrategy::TraceId);
    assert_eq!(result.traces.len(), 1);
  }

  #[tokio::test]
  async fn batch_preserves_input_order() {
    let engine = engine_at(Arc::new(ManualClock::new(T0)));
    let logs: Vec<LogEntry> = (0..12)
      .map(|i| LogEntry::new(format!("l{i}"), T0 + i * 10, LogLevel::Info, "tick"))
      .collect();
    for log in &logs {
      engine.add_log_entry(log.clone());
    }

    let results = engine.correlate_logs_batch(logs.clone()).await.unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.log.id.clone()).collect();
    let expected: Vec<_> = logs.iter().map(|l| l.id.clone()).collect();
    assert_eq!(ids, expected);
    engine.shutdown().await;
  }
}
