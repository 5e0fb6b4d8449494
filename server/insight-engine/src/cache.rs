//! TTL cache of correlation results keyed by log id.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::CorrelationResult;

#[derive(Debug, Clone)]
struct CacheEntry {
  result: CorrelationResult,
  inserted_at: i64,
  ttl_ms: i64,
}

impl CacheEntry {
  fn is_expired(&self, now: i64) -> bool {
    now - self.inserted_at > self.ttl_ms
  }
}

/// Expired entries are dropped lazily on read (and in bulk by `purge_expired`);
/// overflow evicts the least recently inserted entry. Reads do not reorder.
#[derive(Debug)]
pub struct CorrelationCache {
  entries: LruCache<String, CacheEntry>,
  ttl_ms: i64,
  hits: u64,
  misses: u64,
}

impl CorrelationCache {
  pub fn new(max_entries: usize, ttl_ms: i64) -> Self {
    let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
    Self {
      entries: LruCache::new(capacity),
      ttl_ms,
      hits: 0,
      misses: 0,
    }
  }

  /// Live entry for `key`, counting a hit or a miss.
  pub fn get(&mut self, key: &str, now: i64) -> Option<CorrelationResult> {
    let live = match self.entries.peek(key) {
      Some(entry) if !entry.is_expired(now) => Some(entry.result.clone()),
      Some(_) => {
        self.entries.pop(key);
        None
      }
      None => None,
    };
    match live {
      Some(_) => self.hits += 1,
      None => self.misses += 1,
    }
    live
  }

  pub fn insert(&mut self, key: String, result: CorrelationResult, now: i64) {
    self.entries.put(
      key,
      CacheEntry {
        result,
        inserted_at: now,
        ttl_ms: self.ttl_ms,
      },
    );
  }

  /// Drop every entry whose result matches `stale`. Returns how many were dropped.
  pub fn invalidate<F>(&mut self, mut stale: F) -> usize
  where
    F: FnMut(&CorrelationResult) -> bool,
  {
    let keys: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, e)| stale(&e.result))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &keys {
      self.entries.pop(key);
    }
    keys.len()
  }

  /// Drop every expired entry. Returns how many were dropped.
  pub fn purge_expired(&mut self, now: i64) -> usize {
    let keys: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, e)| e.is_expired(now))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &keys {
      self.entries.pop(key);
    }
    keys.len()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn hits(&self) -> u64 {
    self.hits
  }

  pub fn misses(&self) -> u64 {
    self.misses
  }

  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.hits = 0;
    self.misses = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{CorrelationMetadata, CorrelationStrategy, LogEntry, LogLevel};

  fn result(id: &str) -> CorrelationResult {
    CorrelationResult {
      log: LogEntry::new(id, 0, LogLevel::Info, "msg"),
      traces: vec![],
      metrics: vec![],
      related_logs: vec![],
      confidence: 0.5,
      correlated_at: 0,
      metadata: CorrelationMetadata {
        correlation_duration_ms: 0.0,
        items_checked: 0,
        strategy: CorrelationStrategy::TimeWindow,
      },
    }
  }

  #[test]
  fn hit_within_ttl_miss_after() {
    let mut cache = CorrelationCache::new(10, 1_000);
    cache.insert("a".into(), result("a"), 0);
    assert!(cache.get("a", 500).is_some());
    assert!(cache.get("a", 1_500).is_none());
    assert_eq!(cache.hits(), 1);
    assert_eq!(cache.misses(), 1);
    assert!(cache.is_empty());
  }

  #[test]
  fn overflow_evicts_oldest_insertion() {
    let mut cache = CorrelationCache::new(2, 10_000);
    cache.insert("a".into(), result("a"), 1);
    cache.insert("b".into(), result("b"), 2);
    cache.insert("c".into(), result("c"), 3);
    assert_eq!(cache.len(), 2);
    assert!(cache.get("a", 4).is_none());
    assert!(cache.get("b", 4).is_some());
    assert!(cache.get("c", 4).is_some());
  }

  #[test]
  fn reinsert_refreshes_position() {
    let mut cache = CorrelationCache::new(2, 10_000);
    cache.insert("a".into(), result("a"), 1);
    cache.insert("b".into(), result("b"), 2);
    cache.insert("a".into(), result("a"), 3);
    cache.insert("c".into(), result("c"), 4);
    assert!(cache.get("a", 5).is_some());
    assert!(cache.get("b", 5).is_none());
  }

  #[test]
  fn reads_do_not_change_eviction_order() {
    let mut cache = CorrelationCache::new(2, 10_000);
    cache.insert("a".into(), result("a"), 1);
    cache.insert("b".into(), result("b"), 2);
    assert!(cache.get("a", 3).is_some());
    cache.insert("c".into(), result("c"), 4);
    assert!(cache.get("a", 5).is_none());
    assert!(cache.get("b", 5).is_some());
  }

  #[test]
  fn invalidate_drops_matching_results() {
    let mut cache = CorrelationCache::new(10, 10_000);
    cache.insert("a".into(), result("a"), 1);
    cache.insert("b".into(), result("b"), 2);
    assert_eq!(cache.invalidate(|r| r.log.id == "a"), 1);
    assert_eq!(cache.len(), 1);
    assert!(cache.get("b", 3).is_some());
  }

  #[test]
  fn purge_removes_only_expired() {
    let mut cache = CorrelationCache::new(10, 100);
    cache.insert("old".into(), result("old"), 0);
    cache.insert("new".into(), result("new"), 150);
    assert_eq!(cache.purge_expired(200), 1);
    assert_eq!(cache.len(), 1);
  }
}
