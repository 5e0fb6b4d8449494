//! One-second time buckets over every ingested log, trace and metric.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Log,
  Trace,
  Metric,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
  pub id: String,
  pub timestamp: i64,
  pub kind: EntityKind,
}

impl IndexEntry {
  pub fn new(id: impl Into<String>, timestamp: i64, kind: EntityKind) -> Self {
    Self {
      id: id.into(),
      timestamp,
      kind,
    }
  }
}

/// Bucket key: timestamp floored to the whole second.
pub fn bucket_key(ts: i64) -> i64 {
  ts.div_euclid(1000) * 1000
}

/// Buckets hold entries in ingestion order and drop the oldest once a
/// bucket exceeds its capacity.
#[derive(Debug)]
pub struct TimeBucketIndex {
  buckets: BTreeMap<i64, VecDeque<IndexEntry>>,
  capacity: usize,
  len: usize,
}

impl TimeBucketIndex {
  pub fn new(capacity: usize) -> Self {
    Self {
      buckets: BTreeMap::new(),
      capacity: capacity.max(1),
      len: 0,
    }
  }

  /// Register an entry. Returns the entry evicted to make room, if any.
  pub fn insert(&mut self, entry: IndexEntry) -> Option<IndexEntry> {
    let bucket = self.buckets.entry(bucket_key(entry.timestamp)).or_default();
    bucket.push_back(entry);
    self.len += 1;
    if bucket.len() > self.capacity {
      self.len -= 1;
      return bucket.pop_front();
    }
    None
  }

  /// Entries with `start <= timestamp <= end`, in bucket then ingestion order.
  pub fn range(&self, start: i64, end: i64) -> impl Iterator<Item = &IndexEntry> + '_ {
    let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
    self
      .buckets
      .range(bucket_key(lo)..=bucket_key(hi))
      .flat_map(|(_, bucket)| bucket.iter())
      .filter(move |e| e.timestamp >= lo && e.timestamp <= hi)
  }

  /// Remove one entity. Returns true if it was indexed.
  pub fn remove(&mut self, id: &str, kind: EntityKind, timestamp: i64) -> bool {
    let key = bucket_key(timestamp);
    let Some(bucket) = self.buckets.get_mut(&key) else {
      return false;
    };
    let before = bucket.len();
    bucket.retain(|e| !(e.kind == kind && e.id == id));
    let removed = before - bucket.len();
    if bucket.is_empty() {
      self.buckets.remove(&key);
    }
    self.len -= removed;
    removed > 0
  }

  /// Drop every entry older than `cutoff`. Returns how many were dropped.
  pub fn prune_before(&mut self, cutoff: i64) -> usize {
    let boundary = bucket_key(cutoff);
    let kept = self.buckets.split_off(&boundary);
    let mut removed: usize = self.buckets.values().map(VecDeque::len).sum();
    self.buckets = kept;

    if let Some(bucket) = self.buckets.get_mut(&boundary) {
      let before = bucket.len();
      bucket.retain(|e| e.timestamp >= cutoff);
      removed += before - bucket.len();
      if bucket.is_empty() {
        self.buckets.remove(&boundary);
      }
    }
    self.len -= removed;
    removed
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn bucket_count(&self) -> usize {
    self.buckets.len()
  }

  pub fn clear(&mut self) {
    self.buckets.clear();
    self.len = 0;
  }
}
