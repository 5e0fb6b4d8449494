//! Request and response bodies that are not engine types.

use insight_engine::types::{
  ClusterQuery, ClusterSortBy, ClusteringStatistics, CorrelationStatistics, ErrorSeverity, LogEntry, TimeRange,
};
use serde::{Deserialize, Serialize};

/// `POST /correlate`: a stored log id or a full log entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelateRequest {
  #[serde(default)]
  pub log_id: Option<String>,
  #[serde(default)]
  pub log: Option<LogEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
  pub cluster_id1: String,
  pub cluster_id2: String,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
  pub start: i64,
  pub end: i64,
}

/// `GET /clusters` query string; flattened form of `ClusterQuery`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterListQuery {
  pub min_size: Option<usize>,
  pub max_size: Option<usize>,
  pub severity: Option<ErrorSeverity>,
  pub start: Option<i64>,
  pub end: Option<i64>,
  pub sort_by: Option<ClusterSortBy>,
}

impl From<ClusterListQuery> for ClusterQuery {
  fn from(q: ClusterListQuery) -> Self {
    let time_range = match (q.start, q.end) {
      (None, None) => None,
      (start, end) => Some(TimeRange {
        start: start.unwrap_or(i64::MIN),
        end: end.unwrap_or(i64::MAX),
      }),
    };
    ClusterQuery {
      min_size: q.min_size,
      max_size: q.max_size,
      severity: q.severity,
      time_range,
      sort_by: q.sort_by,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct Accepted {
  pub accepted: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
  pub correlation: CorrelationStatistics,
  pub clustering: ClusteringStatistics,
}

/// Accepts a single record or an array of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
  Many(Vec<T>),
  One(T),
}

impl<T> OneOrMany<T> {
  pub fn into_vec(self) -> Vec<T> {
    match self {
      Self::Many(items) => items,
      Self::One(item) => vec![item],
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn list_query_builds_open_ended_range() {
    let query: ClusterQuery = ClusterListQuery {
      start: Some(10),
      ..ClusterListQuery::default()
    }
    .into();
    assert_eq!(
      query.time_range,
      Some(TimeRange {
        start: 10,
        end: i64::MAX
      })
    );
    let query: ClusterQuery = ClusterListQuery::default().into();
    assert_eq!(query.time_range, None);
  }

  #[test]
  fn one_or_many_accepts_both_shapes() {
    let one: OneOrMany<u32> = serde_json::from_str("7").unwrap();
    let many: OneOrMany<u32> = serde_json::from_str("[1, 2]").unwrap();
    assert_eq!(one.into_vec(), vec![7]);
    assert_eq!(many.into_vec(), vec![1, 2]);
  }
}
