//! HTTP handlers for the insight server.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use insight_engine::types::{
  ClusterQuery, ClusteringResult, CorrelationResult, ErrorCluster, ErrorData, LogEntry, MetricEntry, TraceEntry,
};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;
use crate::types::{
  Accepted, ClusterListQuery, CorrelateRequest, MergeRequest, OneOrMany, RangeQuery, StatsResponse,
};

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run an engine call on the blocking pool; similarity scans and
/// representative searches stay off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  Ok(tokio::task::spawn_blocking(f).await?)
}

pub async fn health() -> &'static str {
  "ok"
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

pub async fn ingest_logs(
  State(state): State<Arc<AppState>>,
  Json(payload): Json<OneOrMany<LogEntry>>,
) -> (StatusCode, Json<Accepted>) {
  let logs = payload.into_vec();
  let accepted = logs.len();
  for log in logs {
    state.correlation.add_log_entry(log);
  }
  debug!(accepted, "logs ingested");
  (StatusCode::ACCEPTED, Json(Accepted { accepted }))
}

pub async fn ingest_traces(
  State(state): State<Arc<AppState>>,
  Json(payload): Json<OneOrMany<TraceEntry>>,
) -> (StatusCode, Json<Accepted>) {
  let traces = payload.into_vec();
  let accepted = traces.len();
  for trace in traces {
    state.correlation.add_trace_entry(trace);
  }
  (StatusCode::ACCEPTED, Json(Accepted { accepted }))
}

pub async fn ingest_metrics(
  State(state): State<Arc<AppState>>,
  Json(payload): Json<OneOrMany<MetricEntry>>,
) -> (StatusCode, Json<Accepted>) {
  let metrics = payload.into_vec();
  let accepted = metrics.len();
  for metric in metrics {
    state.correlation.add_metric_entry(metric);
  }
  (StatusCode::ACCEPTED, Json(Accepted { accepted }))
}

pub async fn add_error(
  State(state): State<Arc<AppState>>,
  Json(error): Json<ErrorData>,
) -> ApiResult<ErrorCluster> {
  let cluster = blocking(move || state.clustering.add_error(error)).await?;
  Ok(Json(cluster))
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

pub async fn correlate(
  State(state): State<Arc<AppState>>,
  Json(request): Json<CorrelateRequest>,
) -> ApiResult<CorrelationResult> {
  let result = match (request.log, request.log_id) {
    (Some(log), _) => blocking(move || state.correlation.correlate_log(&log)).await?,
    (None, Some(id)) => blocking(move || state.correlation.correlate_log_by_id(&id)).await??,
    (None, None) => return Err(ApiError::bad_request("expected logId or log")),
  };
  Ok(Json(result))
}

pub async fn correlate_batch(
  State(state): State<Arc<AppState>>,
  Json(logs): Json<Vec<LogEntry>>,
) -> ApiResult<Vec<CorrelationResult>> {
  Ok(Json(state.correlation.correlate_logs_batch(logs).await?))
}

pub async fn trace_correlations(
  State(state): State<Arc<AppState>>,
  Path(trace_id): Path<String>,
) -> ApiResult<Vec<CorrelationResult>> {
  let results = blocking(move || state.correlation.find_by_trace_id(&trace_id)).await??;
  Ok(Json(results))
}

pub async fn range_correlations(
  State(state): State<Arc<AppState>>,
  Query(range): Query<RangeQuery>,
) -> ApiResult<Vec<CorrelationResult>> {
  if range.start > range.end {
    return Err(ApiError::bad_request("start must not be after end"));
  }
  let results = blocking(move || state.correlation.find_in_time_range(range.start, range.end)).await?;
  Ok(Json(results))
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

pub async fn list_clusters(
  State(state): State<Arc<AppState>>,
  Query(query): Query<ClusterListQuery>,
) -> Json<Vec<ErrorCluster>> {
  let query: ClusterQuery = query.into();
  Json(state.clustering.get_clusters(&query))
}

pub async fn get_cluster(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ApiResult<ErrorCluster> {
  Ok(Json(state.clustering.get_cluster(&id)?))
}

pub async fn merge_clusters(
  State(state): State<Arc<AppState>>,
  Json(request): Json<MergeRequest>,
) -> ApiResult<ErrorCluster> {
  let merged = blocking(move || {
    state
      .clustering
      .merge_clusters(&request.cluster_id1, &request.cluster_id2)
  })
  .await??;
  Ok(Json(merged))
}

pub async fn recluster(State(state): State<Arc<AppState>>) -> ApiResult<ClusteringResult> {
  Ok(Json(state.clustering.perform_reclustering().await?))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
  Json(StatsResponse {
    correlation: state.correlation.statistics(),
    clustering: state.clustering.statistics(),
  })
}
