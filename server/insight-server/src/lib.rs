//! Insight Server
//!
//! HTTP service over the insight engine: telemetry ingestion, log
//! correlation and error clustering. Bind to 127.0.0.1 by default (internal only).

mod config;
mod error;
mod handlers;
mod state;
mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

pub use config::{ConfigError, ServerConfig};
pub use error::ApiError;
pub use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/health", get(handlers::health))
    .route("/logs", post(handlers::ingest_logs))
    .route("/traces", post(handlers::ingest_traces))
    .route("/metrics", post(handlers::ingest_metrics))
    .route("/errors", post(handlers::add_error))
    .route("/correlate", post(handlers::correlate))
    .route("/correlate/batch", post(handlers::correlate_batch))
    .route("/traces/:trace_id/correlations", get(handlers::trace_correlations))
    .route("/correlations", get(handlers::range_correlations))
    .route("/clusters", get(handlers::list_clusters))
    .route("/clusters/merge", post(handlers::merge_clusters))
    .route("/clusters/recluster", post(handlers::recluster))
    .route("/clusters/:id", get(handlers::get_cluster))
    .route("/stats", get(handlers::stats))
    .layer(CorsLayer::permissive())
    .with_state(state)
}
