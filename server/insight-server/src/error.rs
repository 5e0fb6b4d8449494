//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use insight_engine::EngineError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
  #[error(transparent)]
  Engine(#[from] EngineError),

  #[error("bad request: {0}")]
  BadRequest(String),
}

impl ApiError {
  pub fn bad_request(msg: impl Into<String>) -> Self {
    Self::BadRequest(msg.into())
  }

  pub fn status(&self) -> StatusCode {
    match self {
      Self::Engine(e) if e.is_not_found() => StatusCode::NOT_FOUND,
      Self::Engine(EngineError::SelfMerge(_)) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<tokio::task::JoinError> for ApiError {
  fn from(err: tokio::task::JoinError) -> Self {
    Self::Engine(err.into())
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      tracing::error!(error = %self, "request failed");
    }
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}
