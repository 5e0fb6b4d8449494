//! Structured error types for the insight engines.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("cluster not found: {0}")]
  ClusterNotFound(String),

  #[error("error not found: {0}")]
  ErrorNotFound(String),

  #[error("log not found: {0}")]
  LogNotFound(String),

  #[error("trace not found: {0}")]
  TraceNotFound(String),

  #[error("cannot merge cluster {0} with itself")]
  SelfMerge(String),

  /// A clustering algorithm hit degenerate input. Handled internally by
  /// falling back to the adaptive algorithm.
  #[error("numerical failure: {0}")]
  Numerical(String),

  #[error("background task: {0}")]
  Task(String),
}

impl EngineError {
  pub fn cluster_not_found(id: &str) -> Self {
    Self::ClusterNotFound(id.to_string())
  }

  pub fn numerical(msg: impl Into<String>) -> Self {
    Self::Numerical(msg.into())
  }

  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      Self::ClusterNotFound(_)
        | Self::ErrorNotFound(_)
        | Self::LogNotFound(_)
        | Self::TraceNotFound(_)
    )
  }
}

impl From<tokio::task::JoinError> for EngineError {
  fn from(err: tokio::task::JoinError) -> Self {
    Self::Task(err.to_string())
  }
}
