//! Shared application state.

use insight_engine::{ClusterEngine, CorrelationEngine};

use crate::config::ServerConfig;

pub struct AppState {
  pub correlation: CorrelationEngine,
  pub clustering: ClusterEngine,
}

impl AppState {
  /// Build both engines. Inside a tokio runtime this also starts their
  /// retention sweep and automatic reclustering.
  pub fn new(config: &ServerConfig) -> Self {
    Self {
      correlation: CorrelationEngine::new(config.correlation.clone()),
      clustering: ClusterEngine::new(config.clustering.clone()),
    }
  }

  /// Stop background maintenance on both engines.
  pub async fn shutdown(&self) {
    self.correlation.shutdown().await;
    self.clustering.shutdown().await;
  }
}
