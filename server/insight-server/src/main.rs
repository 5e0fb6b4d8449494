//! Binary entrypoint for the insight server.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use insight_server::{AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("insight_server=info,insight_engine=info")),
    )
    .init();

  let config = ServerConfig::from_env()?;
  let state = Arc::new(AppState::new(&config));
  let app = insight_server::router(state.clone());

  let addr = config.addr();
  let listener = tokio::net::TcpListener::bind(addr).await?;
  info!(%addr, algorithm = config.clustering.algorithm.as_str(), "insight-server listening");

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

  state.shutdown().await;
  info!("insight-server stopped");
  Ok(())
}
