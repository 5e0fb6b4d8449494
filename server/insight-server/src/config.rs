//! Server configuration from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use insight_engine::{ClusteringAlgorithm, ClusteringConfig, CorrelationConfig};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 5006;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
  #[error("{var}: invalid value {value:?}")]
  Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub bind: IpAddr,
  pub port: u16,
  pub correlation: CorrelationConfig,
  pub clustering: ClusteringConfig,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
      port: DEFAULT_PORT,
      correlation: CorrelationConfig::default(),
      clustering: ClusteringConfig::default(),
    }
  }
}

impl ServerConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|var| std::env::var(var).ok())
  }

  /// Build from any variable source; unset variables keep their defaults.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();
    let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty()).map(|v| (var, v));

    if let Some((var, v)) = get("PORT") {
      config.port = parse(var, &v)?;
    }
    if let Some((var, v)) = get("INSIGHT_BIND") {
      config.bind = parse(var, &v)?;
    }
    if let Some((var, v)) = get("INSIGHT_CORRELATION_WINDOW_MS") {
      config.correlation.correlation_window_ms = parse(var, &v)?;
    }
    if let Some((var, v)) = get("INSIGHT_CACHE_TTL_MS") {
      config.correlation.cache_ttl_ms = parse(var, &v)?;
    }
    if let Some((var, v)) = get("INSIGHT_RETENTION_MS") {
      config.correlation.retention_ms = parse(var, &v)?;
    }
    if let Some((var, v)) = get("INSIGHT_MIN_SIMILARITY") {
      let min: f64 = parse(var, &v)?;
      if !(0.0..=1.0).contains(&min) {
        return Err(invalid(var, &v));
      }
      config.clustering.min_similarity = min;
    }
    if let Some((var, v)) = get("INSIGHT_ALGORITHM") {
      config.clustering.algorithm = ClusteringAlgorithm::from_str_loose(&v).ok_or_else(|| invalid(var, &v))?;
    }
    if let Some((var, v)) = get("INSIGHT_MAX_CLUSTERS") {
      config.clustering.max_clusters = parse(var, &v)?;
    }
    Ok(config)
  }

  pub fn addr(&self) -> SocketAddr {
    SocketAddr::new(self.bind, self.port)
  }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
  value.trim().parse().map_err(|_| invalid(var, value))
}

fn invalid(var: &'static str, value: &str) -> ConfigError {
  ConfigError::Invalid {
    var,
    value: value.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn from(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    ServerConfig::from_lookup(|var| vars.get(var).cloned())
  }

  #[test]
  fn defaults_without_env() {
    let config = from(&[]).unwrap();
    assert_eq!(config.addr(), SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)));
    assert_eq!(config.correlation.correlation_window_ms, 100);
    assert_eq!(config.clustering.algorithm, ClusteringAlgorithm::Adaptive);
  }

  #[test]
  fn overrides_apply() {
    let config = from(&[
      ("PORT", "9000"),
      ("INSIGHT_BIND", "0.0.0.0"),
      ("INSIGHT_ALGORITHM", "dbscan"),
      ("INSIGHT_MIN_SIMILARITY", "0.7"),
      ("INSIGHT_RETENTION_MS", "60000"),
    ])
    .unwrap();
    assert_eq!(config.port, 9000);
    assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    assert_eq!(config.clustering.algorithm, ClusteringAlgorithm::Dbscan);
    assert!((config.clustering.min_similarity - 0.7).abs() < f64::EPSILON);
    assert_eq!(config.correlation.retention_ms, 60_000);
  }

  #[test]
  fn malformed_values_are_errors() {
    assert_eq!(
      from(&[("PORT", "http")]).unwrap_err(),
      ConfigError::Invalid {
        var: "PORT",
        value: "http".into()
      }
    );
    assert!(from(&[("INSIGHT_MIN_SIMILARITY", "1.5")]).is_err());
    assert!(from(&[("INSIGHT_ALGORITHM", "spectral")]).is_err());
  }
}
