//! Publish/subscribe notifications about what the engines did.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::ClusteringAlgorithm;
use crate::types::CorrelationStrategy;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CorrelationEvent {
  Correlated {
    log_id: String,
    strategy: CorrelationStrategy,
    confidence: f64,
    cached: bool,
  },
  Swept {
    logs: usize,
    traces: usize,
    metrics: usize,
    cache_entries: usize,
  },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
  Created {
    cluster_id: String,
    error_id: String,
  },
  ErrorAdded {
    cluster_id: String,
    error_id: String,
  },
  Merged {
    sources: [String; 2],
    cluster_id: String,
  },
  Reclustered {
    algorithm: ClusteringAlgorithm,
    cluster_count: usize,
    total_errors: usize,
  },
}

/// Fan-out channel. Slow subscribers lag and lose old events; publishing
/// never blocks and never fails.
#[derive(Debug)]
pub struct EventBus<E: Clone> {
  sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self { sender }
  }

  pub fn publish(&self, event: E) {
    // No receivers is fine.
    let _ = self.sender.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<E> {
    self.sender.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn publish_without_subscribers_is_silent() {
    let bus: EventBus<u32> = EventBus::new(4);
    bus.publish(1);
    let mut late = bus.subscribe();
    assert!(late.try_recv().is_err());
  }

  #[tokio::test]
  async fn subscribers_receive_in_order() {
    let bus = EventBus::new(8);
    let mut rx = bus.subscribe();
    bus.publish(ClusterEvent::Created {
      cluster_id: "c1".into(),
      error_id: "e1".into(),
    });
    bus.publish(ClusterEvent::ErrorAdded {
      cluster_id: "c1".into(),
      error_id: "e2".into(),
    });
    assert!(matches!(rx.recv().await.unwrap(), ClusterEvent::Created { .. }));
    assert!(matches!(rx.recv().await.unwrap(), ClusterEvent::ErrorAdded { .. }));
  }

  #[test]
  fn events_serialize_with_tag() {
    let json = serde_json::to_value(CorrelationEvent::Swept {
      logs: 1,
      traces: 2,
      metrics: 3,
      cache_entries: 0,
    })
    .unwrap();
    assert_eq!(json["event"], "swept");
    assert_eq!(json["traces"], 2);
  }
}
