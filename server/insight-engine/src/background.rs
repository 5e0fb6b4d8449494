//! Owned periodic tasks (retention sweep, automatic reclustering).

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// A repeating job on the current tokio runtime. Stops when `shutdown` is
/// awaited, when the handle is dropped, or when the job returns `false`.
#[derive(Debug)]
pub struct BackgroundTask {
  stop: Option<oneshot::Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
  /// Spawn `tick` every `period`, first run one period from now. Returns
  /// `None` outside a tokio runtime.
  pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Option<Self>
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
  {
    let runtime = Handle::try_current().ok()?;
    let period = period.max(Duration::from_millis(1));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let handle = runtime.spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = &mut stop_rx => break,
          _ = ticker.tick() => {
            if !tick().await {
              break;
            }
          }
        }
      }
      debug!(task = name, "background task stopped");
    });

    debug!(task = name, period_ms = period.as_millis() as u64, "background task started");
    Some(Self {
      stop: Some(stop_tx),
      handle: Some(handle),
    })
  }

  /// Signal the task and wait for its current tick to finish.
  pub async fn shutdown(mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }
}

impl Drop for BackgroundTask {
  fn drop(&mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
  }
}
