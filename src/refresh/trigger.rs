//! Wake-up handle that lets readers ask for an immediate refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TriggerInner {
  notify: Notify,
  requests: AtomicU64,
}

/// Cloneable handle shared by the caches (senders) and the scheduler (listener).
///
/// Requests coalesce: any number of requests made while the scheduler is busy
/// wake it up once.
#[derive(Debug, Clone, Default)]
pub struct UpdateTrigger {
  inner: Arc<TriggerInner>,
}

impl UpdateTrigger {
  pub fn new() -> Self {
    Self::default()
  }

  /// Ask for an immediate refresh. Never blocks.
  pub fn request(&self) {
    self.inner.requests.fetch_add(1, Ordering::Relaxed);
    self.inner.notify.notify_one();
  }

  /// Total number of requests made since creation.
  pub fn requests(&self) -> u64 {
    self.inner.requests.load(Ordering::Relaxed)
  }

  /// Wait for the next request.
  pub async fn requested(&self) {
    self.inner.notify.notified().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_request_before_wait_is_not_lost() {
    let trigger = UpdateTrigger::new();
    trigger.request();
    trigger.request();

    let woke = tokio::time::timeout(Duration::from_secs(1), trigger.requested()).await;
    assert!(woke.is_ok());
    assert_eq!(trigger.requests(), 2);
  }
}
