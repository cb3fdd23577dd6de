//! Delayed background tasks with cancellable handles.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a task started by [`schedule_after`].
///
/// Cancelling before the delay elapses means the task body never runs.
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
  token: CancellationToken,
  join: JoinHandle<()>,
}

impl TaskHandle {
  pub fn cancel(&self) {
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn is_finished(&self) -> bool {
    self.join.is_finished()
  }
}

/// Run `task` after `delay`, unless the returned handle or `parent` is cancelled first.
///
/// The task body receives the task's own token, so it can keep polling for
/// cancellation after it has started.
pub fn schedule_after<F, Fut>(delay: Duration, parent: &CancellationToken, task: F) -> TaskHandle
where
  F: FnOnce(CancellationToken) -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let token = parent.child_token();
  let task_token = token.clone();
  let join = tokio::spawn(async move {
    tokio::select! {
      _ = task_token.cancelled() => {}
      _ = tokio::time::sleep(delay) => {
        task(task_token).await;
      }
    }
  });
  TaskHandle { token, join }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;

  #[tokio::test]
  async fn test_runs_after_delay() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let handle = schedule_after(Duration::from_millis(20), &CancellationToken::new(), move |_| async move {
      flag.store(true, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(ran.load(Ordering::SeqCst));
    assert!(handle.is_finished());
  }

  #[tokio::test]
  async fn test_cancelled_task_never_runs() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let parent = CancellationToken::new();
    let handle = schedule_after(Duration::from_millis(50), &parent, move |_| async move {
      flag.store(true, Ordering::SeqCst);
    });

    parent.cancel();
    assert!(handle.is_cancelled());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!ran.load(Ordering::SeqCst));
  }
}
