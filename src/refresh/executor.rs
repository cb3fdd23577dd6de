//! Hard-timeout wrapper around blocking backend calls.
//!
//! The metadata backend has no cancellation of its own and occasionally never
//! returns. Every call therefore runs on a dedicated worker thread while the
//! caller waits with a deadline. A worker whose call overran is abandoned (it
//! exits on its own once the call returns, if ever) and the next call gets a
//! fresh one.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::CallError;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
  id: u64,
  tasks: mpsc::Sender<Task>,
}

/// Runs one blocking call at a time on a single replaceable worker thread.
pub struct BoundedCallExecutor {
  name: String,
  worker: Mutex<Option<Worker>>,
  spawned: AtomicU64,
  abandoned: AtomicU64,
}

impl BoundedCallExecutor {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      worker: Mutex::new(None),
      spawned: AtomicU64::new(0),
      abandoned: AtomicU64::new(0),
    }
  }

  /// Run `op` on the worker and wait at most `timeout` for its result.
  ///
  /// Concurrent callers queue up; each gets its own full `timeout` once its
  /// call has started.
  pub async fn call<F, R>(&self, op: F, timeout: Duration) -> Result<R, CallError>
  where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
  {
    let mut in_flight = InFlight {
      slot: self.worker.lock().await,
      armed: false,
      executor: self,
    };

    let worker = match in_flight.slot.take() {
      Some(worker) => worker,
      None => self.spawn_worker()?,
    };

    let (tx, rx) = oneshot::channel();
    let task: Task = Box::new(move || {
      let _ = tx.send(op());
    });
    if worker.tasks.send(task).is_err() {
      warn!(executor = %self.name, worker = worker.id, "Worker thread is gone, discarding it");
      return Err(CallError::WorkerPanicked);
    }
    *in_flight.slot = Some(worker);
    in_flight.armed = true;

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(value)) => {
        in_flight.armed = false;
        Ok(value)
      }
      Ok(Err(_)) => {
        // The task unwound and dropped its sender; the worker itself survived.
        in_flight.armed = false;
        Err(CallError::WorkerPanicked)
      }
      Err(_) => {
        warn!(
          executor = %self.name,
          timeout_secs = timeout.as_secs_f64(),
          "Backend call timed out, abandoning worker"
        );
        Err(CallError::TimedOut(timeout))
      }
    }
  }

  /// Number of worker threads started so far.
  pub fn workers_spawned(&self) -> u64 {
    self.spawned.load(Ordering::Relaxed)
  }

  /// Number of workers abandoned because their call did not finish.
  pub fn workers_abandoned(&self) -> u64 {
    self.abandoned.load(Ordering::Relaxed)
  }

  fn spawn_worker(&self) -> Result<Worker, CallError> {
    let id = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
    let (tasks, queue) = mpsc::channel::<Task>();
    let name = format!("{}-worker-{}", self.name, id);

    thread::Builder::new()
      .name(name.clone())
      .spawn(move || {
        while let Ok(task) = queue.recv() {
          if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!(worker = %name, "Backend call panicked");
          }
        }
        debug!(worker = %name, "Executor worker exiting");
      })
      .map_err(CallError::Spawn)?;

    debug!(executor = %self.name, worker = id, "Started executor worker");
    Ok(Worker { id, tasks })
  }
}

/// Discards the worker unless the call is disarmed before drop, which covers
/// both timeouts and callers that stop polling mid-call.
struct InFlight<'a> {
  slot: MutexGuard<'a, Option<Worker>>,
  armed: bool,
  executor: &'a BoundedCallExecutor,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    if let Some(worker) = self.slot.take() {
      self.executor.abandoned.fetch_add(1, Ordering::Relaxed);
      debug!(executor = %self.executor.name, worker = worker.id, "Discarded executor worker");
    }
  }
}
