//! One refresh run over all registered caches.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::BoundedCallExecutor;
use super::monitor::StaleLockMonitor;
use crate::cache::{UpdateLock, UpdateLockGuard, LOCK_FILE_NAME};
use crate::error::RefreshError;

/// Lifecycle of a refresh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  Idle,
  LockAcquired,
  Running,
  Completed,
  Aborted,
  Cancelled,
  LockReleased,
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      JobState::Idle => "idle",
      JobState::LockAcquired => "lock_acquired",
      JobState::Running => "running",
      JobState::Completed => "completed",
      JobState::Aborted => "aborted",
      JobState::Cancelled => "cancelled",
      JobState::LockReleased => "lock_released",
    };
    f.write_str(name)
  }
}

/// Shared view of a running job: its cancellation token plus enough activity
/// tracking for the stale-lock monitor to tell "slow" from "stuck".
#[derive(Debug)]
pub struct JobHandle {
  id: u64,
  token: CancellationToken,
  state: Mutex<JobState>,
  finished: AtomicBool,
  waiting: AtomicBool,
  progress: AtomicU64,
  last_progress: Mutex<Instant>,
  started_at: SystemTime,
}

impl JobHandle {
  pub fn new(id: u64, token: CancellationToken) -> Self {
    Self {
      id,
      token,
      state: Mutex::new(JobState::Idle),
      finished: AtomicBool::new(false),
      waiting: AtomicBool::new(false),
      progress: AtomicU64::new(0),
      last_progress: Mutex::new(Instant::now()),
      started_at: SystemTime::now(),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  pub fn started_at(&self) -> SystemTime {
    self.started_at
  }

  pub fn state(&self) -> JobState {
    *self.state.lock().unwrap_or_else(|p| p.into_inner())
  }

  pub(crate) fn set_state(&self, next: JobState) {
    let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
    let previous = *state;
    debug!(job = self.id, from = %previous, to = %next, "Refresh job state change");
    *state = next;
  }

  /// Whether the job has released its lock (or never got one).
  pub fn is_finished(&self) -> bool {
    self.finished.load(Ordering::Acquire)
  }

  fn mark_finished(&self) {
    self.finished.store(true, Ordering::Release);
  }

  /// Mark the job as blocked on a backend call until the guard is dropped.
  pub fn waiting(&self) -> WaitGuard<'_> {
    self.waiting.store(true, Ordering::Release);
    self.record_progress();
    WaitGuard { job: self }
  }

  pub fn is_waiting(&self) -> bool {
    self.waiting.load(Ordering::Acquire)
  }

  /// Note that the job produced something (e.g. one streamed entity).
  pub fn record_progress(&self) {
    self.progress.fetch_add(1, Ordering::Relaxed);
    *self.last_progress.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
  }

  pub fn progress(&self) -> u64 {
    self.progress.load(Ordering::Relaxed)
  }

  /// Waiting on the backend without any progress for at least `stall`.
  pub fn is_blocked(&self, stall: Duration) -> bool {
    self.is_waiting()
      && self
        .last_progress
        .lock()
        .map(|t| t.elapsed() >= stall)
        .unwrap_or(true)
  }

  /// Ask the job to stop at its next cancellation check.
  pub fn interrupt(&self) {
    self.token.cancel();
  }
}

/// Clears the waiting flag of a [`JobHandle`] on drop.
pub struct WaitGuard<'a> {
  job: &'a JobHandle,
}

impl Drop for WaitGuard<'_> {
  fn drop(&mut self) {
    self.job.waiting.store(false, Ordering::Release);
  }
}

/// What a refresh job needs to update one cache.
pub struct RefreshContext {
  pub executor: Arc<BoundedCallExecutor>,
  pub job: Arc<JobHandle>,
  pub call_timeout: Duration,
  pub streaming_timeout: Duration,
}

/// A cache that a refresh job can update, in registration order.
pub trait RefreshTarget: Send + Sync {
  fn name(&self) -> &str;

  fn requires_update(&self) -> bool;

  /// Fetch fresh data from the metadata source and store it. Returns the
  /// number of entities stored.
  fn update<'a>(&'a self, ctx: &'a RefreshContext) -> BoxFuture<'a, Result<usize, RefreshError>>;
}

/// How a refresh job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
  Completed { updated: usize },
  Aborted { cache: String, error: String },
  Cancelled,
  /// Another refresh held the lock; nothing was done.
  Skipped,
}

/// Updates every registered cache in order while holding the update lock.
pub struct RefreshJob {
  pub(crate) handle: Arc<JobHandle>,
  pub(crate) targets: Vec<Arc<dyn RefreshTarget>>,
  pub(crate) lock: Arc<UpdateLock>,
  pub(crate) monitor: Arc<StaleLockMonitor>,
  pub(crate) executor: Arc<BoundedCallExecutor>,
  pub(crate) call_timeout: Duration,
  pub(crate) streaming_timeout: Duration,
}

impl RefreshJob {
  pub fn handle(&self) -> &Arc<JobHandle> {
    &self.handle
  }

  pub async fn run(self) -> RefreshOutcome {
    let job = Arc::clone(&self.handle);

    let guard = match self.acquire_lock() {
      Ok(Some(guard)) => guard,
      Ok(None) => {
        debug!(job = job.id(), "Refresh already in progress, skipping");
        job.mark_finished();
        return RefreshOutcome::Skipped;
      }
      Err(e) => {
        error!(job = job.id(), error = %e, "Failed to create update lock");
        job.mark_finished();
        return RefreshOutcome::Aborted {
          cache: LOCK_FILE_NAME.to_string(),
          error: e.to_string(),
        };
      }
    };
    job.set_state(JobState::LockAcquired);
    self.monitor.arm(Arc::clone(&job));

    job.set_state(JobState::Running);
    info!(job = job.id(), caches = self.targets.len(), "Cache refresh started");
    let outcome = self.update_all().await;

    job.set_state(match &outcome {
      RefreshOutcome::Completed { .. } => JobState::Completed,
      RefreshOutcome::Cancelled => JobState::Cancelled,
      _ => JobState::Aborted,
    });

    if let Err(e) = guard.release() {
      error!(job = job.id(), error = %e, "Failed to release update lock");
    }
    job.set_state(JobState::LockReleased);
    job.mark_finished();
    job.set_state(JobState::Idle);

    match &outcome {
      RefreshOutcome::Completed { updated } => {
        info!(job = job.id(), updated, "Cache refresh completed")
      }
      RefreshOutcome::Cancelled => warn!(job = job.id(), "Cache refresh cancelled"),
      RefreshOutcome::Aborted { cache, error } => {
        error!(job = job.id(), cache = %cache, error = %error, "Cache refresh aborted")
      }
      RefreshOutcome::Skipped => {}
    }
    outcome
  }

  /// Take the lock, first removing it if it is older than the monitor allows.
  ///
  /// A lock that is still young is left alone, with a monitor check pending so
  /// it is looked at again even if its owner died.
  fn acquire_lock(&self) -> io::Result<Option<UpdateLockGuard>> {
    if let Some(guard) = self.lock.try_acquire()? {
      return Ok(Some(guard));
    }
    if self.monitor.check().lock_removed {
      info!(job = self.handle.id(), "Recovered stale update lock, retrying");
      return self.lock.try_acquire();
    }
    self.monitor.ensure_armed();
    Ok(None)
  }

  async fn update_all(&self) -> RefreshOutcome {
    let ctx = RefreshContext {
      executor: Arc::clone(&self.executor),
      job: Arc::clone(&self.handle),
      call_timeout: self.call_timeout,
      streaming_timeout: self.streaming_timeout,
    };

    let mut updated = 0;
    for target in &self.targets {
      if self.handle.token().is_cancelled() {
        return RefreshOutcome::Cancelled;
      }
      match target.update(&ctx).await {
        Ok(entries) => {
          info!(job = self.handle.id(), cache = target.name(), entries, "Cache updated");
          updated += 1;
        }
        Err(RefreshError::Cancelled) => return RefreshOutcome::Cancelled,
        Err(e) => {
          return RefreshOutcome::Aborted {
            cache: target.name().to_string(),
            error: e.to_string(),
          };
        }
      }
    }
    RefreshOutcome::Completed { updated }
  }
}
