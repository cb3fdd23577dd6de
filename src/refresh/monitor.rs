//! Watchdog for refreshes that never release the update lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::JobHandle;
use super::task::{schedule_after, TaskHandle};
use super::trigger::UpdateTrigger;
use crate::cache::UpdateLock;

/// Timing of the stale-lock watchdog.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
  /// Delay between a refresh starting and the check
  pub delay: Duration,
  /// Locks older than this are deleted
  pub max_lock_age: Duration,
  /// A job waiting on the backend this long without progress counts as blocked
  pub stall_threshold: Duration,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      delay: Duration::from_secs(12 * 60 * 60),
      max_lock_age: Duration::from_secs(12 * 60 * 60),
      stall_threshold: Duration::from_secs(10 * 60),
    }
  }
}

/// What one check found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
  pub lock_present: bool,
  pub interrupted: bool,
  pub lock_removed: bool,
}

/// Re-armed at every refresh start; recovers from refreshes that hang or die.
///
/// Checks never fail. Anything that could not be fixed is logged and looked at
/// again on the next check, which the firing check schedules itself while the
/// lock is still present.
pub struct StaleLockMonitor {
  lock: Arc<UpdateLock>,
  config: MonitorConfig,
  shutdown: CancellationToken,
  current_job: Mutex<Option<Arc<JobHandle>>>,
  pending: Mutex<Option<TaskHandle>>,
  recovered: AtomicU64,
  trigger: Option<UpdateTrigger>,
}

impl StaleLockMonitor {
  pub fn new(lock: Arc<UpdateLock>, config: MonitorConfig, shutdown: CancellationToken) -> Self {
    Self {
      lock,
      config,
      shutdown,
      current_job: Mutex::new(None),
      pending: Mutex::new(None),
      recovered: AtomicU64::new(0),
      trigger: None,
    }
  }

  /// Ask `trigger` for a refresh whenever a scheduled check removes a lock.
  pub fn with_trigger(mut self, trigger: UpdateTrigger) -> Self {
    self.trigger = Some(trigger);
    self
  }

  pub fn config(&self) -> &MonitorConfig {
    &self.config
  }

  /// Watch `job` and (re)schedule the check, replacing any pending one.
  pub fn arm(self: &Arc<Self>, job: Arc<JobHandle>) {
    debug!(job = job.id(), delay_secs = self.config.delay.as_secs(), "Arming stale lock monitor");
    self.watch(job);
    let handle = self.spawn_check(self.config.delay);
    if let Some(previous) = self.pending_slot().replace(handle) {
      previous.cancel();
    }
  }

  /// Schedule a check unless one is already pending.
  ///
  /// Used when a lock exists that no job of ours created, so nothing else
  /// would arm the monitor.
  pub fn ensure_armed(self: &Arc<Self>) {
    let mut pending = self.pending_slot();
    let idle = pending
      .as_ref()
      .map_or(true, |task| task.is_cancelled() || task.is_finished());
    if idle && !self.shutdown.is_cancelled() {
      debug!(delay_secs = self.config.delay.as_secs(), "Arming stale lock monitor for foreign lock");
      *pending = Some(self.spawn_check(self.config.delay));
    }
  }

  /// Remember `job` as the refresh the next check may interrupt.
  pub fn watch(&self, job: Arc<JobHandle>) {
    *self.current_job.lock().unwrap_or_else(|p| p.into_inner()) = Some(job);
  }

  /// Cancel the pending check, if any.
  pub fn disarm(&self) {
    if let Some(pending) = self.pending_slot().take() {
      pending.cancel();
    }
  }

  /// Number of stale locks removed so far.
  pub fn locks_recovered(&self) -> u64 {
    self.recovered.load(Ordering::Relaxed)
  }

  pub fn check(&self) -> MonitorReport {
    self.check_at(SystemTime::now())
  }

  /// Inspect the lock as if the current time were `now`.
  pub fn check_at(&self, now: SystemTime) -> MonitorReport {
    let mut report = MonitorReport::default();
    if !self.lock.is_locked() {
      debug!("No update lock present, nothing to recover");
      return report;
    }
    report.lock_present = true;

    let job = self
      .current_job
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .clone();
    if let Some(job) = job {
      if !job.is_finished()
        && !job.token().is_cancelled()
        && job.is_blocked(self.config.stall_threshold)
      {
        warn!(job = job.id(), progress = job.progress(), "Refresh job appears blocked, interrupting");
        job.interrupt();
        report.interrupted = true;
      }
    }

    match self.lock.age_at(now) {
      Some(age) if age > self.config.max_lock_age => match self.lock.force_release() {
        Ok(removed) => {
          if removed {
            self.recovered.fetch_add(1, Ordering::Relaxed);
            warn!(
              age_secs = age.as_secs(),
              max_age_secs = self.config.max_lock_age.as_secs(),
              "Removed stale update lock"
            );
          }
          report.lock_removed = removed;
        }
        Err(e) => {
          error!(error = %e, path = %self.lock.path().display(), "Failed to remove stale update lock");
        }
      },
      Some(age) => {
        info!(age_secs = age.as_secs(), "Update lock still held, within max age");
      }
      None => {}
    }
    report
  }

  fn spawn_check(self: &Arc<Self>, delay: Duration) -> TaskHandle {
    let monitor = Arc::clone(self);
    schedule_after(delay, &self.shutdown, move |_| async move {
      monitor.fire();
    })
  }

  fn fire(self: &Arc<Self>) {
    // This task is the pending one; drop its handle without cancelling ourselves.
    self.pending_slot().take();
    let report = self.check();
    if report.lock_removed {
      if let Some(trigger) = &self.trigger {
        info!("Requesting refresh after stale lock recovery");
        trigger.request();
      }
    }
    if report.lock_present && !report.lock_removed && !self.shutdown.is_cancelled() {
      let successor = self.spawn_check(self.config.delay);
      if let Some(previous) = self.pending_slot().replace(successor) {
        previous.cancel();
      }
    }
  }

  fn pending_slot(&self) -> std::sync::MutexGuard<'_, Option<TaskHandle>> {
    self.pending.lock().unwrap_or_else(|p| p.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn monitor_for(dir: &TempDir, config: MonitorConfig) -> (Arc<StaleLockMonitor>, Arc<UpdateLock>) {
    let lock = Arc::new(UpdateLock::new(dir.path()));
    let monitor = Arc::new(StaleLockMonitor::new(lock.clone(), config, CancellationToken::new()));
    (monitor, lock)
  }

  fn thirty_minute_config() -> MonitorConfig {
    MonitorConfig {
      max_lock_age: Duration::from_secs(30 * 60),
      ..MonitorConfig::default()
    }
  }

  #[test]
  fn test_stale_lock_is_removed() {
    let dir = TempDir::new().unwrap();
    let (monitor, lock) = monitor_for(&dir, thirty_minute_config());
    let _guard = lock.try_acquire().unwrap().unwrap();

    let now = SystemTime::now();
    let report = monitor.check_at(now + Duration::from_secs(31 * 60));
    assert!(report.lock_present);
    assert!(report.lock_removed);
    assert!(!lock.is_locked());
    assert_eq!(monitor.locks_recovered(), 1);

    // Firing again on the resolved situation changes nothing.
    let again = monitor.check_at(now + Duration::from_secs(32 * 60));
    assert_eq!(again, MonitorReport::default());
    assert_eq!(monitor.locks_recovered(), 1);
  }

  #[test]
  fn test_young_lock_is_kept() {
    let dir = TempDir::new().unwrap();
    let (monitor, lock) = monitor_for(&dir, thirty_minute_config());
    let _guard = lock.try_acquire().unwrap().unwrap();

    let report = monitor.check_at(SystemTime::now() + Duration::from_secs(10 * 60));
    assert!(report.lock_present);
    assert!(!report.lock_removed);
    assert!(lock.is_locked());
  }

  #[test]
  fn test_no_lock_is_noop() {
    let dir = TempDir::new().unwrap();
    let (monitor, _) = monitor_for(&dir, MonitorConfig::default());
    assert_eq!(monitor.check(), MonitorReport::default());
    assert_eq!(monitor.check(), MonitorReport::default());
  }

  #[test]
  fn test_blocked_job_is_interrupted() {
    let dir = TempDir::new().unwrap();
    let config = MonitorConfig {
      stall_threshold: Duration::ZERO,
      ..MonitorConfig::default()
    };
    let (monitor, lock) = monitor_for(&dir, config);
    let _guard = lock.try_acquire().unwrap().unwrap();

    let job = Arc::new(JobHandle::new(7, CancellationToken::new()));
    monitor.watch(job.clone());
    let _waiting = job.waiting();

    let report = monitor.check();
    assert!(report.interrupted);
    assert!(job.token().is_cancelled());
    assert!(lock.is_locked());
  }

  #[test]
  fn test_busy_job_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let (monitor, lock) = monitor_for(&dir, MonitorConfig::default());
    let _guard = lock.try_acquire().unwrap().unwrap();

    let job = Arc::new(JobHandle::new(8, CancellationToken::new()));
    monitor.watch(job.clone());

    assert!(!monitor.check().interrupted);
    assert!(!job.token().is_cancelled());
  }

  #[tokio::test]
  async fn test_armed_check_fires() {
    let dir = TempDir::new().unwrap();
    let config = MonitorConfig {
      delay: Duration::from_millis(20),
      max_lock_age: Duration::ZERO,
      stall_threshold: Duration::from_secs(600),
    };
    let (monitor, lock) = monitor_for(&dir, config);
    let _guard = lock.try_acquire().unwrap().unwrap();

    monitor.arm(Arc::new(JobHandle::new(9, CancellationToken::new())));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!lock.is_locked());
    assert_eq!(monitor.locks_recovered(), 1);
  }

  #[tokio::test]
  async fn test_foreign_lock_is_recovered_once_over_age() {
    let dir = TempDir::new().unwrap();
    let config = MonitorConfig {
      delay: Duration::from_millis(30),
      max_lock_age: Duration::from_millis(150),
      stall_threshold: Duration::from_secs(600),
    };
    let lock = Arc::new(UpdateLock::new(dir.path()));
    let trigger = UpdateTrigger::new();
    let monitor = Arc::new(
      StaleLockMonitor::new(lock.clone(), config, CancellationToken::new()).with_trigger(trigger.clone()),
    );
    // Left behind by another process: no guard of ours, no job to watch.
    std::fs::write(lock.path(), b"").unwrap();

    monitor.ensure_armed();
    monitor.ensure_armed();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(lock.is_locked(), "young lock must survive the first checks");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!lock.is_locked());
    assert_eq!(monitor.locks_recovered(), 1);
    assert_eq!(trigger.requests(), 1);
  }
}
