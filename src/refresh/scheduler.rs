//! Decides when refresh jobs run and keeps them from overlapping.
//!
//! A refresh runs:
//! - once at startup, for the caches that need it (if enabled),
//! - every day at the configured time plus a small random jitter, for all caches,
//! - on demand, through [`Scheduler::force_update`] or an [`UpdateTrigger`] request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use rand::Rng;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::BoundedCallExecutor;
use super::job::{JobHandle, RefreshJob, RefreshOutcome, RefreshTarget};
use super::monitor::{MonitorConfig, StaleLockMonitor};
use super::trigger::UpdateTrigger;
use crate::cache::UpdateLock;

/// How long shutdown waits for running jobs to notice cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Scheduling and timeout settings.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
  /// Refresh stale caches right after start
  pub update_on_startup: bool,
  /// Local time of day of the recurring refresh
  pub update_time: NaiveTime,
  /// Nominal interval of the recurring refresh. Firings follow the local
  /// `update_time`, so a day across a DST change is shorter or longer.
  pub period: Duration,
  /// Upper bound of the random delay added to `update_time`
  pub max_jitter: Duration,
  /// Deadline of one bulk backend call
  pub call_timeout: Duration,
  /// Deadline of one streamed population
  pub streaming_timeout: Duration,
  /// Stale-lock watchdog; its delay is normally half of `period`
  pub monitor: MonitorConfig,
}

impl Default for ScheduleConfig {
  fn default() -> Self {
    let period = Duration::from_secs(24 * 60 * 60);
    Self {
      update_on_startup: true,
      update_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN),
      period,
      max_jitter: Duration::from_secs(20),
      call_timeout: Duration::from_secs(5 * 60),
      streaming_timeout: Duration::from_secs(60 * 60),
      monitor: MonitorConfig {
        delay: period / 2,
        ..MonitorConfig::default()
      },
    }
  }
}

/// Owns the registered caches and runs their refresh jobs.
pub struct Scheduler {
  inner: Arc<SchedulerInner>,
  scheduling: Mutex<Option<JoinHandle<()>>>,
}

struct SchedulerInner {
  targets: Vec<Arc<dyn RefreshTarget>>,
  lock: Arc<UpdateLock>,
  monitor: Arc<StaleLockMonitor>,
  executor: Arc<BoundedCallExecutor>,
  trigger: UpdateTrigger,
  config: ScheduleConfig,
  shutdown: CancellationToken,
  next_job_id: AtomicU64,
  jobs: Mutex<Vec<(Arc<JobHandle>, AbortHandle)>>,
  next_fire: Mutex<Option<DateTime<Local>>>,
}

impl Scheduler {
  /// Start scheduling refreshes of `targets`, in the given order.
  ///
  /// Must be called from within a tokio runtime.
  pub fn start(
    targets: Vec<Arc<dyn RefreshTarget>>,
    lock: Arc<UpdateLock>,
    trigger: UpdateTrigger,
    config: ScheduleConfig,
  ) -> Self {
    let shutdown = CancellationToken::new();
    let monitor = Arc::new(
      StaleLockMonitor::new(Arc::clone(&lock), config.monitor.clone(), shutdown.clone())
        .with_trigger(trigger.clone()),
    );
    let inner = Arc::new(SchedulerInner {
      targets,
      lock,
      monitor,
      executor: Arc::new(BoundedCallExecutor::new("metadata")),
      trigger,
      config,
      shutdown,
      next_job_id: AtomicU64::new(0),
      jobs: Mutex::new(Vec::new()),
      next_fire: Mutex::new(None),
    });

    // A lock left behind by a process that died mid-refresh must not block us forever.
    if inner.lock.is_locked() && inner.recover_stale_lock() {
      info!("Removed stale update lock found at startup");
    }

    if inner.config.update_on_startup {
      let stale: Vec<Arc<dyn RefreshTarget>> = inner
        .targets
        .iter()
        .filter(|target| target.requires_update())
        .cloned()
        .collect();
      if stale.is_empty() {
        info!("No cache update needed at startup");
      } else {
        let names: Vec<&str> = stale.iter().map(|t| t.name()).collect();
        info!(caches = ?names, "Caches require update, scheduling startup refresh");
        inner.spawn_job(stale);
      }
    }

    let scheduling = tokio::spawn(Arc::clone(&inner).scheduling_loop());
    Self {
      inner,
      scheduling: Mutex::new(Some(scheduling)),
    }
  }

  /// Schedule an immediate refresh of all caches unless one is already running.
  ///
  /// Returns whether a refresh was scheduled.
  pub fn force_update(&self) -> bool {
    self.inner.force_update()
  }

  /// Start a refresh of all caches now and hand back its outcome.
  ///
  /// The job itself still skips if another refresh holds the lock.
  pub fn run_now(&self) -> JoinHandle<RefreshOutcome> {
    self.inner.spawn_job(self.inner.targets.clone())
  }

  /// Whether a refresh is in progress anywhere (the lock file exists).
  pub fn is_currently_locked(&self) -> bool {
    self.inner.lock.is_locked()
  }

  pub fn monitor(&self) -> &Arc<StaleLockMonitor> {
    &self.inner.monitor
  }

  pub fn executor(&self) -> &Arc<BoundedCallExecutor> {
    &self.inner.executor
  }

  /// When the recurring refresh fires next, once the scheduling task computed it.
  pub fn next_fire_time(&self) -> Option<DateTime<Local>> {
    *self
      .inner
      .next_fire
      .lock()
      .unwrap_or_else(|p| p.into_inner())
  }

  /// Stop all scheduled work, cancel running jobs and release our lock.
  pub async fn shutdown(&self) {
    info!("Shutting down cache scheduler");
    self.inner.shutdown.cancel();
    self.inner.monitor.disarm();

    let scheduling = self
      .scheduling
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .take();
    if let Some(scheduling) = scheduling {
      let _ = scheduling.await;
    }

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    loop {
      let running = self.inner.running_jobs();
      if running.is_empty() {
        break;
      }
      if tokio::time::Instant::now() >= deadline {
        warn!(jobs = running.len(), "Refresh jobs did not stop in time, aborting them");
        for (_, abort) in running {
          abort.abort();
        }
        break;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }

    match self.inner.lock.release_if_held() {
      Ok(true) => info!("Released update lock held by this process"),
      Ok(false) => {}
      Err(e) => warn!(error = %e, "Failed to release update lock on shutdown"),
    }
  }
}

impl SchedulerInner {
  fn force_update(&self) -> bool {
    if self.lock.is_locked() && !self.recover_stale_lock() {
      debug!("Refresh already in progress, ignoring forced update");
      return false;
    }
    info!("Forced cache refresh scheduled");
    self.spawn_job(self.targets.clone());
    true
  }

  /// Check the current lock right away. Returns whether it is gone; a lock
  /// that stays gets a pending monitor check.
  fn recover_stale_lock(&self) -> bool {
    let report = self.monitor.check();
    if report.lock_removed || !self.lock.is_locked() {
      return true;
    }
    self.monitor.ensure_armed();
    false
  }

  fn spawn_job(&self, targets: Vec<Arc<dyn RefreshTarget>>) -> JoinHandle<RefreshOutcome> {
    let id = self.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
    let handle = Arc::new(JobHandle::new(id, self.shutdown.child_token()));
    let job = RefreshJob {
      handle: Arc::clone(&handle),
      targets,
      lock: Arc::clone(&self.lock),
      monitor: Arc::clone(&self.monitor),
      executor: Arc::clone(&self.executor),
      call_timeout: self.config.call_timeout,
      streaming_timeout: self.config.streaming_timeout,
    };

    let join = tokio::spawn(job.run());
    let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
    jobs.retain(|(job, abort)| !job.is_finished() && !abort.is_finished());
    jobs.push((handle, join.abort_handle()));
    join
  }

  fn running_jobs(&self) -> Vec<(Arc<JobHandle>, AbortHandle)> {
    let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
    jobs.retain(|(job, abort)| !job.is_finished() && !abort.is_finished());
    jobs.clone()
  }

  async fn scheduling_loop(self: Arc<Self>) {
    let jitter = random_jitter(self.config.max_jitter);
    let mut next = next_fire_time(&Local::now(), self.config.update_time, jitter);

    loop {
      *self.next_fire.lock().unwrap_or_else(|p| p.into_inner()) = Some(next);
      info!(next = %next.format("%Y-%m-%d %H:%M:%S %z"), "Next scheduled cache refresh");
      let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);

      tokio::select! {
        _ = self.shutdown.cancelled() => break,
        _ = self.trigger.requested() => {
          self.force_update();
        }
        _ = tokio::time::sleep(wait) => {
          info!("Scheduled cache refresh due");
          self.spawn_job(self.targets.clone());
          // The wall clock may lag the timer slightly; never fire the same slot twice.
          let from = std::cmp::max(Local::now(), next);
          next = next_fire_time(&from, self.config.update_time, jitter);
        }
      }
    }
    debug!("Scheduling task stopped");
  }
}

fn random_jitter(max: Duration) -> Duration {
  let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
  Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// First occurrence of `at` (plus `jitter`) strictly after `now`.
pub fn next_fire_time<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime, jitter: Duration) -> DateTime<Tz> {
  let jitter = chrono::Duration::from_std(jitter).unwrap_or_else(|_| chrono::Duration::zero());
  let timezone = now.timezone();
  let today = now.date_naive();

  // Two days ahead covers a time of day skipped by a DST transition.
  for offset in 0..=2 {
    let Some(date) = today.checked_add_days(Days::new(offset)) else {
      break;
    };
    if let Some(candidate) = timezone.from_local_datetime(&date.and_time(at)).earliest() {
      let candidate = candidate + jitter;
      if candidate > *now {
        return candidate;
      }
    }
  }
  now.clone() + chrono::Duration::days(1)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::RefreshError;
  use crate::refresh::RefreshContext;
  use chrono::Utc;
  use futures::future::BoxFuture;
  use futures::FutureExt;
  use tempfile::TempDir;

  #[derive(Clone)]
  struct FakeTarget {
    name: &'static str,
    stale: bool,
    fail: bool,
    block: bool,
    log: Arc<Mutex<Vec<&'static str>>>,
  }

  impl FakeTarget {
    fn new(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
      Self {
        name,
        stale: false,
        fail: false,
        block: false,
        log: log.clone(),
      }
    }
  }

  impl RefreshTarget for FakeTarget {
    fn name(&self) -> &str {
      self.name
    }

    fn requires_update(&self) -> bool {
      self.stale
    }

    fn update<'a>(&'a self, ctx: &'a RefreshContext) -> BoxFuture<'a, Result<usize, RefreshError>> {
      async move {
        self.log.lock().unwrap().push(self.name);
        if self.block {
          ctx.job.token().cancelled().await;
          return Err(RefreshError::Cancelled);
        }
        if self.fail {
          return Err(RefreshError::Source("backend unreachable".to_string()));
        }
        Ok(1)
      }
      .boxed()
    }
  }

  fn quiet_config() -> ScheduleConfig {
    ScheduleConfig {
      update_on_startup: false,
      update_time: (Local::now() + chrono::Duration::hours(6)).time(),
      ..ScheduleConfig::default()
    }
  }

  fn start(dir: &TempDir, targets: Vec<FakeTarget>, config: ScheduleConfig) -> (Scheduler, Arc<UpdateLock>, UpdateTrigger) {
    let lock = Arc::new(UpdateLock::new(dir.path()));
    let trigger = UpdateTrigger::new();
    let targets: Vec<Arc<dyn RefreshTarget>> = targets
      .into_iter()
      .map(|t| Arc::new(t) as Arc<dyn RefreshTarget>)
      .collect();
    let scheduler = Scheduler::start(targets, lock.clone(), trigger.clone(), config);
    (scheduler, lock, trigger)
  }

  async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    wait_within(Duration::from_secs(2), condition).await
  }

  async fn wait_within<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
      if condition() {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
  }

  fn leave_foreign_lock(lock: &UpdateLock, age: Duration) {
    std::fs::write(lock.path(), b"").unwrap();
    std::fs::File::options()
      .write(true)
      .open(lock.path())
      .unwrap()
      .set_modified(std::time::SystemTime::now() - age)
      .unwrap();
  }

  fn fast_monitor(max_lock_age: Duration) -> MonitorConfig {
    MonitorConfig {
      delay: Duration::from_millis(50),
      max_lock_age,
      stall_threshold: Duration::from_secs(600),
    }
  }

  #[tokio::test]
  async fn test_failure_stops_remaining_caches_and_releases_lock() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut a = FakeTarget::new("a", &log);
    a.fail = true;
    let b = FakeTarget::new("b", &log);
    let (scheduler, lock, _) = start(&dir, vec![a, b], quiet_config());

    let outcome = scheduler.run_now().await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::Aborted { ref cache, .. } if cache == "a"));
    assert_eq!(*log.lock().unwrap(), vec!["a"]);
    assert!(!lock.is_locked());
    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_caches_update_in_registration_order() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let targets = vec![FakeTarget::new("units", &log), FakeTarget::new("offerings", &log)];
    let (scheduler, _, _) = start(&dir, targets, quiet_config());

    let outcome = scheduler.run_now().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Completed { updated: 2 });
    assert_eq!(*log.lock().unwrap(), vec!["units", "offerings"]);
    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_force_update_is_noop_while_locked() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (scheduler, lock, _) = start(&dir, vec![FakeTarget::new("a", &log)], quiet_config());
    std::fs::write(lock.path(), b"").unwrap();

    assert!(!scheduler.force_update());
    assert!(scheduler.is_currently_locked());
    assert_eq!(scheduler.run_now().await.unwrap(), RefreshOutcome::Skipped);
    assert!(log.lock().unwrap().is_empty());
    assert!(scheduler.is_currently_locked());

    scheduler.shutdown().await;
    assert!(lock.is_locked(), "a lock created elsewhere must survive our shutdown");
  }

  #[tokio::test]
  async fn test_startup_refreshes_only_stale_caches() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let fresh = FakeTarget::new("fresh", &log);
    let mut stale = FakeTarget::new("stale", &log);
    stale.stale = true;
    let config = ScheduleConfig {
      update_on_startup: true,
      ..quiet_config()
    };
    let (scheduler, lock, _) = start(&dir, vec![fresh, stale], config);

    assert!(wait_for(|| log.lock().unwrap().len() == 1).await);
    assert!(wait_for(|| !lock.is_locked()).await);
    assert_eq!(*log.lock().unwrap(), vec!["stale"]);
    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_startup_without_stale_caches_does_nothing() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let config = ScheduleConfig {
      update_on_startup: true,
      ..quiet_config()
    };
    let (scheduler, _, _) = start(&dir, vec![FakeTarget::new("a", &log)], config);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(log.lock().unwrap().is_empty());
    assert!(wait_for(|| scheduler.next_fire_time().is_some()).await);
    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_trigger_request_runs_refresh() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (scheduler, _, trigger) = start(&dir, vec![FakeTarget::new("a", &log)], quiet_config());

    trigger.request();
    assert!(wait_for(|| log.lock().unwrap().len() == 1).await);
    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_shutdown_cancels_job_and_releases_lock() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut blocking = FakeTarget::new("slow", &log);
    blocking.block = true;
    let (scheduler, lock, _) = start(&dir, vec![blocking], quiet_config());

    let job = scheduler.run_now();
    assert!(wait_for(|| lock.is_locked()).await);

    scheduler.shutdown().await;
    assert_eq!(job.await.unwrap(), RefreshOutcome::Cancelled);
    assert!(!lock.is_locked());
  }

  #[tokio::test]
  async fn test_lock_left_by_dead_process_is_removed_at_startup() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let lock = UpdateLock::new(dir.path());
    leave_foreign_lock(&lock, Duration::from_secs(3600));

    let mut stale = FakeTarget::new("a", &log);
    stale.stale = true;
    let config = ScheduleConfig {
      update_on_startup: true,
      monitor: fast_monitor(Duration::from_secs(60)),
      ..quiet_config()
    };
    let (scheduler, lock, _) = start(&dir, vec![stale], config);

    assert!(wait_for(|| !log.lock().unwrap().is_empty()).await);
    assert_eq!(scheduler.monitor().locks_recovered(), 1);
    assert!(wait_for(|| !lock.is_locked()).await);

    // Later refreshes take the lock normally.
    assert_eq!(scheduler.run_now().await.unwrap(), RefreshOutcome::Completed { updated: 1 });
    assert!(!lock.is_locked());
    assert_eq!(scheduler.monitor().locks_recovered(), 1);
    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_young_foreign_lock_is_recovered_once_it_ages() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let lock = UpdateLock::new(dir.path());
    leave_foreign_lock(&lock, Duration::ZERO);

    let mut stale = FakeTarget::new("a", &log);
    stale.stale = true;
    let config = ScheduleConfig {
      update_on_startup: true,
      monitor: fast_monitor(Duration::from_millis(200)),
      ..quiet_config()
    };
    let (scheduler, lock, _) = start(&dir, vec![stale], config);

    // The startup job finds the lock too young and skips.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(log.lock().unwrap().is_empty());

    // The pending check removes it later and asks for a refresh.
    assert!(wait_for(|| !log.lock().unwrap().is_empty()).await);
    assert_eq!(scheduler.monitor().locks_recovered(), 1);
    assert!(wait_for(|| !lock.is_locked()).await);
    scheduler.shutdown().await;
  }

  #[tokio::test]
  async fn test_daily_firing_runs_all_caches_and_moves_to_next_day() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let targets = vec![FakeTarget::new("units", &log), FakeTarget::new("offerings", &log)];
    let config = ScheduleConfig {
      update_on_startup: false,
      update_time: (Local::now() + chrono::Duration::milliseconds(1500)).time(),
      max_jitter: Duration::ZERO,
      ..ScheduleConfig::default()
    };
    let (scheduler, lock, _) = start(&dir, targets, config);

    assert!(wait_for(|| scheduler.next_fire_time().is_some()).await);
    let first = scheduler.next_fire_time().unwrap();
    assert!(log.lock().unwrap().is_empty());

    assert!(wait_within(Duration::from_secs(5), || log.lock().unwrap().len() == 2).await);
    assert_eq!(*log.lock().unwrap(), vec!["units", "offerings"]);
    assert!(wait_for(|| scheduler.next_fire_time() != Some(first)).await);

    let second = scheduler.next_fire_time().unwrap();
    assert_eq!(second.time(), first.time());
    assert_eq!(second.date_naive(), first.date_naive().succ_opt().unwrap());
    assert!(wait_for(|| !lock.is_locked()).await);
    assert_eq!(log.lock().unwrap().len(), 2, "a daily slot fires once");
    scheduler.shutdown().await;
  }

  #[test]
  fn test_default_monitor_delay_is_half_the_period() {
    let config = ScheduleConfig::default();
    assert_eq!(config.monitor.delay, config.period / 2);
  }

  #[test]
  fn test_next_fire_time_from_a_firing_is_next_day() {
    let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
    let jitter = Duration::from_secs(7);
    let fired = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 7).unwrap();

    let next = next_fire_time(&fired, at, jitter);
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 7).unwrap());
  }

  #[test]
  fn test_next_fire_time_later_today() {
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap();
    let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();

    let next = next_fire_time(&now, at, Duration::from_secs(15));
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 15).unwrap());
  }

  #[test]
  fn test_next_fire_time_rolls_over_to_tomorrow() {
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
    let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();

    let next = next_fire_time(&now, at, Duration::ZERO);
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap());
  }

  #[test]
  fn test_jitter_stays_in_bounds() {
    for _ in 0..100 {
      assert!(random_jitter(Duration::from_secs(20)) <= Duration::from_secs(20));
    }
    assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
  }
}
