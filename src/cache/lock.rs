//! Advisory, file-based "refresh in progress" marker.
//!
//! `cache.lock` is a zero-length file. Its existence means a refresh is running
//! somewhere and its modification time is the moment that refresh started.
//! Creation uses `create_new`, so two instances racing to start a refresh
//! cannot both succeed.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, warn};

pub const LOCK_FILE_NAME: &str = "cache.lock";

/// Lock created by this process, identified by an in-process generation.
#[derive(Debug, Clone, Copy)]
struct Holding {
  generation: u64,
  created: Option<SystemTime>,
}

/// Handle on the `cache.lock` file of one cache directory.
#[derive(Debug)]
pub struct UpdateLock {
  path: PathBuf,
  held: Mutex<Option<Holding>>,
  generations: AtomicU64,
}

impl UpdateLock {
  pub fn new(dir: &Path) -> Self {
    Self {
      path: dir.join(LOCK_FILE_NAME),
      held: Mutex::new(None),
      generations: AtomicU64::new(0),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Try to create the lock file.
  ///
  /// Returns `Ok(None)` when the file already exists (another refresh owns it).
  pub fn try_acquire(self: &Arc<Self>) -> io::Result<Option<UpdateLockGuard>> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }
    let file = match OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(&self.path)
    {
      Ok(file) => file,
      Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
      Err(e) => return Err(e),
    };
    let created = file.metadata().and_then(|m| m.modified()).ok();
    let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
    *self.held.lock().unwrap_or_else(|p| p.into_inner()) = Some(Holding {
      generation,
      created,
    });
    debug!(path = %self.path.display(), generation, "Update lock acquired");

    Ok(Some(UpdateLockGuard {
      lock: Arc::clone(self),
      generation: Some(generation),
    }))
  }

  /// Whether any process currently holds the lock.
  pub fn is_locked(&self) -> bool {
    self.path.exists()
  }

  /// Whether the current lock file was created by this process.
  pub fn is_held(&self) -> bool {
    self.held.lock().map(|h| h.is_some()).unwrap_or(false) && self.is_locked()
  }

  /// Age of the lock file at `now`, or `None` when there is no lock.
  pub fn age_at(&self, now: SystemTime) -> Option<Duration> {
    let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
    Some(now.duration_since(modified).unwrap_or(Duration::ZERO))
  }

  pub fn age(&self) -> Option<Duration> {
    self.age_at(SystemTime::now())
  }

  /// Delete the lock regardless of who created it. Returns whether a file was removed.
  pub fn force_release(&self) -> io::Result<bool> {
    self.held.lock().unwrap_or_else(|p| p.into_inner()).take();
    remove_lock_file(&self.path)
  }

  /// Delete the lock only if this process created it.
  pub fn release_if_held(&self) -> io::Result<bool> {
    let holding = self.held.lock().unwrap_or_else(|p| p.into_inner()).take();
    match holding {
      Some(holding) => self.remove_if_unchanged(holding),
      None => Ok(false),
    }
  }

  fn release_generation(&self, generation: u64) -> io::Result<bool> {
    let holding = {
      let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
      match *held {
        Some(h) if h.generation == generation => held.take(),
        // Recovered by the monitor and possibly re-acquired since.
        _ => None,
      }
    };
    match holding {
      Some(holding) => self.remove_if_unchanged(holding),
      None => Ok(false),
    }
  }

  fn remove_if_unchanged(&self, holding: Holding) -> io::Result<bool> {
    let current = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
    if current.is_some() && holding.created.is_some() && current != holding.created {
      warn!(
        path = %self.path.display(),
        "Update lock was replaced by another instance, leaving it in place"
      );
      return Ok(false);
    }
    remove_lock_file(&self.path)
  }
}

fn remove_lock_file(path: &Path) -> io::Result<bool> {
  match fs::remove_file(path) {
    Ok(()) => Ok(true),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
    Err(e) => Err(e),
  }
}

/// Owning guard for an acquired [`UpdateLock`]; releases it on drop.
#[derive(Debug)]
pub struct UpdateLockGuard {
  lock: Arc<UpdateLock>,
  generation: Option<u64>,
}

impl UpdateLockGuard {
  /// Release explicitly, reporting failure instead of only logging it.
  pub fn release(mut self) -> io::Result<bool> {
    match self.generation.take() {
      Some(generation) => self.lock.release_generation(generation),
      None => Ok(false),
    }
  }
}

impl Drop for UpdateLockGuard {
  fn drop(&mut self) {
    let Some(generation) = self.generation.take() else {
      return;
    };
    if let Err(e) = self.lock.release_generation(generation) {
      error!(path = %self.lock.path.display(), error = %e, "Failed to release update lock");
    }
  }
}
