//! File-persisted, keyed snapshot of one metadata kind.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::storage::CacheFiles;
use super::traits::{CacheResult, Cacheable};
use crate::error::CacheError;
use crate::refresh::UpdateTrigger;

/// Snapshots older than this are served but reported as stale.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(15 * 60);

/// Per-kind behaviour of an [`EntityCache`].
#[derive(Debug, Clone)]
pub struct CachePolicy {
  /// Age after which the durable snapshot requires an update
  pub freshness: Duration,
  /// Keep entries absent from a new batch instead of dropping them
  pub merge_with_previous: bool,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self {
      freshness: DEFAULT_FRESHNESS,
      merge_with_previous: false,
    }
  }
}

/// Keyed snapshot of entities of type `T`, persisted as `<name>.cache`.
///
/// Readers never see a half-written snapshot: bulk stores go through the work
/// file and are promoted with a rename. While a streamed refresh is filling the
/// work file, readers of an empty cache get that partial view instead of an
/// error.
#[derive(Debug)]
pub struct EntityCache<T: Cacheable> {
  files: CacheFiles,
  guard: RwLock<()>,
  policy: CachePolicy,
  trigger: UpdateTrigger,
  _entity: PhantomData<fn() -> T>,
}

impl<T: Cacheable> EntityCache<T> {
  /// Open (and create if missing) the cache files for `T` inside `dir`.
  pub fn open(dir: &Path, policy: CachePolicy, trigger: UpdateTrigger) -> Result<Self, CacheError> {
    let files = CacheFiles::new(dir, T::entity_type());
    files.ensure_exists()?;
    Ok(Self {
      files,
      guard: RwLock::new(()),
      policy,
      trigger,
      _entity: PhantomData,
    })
  }

  pub fn name(&self) -> &'static str {
    T::entity_type()
  }

  pub fn files(&self) -> &CacheFiles {
    &self.files
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  /// All cached entities keyed by id.
  ///
  /// Fails with [`CacheError::NotYetAvailable`] (after requesting an update)
  /// only when neither the snapshot nor the work file holds any data.
  pub fn get(&self) -> Result<HashMap<String, T>, CacheError> {
    self.snapshot().map(|result| result.data)
  }

  /// Like [`get`](Self::get), but also reports which file answered.
  pub fn snapshot(&self) -> Result<CacheResult<HashMap<String, T>>, CacheError> {
    {
      let _read = self.read()?;

      if self.files.snapshot_has_content() {
        let data = self.files.read_snapshot()?;
        let is_stale = self.is_stale_at(SystemTime::now());
        if is_stale {
          debug!(cache = self.name(), "Serving stale snapshot");
        }
        return Ok(CacheResult::from_snapshot(data, self.last_updated(), is_stale));
      }

      if self.files.work_has_content() {
        let data = self.files.read_work()?;
        debug!(cache = self.name(), entries = data.len(), "Serving partial snapshot");
        return Ok(CacheResult::partial(data));
      }
    }

    info!(cache = self.name(), "No cached data yet, requesting update");
    self.trigger.request();
    Err(CacheError::NotYetAvailable(self.name().to_string()))
  }

  /// Replace the durable snapshot with `entities`. Returns the number of records stored.
  pub fn store_all<I>(&self, entities: I) -> Result<usize, CacheError>
  where
    I: IntoIterator<Item = T>,
  {
    let mut batch: HashMap<String, T> = entities
      .into_iter()
      .map(|entity| (entity.cache_key(), entity))
      .collect();

    let _write = self.write()?;
    if self.policy.merge_with_previous {
      batch = self.merged_with_snapshot(batch)?;
    }
    let stored = self.files.write_work(batch.values())?;
    self.files.promote_work()?;

    info!(cache = self.name(), entries = stored, "Stored cache snapshot");
    Ok(stored)
  }

  /// Append one entity to the work file. Does not touch the durable snapshot.
  pub fn store_one(&self, entity: &T) -> Result<(), CacheError> {
    let _write = self.write()?;
    self.files.append_work(entity)
  }

  /// Start a streamed population with an empty work file.
  pub fn begin_streaming(&self) -> Result<(), CacheError> {
    let _write = self.write()?;
    self.files.clear_work()
  }

  /// Promote everything streamed into the work file to the durable snapshot.
  pub fn promote_work_file(&self) -> Result<usize, CacheError> {
    let _write = self.write()?;
    let streamed = self.files.read_work::<T>()?;
    let stored = if self.policy.merge_with_previous {
      let merged = self.merged_with_snapshot(streamed)?;
      let stored = self.files.write_work(merged.values())?;
      self.files.promote_work()?;
      stored
    } else {
      self.files.promote_work()?;
      streamed.len()
    };

    info!(cache = self.name(), entries = stored, "Promoted streamed snapshot");
    Ok(stored)
  }

  /// Whether the snapshot is missing, empty, or older than the freshness threshold.
  pub fn requires_update(&self) -> bool {
    self.requires_update_at(SystemTime::now())
  }

  pub fn requires_update_at(&self, now: SystemTime) -> bool {
    !self.files.snapshot_has_content() || self.is_stale_at(now)
  }

  /// Whether the snapshot file exists.
  pub fn is_available(&self) -> bool {
    self.files.snapshot_exists()
  }

  /// Whether the snapshot file holds any data.
  pub fn has_content(&self) -> bool {
    self.files.snapshot_has_content()
  }

  /// When the durable snapshot was last written.
  pub fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.files.snapshot_modified().map(DateTime::<Utc>::from)
  }

  fn is_stale_at(&self, now: SystemTime) -> bool {
    match self.files.snapshot_modified() {
      Some(modified) => now
        .duration_since(modified)
        .map(|age| age > self.policy.freshness)
        .unwrap_or(false),
      None => true,
    }
  }

  fn merged_with_snapshot(
    &self,
    batch: HashMap<String, T>,
  ) -> Result<HashMap<String, T>, CacheError> {
    let mut merged = self.files.read_snapshot::<T>()?;
    let retained = merged.len();
    merged.extend(batch);
    debug!(cache = self.name(), retained, total = merged.len(), "Merged with previous entries");
    Ok(merged)
  }

  fn read(&self) -> Result<RwLockReadGuard<'_, ()>, CacheError> {
    self
      .guard
      .read()
      .map_err(|e| CacheError::Poisoned(e.to_string()))
  }

  fn write(&self) -> Result<RwLockWriteGuard<'_, ()>, CacheError> {
    self
      .guard
      .write()
      .map_err(|e| CacheError::Poisoned(e.to_string()))
  }
}
