//! One set of metadata caches per backing-store identity.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::info;

use super::source::{MetadataSource, SourcedCache};
use super::types::{MetadataKind, Offering, UnitMapping};
use crate::cache::{CachePolicy, EntityCache, UpdateLock};
use crate::error::CacheError;
use crate::refresh::{RefreshTarget, ScheduleConfig, Scheduler, UpdateTrigger};

/// Freshness summary of one cache, for status reporting.
#[derive(Debug, Clone)]
pub struct CacheStatus {
  pub name: &'static str,
  pub has_content: bool,
  pub requires_update: bool,
  pub last_updated: Option<DateTime<Utc>>,
  pub partial: bool,
}

/// The caches of every metadata kind, sharing one directory, lock and trigger.
///
/// Create once per backing store and pass it around by reference.
pub struct MetadataCaches {
  dir: PathBuf,
  lock: Arc<UpdateLock>,
  trigger: UpdateTrigger,
  unit_mappings: Arc<EntityCache<UnitMapping>>,
  offerings: Arc<EntityCache<Offering>>,
}

impl MetadataCaches {
  /// Open the caches for `identity` below `base_dir`.
  pub fn open(base_dir: &Path, identity: &str, freshness: Duration) -> Result<Self, CacheError> {
    let dir = Self::directory_for(base_dir, identity);
    let trigger = UpdateTrigger::new();

    let unit_mappings = EntityCache::open(
      &dir,
      CachePolicy {
        freshness,
        merge_with_previous: true,
      },
      trigger.clone(),
    )?;
    let offerings = EntityCache::open(
      &dir,
      CachePolicy {
        freshness,
        merge_with_previous: false,
      },
      trigger.clone(),
    )?;
    info!(dir = %dir.display(), identity, "Opened metadata caches");

    Ok(Self {
      lock: Arc::new(UpdateLock::new(&dir)),
      dir,
      trigger,
      unit_mappings: Arc::new(unit_mappings),
      offerings: Arc::new(offerings),
    })
  }

  /// `<base_dir>/<hex sha256 of identity>`, so distinct stores never share files.
  pub fn directory_for(base_dir: &Path, identity: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    base_dir.join(hex::encode(hasher.finalize()))
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn lock(&self) -> &Arc<UpdateLock> {
    &self.lock
  }

  pub fn trigger(&self) -> &UpdateTrigger {
    &self.trigger
  }

  pub fn unit_mappings(&self) -> &Arc<EntityCache<UnitMapping>> {
    &self.unit_mappings
  }

  pub fn offerings(&self) -> &Arc<EntityCache<Offering>> {
    &self.offerings
  }

  /// Refresh targets in dependency order: unit mappings before offerings.
  pub fn targets<S>(&self, source: Arc<S>) -> Vec<Arc<dyn RefreshTarget>>
  where
    S: MetadataSource<UnitMapping> + MetadataSource<Offering>,
  {
    let units: Arc<dyn MetadataSource<UnitMapping>> = source.clone();
    let offerings: Arc<dyn MetadataSource<Offering>> = source;
    vec![
      Arc::new(SourcedCache::new(Arc::clone(&self.unit_mappings), units)),
      Arc::new(SourcedCache::new(Arc::clone(&self.offerings), offerings)),
    ]
  }

  /// Start the refresh scheduler for these caches.
  pub fn start_scheduler<S>(&self, source: Arc<S>, config: ScheduleConfig) -> Scheduler
  where
    S: MetadataSource<UnitMapping> + MetadataSource<Offering>,
  {
    Scheduler::start(
      self.targets(source),
      Arc::clone(&self.lock),
      self.trigger.clone(),
      config,
    )
  }

  pub fn status(&self) -> Vec<CacheStatus> {
    MetadataKind::ALL
      .iter()
      .map(|kind| match kind {
        MetadataKind::UnitMappings => status_of(&self.unit_mappings),
        MetadataKind::Offerings => status_of(&self.offerings),
      })
      .collect()
  }
}

fn status_of<T: crate::cache::Cacheable>(cache: &EntityCache<T>) -> CacheStatus {
  CacheStatus {
    name: cache.name(),
    has_content: cache.has_content(),
    requires_update: cache.requires_update(),
    last_updated: cache.last_updated(),
    partial: !cache.has_content() && cache.files().work_has_content(),
  }
}
