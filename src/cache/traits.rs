//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for entities that can be cached.
///
/// Implementors provide a unique cache key and the name of the cache that
/// holds them. The key becomes the record id on disk, everything else is
/// serialized as the record body.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g., offering identifier, phenomenon)
  fn cache_key(&self) -> String;

  /// Stable cache name, used for the on-disk file names (e.g., "offerings")
  fn entity_type() -> &'static str;
}

/// Result from a cache read, including the data and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Which file the data was read from
  pub source: CacheSource,
  /// When the durable snapshot was last written (if there is one)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a result read from the durable snapshot.
  pub fn from_snapshot(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::Stale
      } else {
        CacheSource::Durable
      },
      cached_at,
    }
  }

  /// Create a result read from the work file of an unfinished refresh.
  pub fn partial(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Partial,
      cached_at: None,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Durable snapshot, still within the freshness threshold
  Durable,
  /// Durable snapshot older than the freshness threshold, served anyway
  Stale,
  /// Best-effort view of a refresh that has not been promoted yet
  Partial,
}
