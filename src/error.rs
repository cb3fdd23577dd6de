//! Error types shared by the cache and refresh layers.
//!
//! Readers only ever see [`CacheError`]. Failures of the metadata backend are
//! confined to the refresh cycle ([`RefreshError`]) and are logged there.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`crate::cache::EntityCache`].
#[derive(Debug, Error)]
pub enum CacheError {
  /// Neither the durable snapshot nor the work file holds any data yet.
  #[error("cache '{0}' is not yet available, an update has been requested")]
  NotYetAvailable(String),

  #[error("cache I/O failed for {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to encode record '{id}': {reason}")]
  Codec { id: String, reason: String },

  #[error("cache lock poisoned: {0}")]
  Poisoned(String),
}

impl CacheError {
  pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
    Self::Io {
      path: path.display().to_string(),
      source,
    }
  }
}

/// Errors reported by a [`crate::metadata::MetadataSource`].
#[derive(Debug, Error)]
pub enum SourceError {
  #[error("metadata backend failed: {0}")]
  Backend(String),

  /// The streaming consumer asked the producer to stop.
  #[error("population cancelled")]
  Cancelled,
}

/// Errors from [`crate::refresh::BoundedCallExecutor::call`].
#[derive(Debug, Error)]
pub enum CallError {
  #[error("backend call timed out after {0:?}")]
  TimedOut(Duration),

  #[error("backend call panicked on the worker thread")]
  WorkerPanicked,

  #[error("failed to spawn executor worker: {0}")]
  Spawn(#[source] std::io::Error),
}

/// Why updating one cache during a refresh job failed.
#[derive(Debug, Error)]
pub enum RefreshError {
  /// The metadata source raised, or its call could not complete in time.
  #[error("source failure: {0}")]
  Source(String),

  #[error("refresh cancelled")]
  Cancelled,

  #[error(transparent)]
  Cache(#[from] CacheError),
}

impl From<SourceError> for RefreshError {
  fn from(e: SourceError) -> Self {
    match e {
      SourceError::Cancelled => RefreshError::Cancelled,
      SourceError::Backend(msg) => RefreshError::Source(msg),
    }
  }
}

impl From<CallError> for RefreshError {
  fn from(e: CallError) -> Self {
    RefreshError::Source(e.to_string())
  }
}
