//! Incremental population of a cache, one entity at a time.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::entity::EntityCache;
use super::traits::Cacheable;
use crate::error::{CacheError, SourceError};
use crate::refresh::JobHandle;

/// Returned by [`StreamingPopulation::item`] to ask the producer to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("population cancelled")]
pub struct Cancelled;

impl From<Cancelled> for SourceError {
  fn from(_: Cancelled) -> Self {
    SourceError::Cancelled
  }
}

/// Callback contract between a producer of entities and their consumer.
///
/// There is no completion callback: the producer returning is the end of the
/// stream. Producers must check the result of every `item` call and stop as
/// soon as it is `Err(Cancelled)`.
pub trait StreamingPopulation<T> {
  /// Informational total, called at most once and before the first item.
  fn expected_count(&mut self, _count: usize) {}

  /// Deliver the entity at position `index` of the stream.
  fn item(&mut self, value: T, index: usize) -> Result<(), Cancelled>;
}

/// Items between progress log lines when the total is unknown.
const UNKNOWN_TOTAL_LOG_EVERY: usize = 1000;

/// Streams entities straight into the work file of an [`EntityCache`].
///
/// Storage failures stop the producer (reported to it as `Cancelled`) and are
/// kept for the refresh to report via [`CacheSink::take_failure`].
pub struct CacheSink<T: Cacheable> {
  cache: Arc<EntityCache<T>>,
  job: Arc<JobHandle>,
  token: CancellationToken,
  expected: Option<usize>,
  received: usize,
  failure: Option<CacheError>,
}

impl<T: Cacheable> CacheSink<T> {
  /// Sink for `cache` that stops once `token` is cancelled.
  pub fn new(cache: Arc<EntityCache<T>>, job: Arc<JobHandle>, token: CancellationToken) -> Self {
    Self {
      cache,
      job,
      token,
      expected: None,
      received: 0,
      failure: None,
    }
  }

  pub fn received(&self) -> usize {
    self.received
  }

  pub fn expected(&self) -> Option<usize> {
    self.expected
  }

  pub fn take_failure(&mut self) -> Option<CacheError> {
    self.failure.take()
  }

  fn log_progress(&self) {
    match self.expected {
      Some(total) if total > 0 => {
        let step = (total / 10).max(1);
        if self.received % step == 0 || self.received == total {
          info!(
            cache = self.cache.name(),
            received = self.received,
            expected = total,
            percent = self.received * 100 / total,
            "Streaming cache population"
          );
        }
      }
      _ => {
        if self.received % UNKNOWN_TOTAL_LOG_EVERY == 0 {
          debug!(cache = self.cache.name(), received = self.received, "Streaming cache population");
        }
      }
    }
  }
}

impl<T: Cacheable> StreamingPopulation<T> for CacheSink<T> {
  fn expected_count(&mut self, count: usize) {
    debug!(cache = self.cache.name(), expected = count, "Streaming population started");
    self.expected = Some(count);
  }

  fn item(&mut self, value: T, _index: usize) -> Result<(), Cancelled> {
    if self.token.is_cancelled() {
      return Err(Cancelled);
    }
    if let Err(e) = self.cache.store_one(&value) {
      self.failure = Some(e);
      return Err(Cancelled);
    }
    self.received += 1;
    self.job.record_progress();
    self.log_progress();

    if self.token.is_cancelled() {
      Err(Cancelled)
    } else {
      Ok(())
    }
  }
}
