//! Backend contract and the glue that refreshes one cache from it.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::cache::{CacheSink, Cacheable, EntityCache, StreamingPopulation};
use crate::error::{RefreshError, SourceError};
use crate::refresh::{RefreshContext, RefreshTarget};

/// Blocking access to the metadata backend for one entity kind.
///
/// Calls may hang indefinitely, so refreshes always run them through a
/// [`crate::refresh::BoundedCallExecutor`].
pub trait MetadataSource<T: Cacheable>: Send + Sync + 'static {
  fn fetch_all(&self) -> Result<Vec<T>, SourceError>;

  /// Whether [`MetadataSource::fetch_all_streaming`] should be preferred.
  fn supports_streaming(&self) -> bool {
    false
  }

  /// Deliver all entities through `sink`, stopping as soon as it cancels.
  fn fetch_all_streaming(&self, sink: &mut dyn StreamingPopulation<T>) -> Result<(), SourceError> {
    let entities = self.fetch_all()?;
    sink.expected_count(entities.len());
    for (index, entity) in entities.into_iter().enumerate() {
      sink.item(entity, index)?;
    }
    Ok(())
  }
}

/// A cache paired with the source that fills it.
pub struct SourcedCache<T: Cacheable> {
  cache: Arc<EntityCache<T>>,
  source: Arc<dyn MetadataSource<T>>,
}

impl<T: Cacheable> SourcedCache<T> {
  pub fn new(cache: Arc<EntityCache<T>>, source: Arc<dyn MetadataSource<T>>) -> Self {
    Self { cache, source }
  }

  pub fn cache(&self) -> &Arc<EntityCache<T>> {
    &self.cache
  }

  async fn update_bulk(&self, ctx: &RefreshContext) -> Result<usize, RefreshError> {
    let source = Arc::clone(&self.source);
    let entities = {
      let _waiting = ctx.job.waiting();
      tokio::select! {
        _ = ctx.job.token().cancelled() => return Err(RefreshError::Cancelled),
        result = ctx.executor.call(move || source.fetch_all(), ctx.call_timeout) => result??,
      }
    };
    if ctx.job.token().is_cancelled() {
      return Err(RefreshError::Cancelled);
    }
    ctx.job.record_progress();
    Ok(self.cache.store_all(entities)?)
  }

  async fn update_streaming(&self, ctx: &RefreshContext) -> Result<usize, RefreshError> {
    self.cache.begin_streaming()?;

    // Cancelling this token stops a producer whose call we stopped waiting for.
    let token = ctx.job.token().child_token();
    let mut sink = CacheSink::new(Arc::clone(&self.cache), Arc::clone(&ctx.job), token.clone());
    let source = Arc::clone(&self.source);
    let call = ctx.executor.call(
      move || {
        let result = source.fetch_all_streaming(&mut sink);
        (sink, result)
      },
      ctx.streaming_timeout,
    );

    let outcome = {
      let _waiting = ctx.job.waiting();
      tokio::select! {
        _ = ctx.job.token().cancelled() => {
          token.cancel();
          return Err(RefreshError::Cancelled);
        }
        outcome = call => outcome,
      }
    };

    let (mut sink, result) = match outcome {
      Ok(pair) => pair,
      Err(e) => {
        token.cancel();
        return Err(e.into());
      }
    };
    if let Some(failure) = sink.take_failure() {
      return Err(failure.into());
    }
    result?;
    if token.is_cancelled() {
      return Err(RefreshError::Cancelled);
    }

    debug!(cache = self.cache.name(), received = sink.received(), "Streaming population finished");
    Ok(self.cache.promote_work_file()?)
  }
}

impl<T: Cacheable> RefreshTarget for SourcedCache<T> {
  fn name(&self) -> &str {
    self.cache.name()
  }

  fn requires_update(&self) -> bool {
    self.cache.requires_update()
  }

  fn update<'a>(&'a self, ctx: &'a RefreshContext) -> BoxFuture<'a, Result<usize, RefreshError>> {
    async move {
      if self.source.supports_streaming() {
        self.update_streaming(ctx).await
      } else {
        self.update_bulk(ctx).await
      }
    }
    .boxed()
  }
}
