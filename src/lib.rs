//! Scheduled, file-backed metadata caches for a slow sensor observation backend.
//!
//! Readers call [`cache::EntityCache::get`] at any time. A [`refresh::Scheduler`]
//! keeps the caches up to date in the background, one refresh at a time across
//! processes, and recovers from refreshes that hang or die.

pub mod cache;
pub mod config;
pub mod error;
pub mod metadata;
pub mod refresh;

pub use cache::{CacheResult, CacheSource, Cacheable, EntityCache};
pub use error::{CacheError, RefreshError, SourceError};
pub use metadata::{MetadataCaches, MetadataSource, Offering, UnitMapping};
pub use refresh::{RefreshOutcome, Scheduler};
