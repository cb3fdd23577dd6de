//! Durable, file-backed caches of metadata entities.
//!
//! Each entity kind lives in its own directory entry:
//! - `<name>.cache`: the last complete snapshot, one `id<TAB>json` record per line
//! - `<name>.cache.tmp`: a population in progress, readable as a partial view
//!
//! A finished population replaces the snapshot with a single rename, so readers
//! never see a half-written snapshot.

mod entity;
mod lock;
mod storage;
mod streaming;
mod traits;

pub use entity::{CachePolicy, EntityCache, DEFAULT_FRESHNESS};
pub use lock::{UpdateLock, UpdateLockGuard, LOCK_FILE_NAME};
pub use storage::{decode_records, encode_record, CacheFiles, RECORD_SEPARATOR};
pub use streaming::{CacheSink, Cancelled, StreamingPopulation};
pub use traits::{CacheResult, CacheSource, Cacheable};
