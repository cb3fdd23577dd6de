//! Metadata entity kinds, their backend contract and the cache registry.

mod cache;
mod file_source;
mod registry;
mod source;
mod types;

pub use file_source::{SnapshotSource, OFFERINGS_FILE, UNIT_MAPPINGS_FILE};
pub use registry::{CacheStatus, MetadataCaches};
pub use source::{MetadataSource, SourcedCache};
pub use types::{Envelope, MetadataKind, Offering, TimePeriod, UnitMapping};
