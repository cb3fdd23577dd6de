//! File storage for one cache kind: the durable snapshot and its work file.
//!
//! Both files hold one record per line: the record id, a TAB, and the entity
//! serialized as a single compact JSON object. Nested key/value pairs inside an
//! entity become nested JSON objects, so the body never contains a raw newline.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use super::traits::Cacheable;
use crate::error::CacheError;

/// Separator between the record id and the serialized body.
pub const RECORD_SEPARATOR: char = '\t';

/// The durable snapshot and work file of one cache kind.
#[derive(Debug, Clone)]
pub struct CacheFiles {
  cache_path: PathBuf,
  work_path: PathBuf,
}

impl CacheFiles {
  /// Files for the cache `name` inside `dir` (`<name>.cache`, `<name>.cache.tmp`).
  pub fn new(dir: &Path, name: &str) -> Self {
    Self {
      cache_path: dir.join(format!("{name}.cache")),
      work_path: dir.join(format!("{name}.cache.tmp")),
    }
  }

  pub fn cache_path(&self) -> &Path {
    &self.cache_path
  }

  pub fn work_path(&self) -> &Path {
    &self.work_path
  }

  /// Create the directory and both files if they are missing. Existing content is kept.
  pub fn ensure_exists(&self) -> Result<(), CacheError> {
    if let Some(parent) = self.cache_path.parent() {
      fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    for path in [&self.cache_path, &self.work_path] {
      OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CacheError::io(path, e))?;
    }
    Ok(())
  }

  /// Replace the work file content with `entities`. Returns the number written.
  pub fn write_work<'a, T, I>(&self, entities: I) -> Result<usize, CacheError>
  where
    T: Cacheable,
    I: IntoIterator<Item = &'a T>,
  {
    let file = File::create(&self.work_path).map_err(|e| CacheError::io(&self.work_path, e))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for entity in entities {
      let line = encode_record(entity)?;
      writeln!(writer, "{line}").map_err(|e| CacheError::io(&self.work_path, e))?;
      written += 1;
    }
    let file = writer
      .into_inner()
      .map_err(|e| CacheError::io(&self.work_path, e.into_error()))?;
    file
      .sync_all()
      .map_err(|e| CacheError::io(&self.work_path, e))?;
    Ok(written)
  }

  /// Append one record to the work file.
  pub fn append_work<T: Cacheable>(&self, entity: &T) -> Result<(), CacheError> {
    let line = encode_record(entity)?;
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.work_path)
      .map_err(|e| CacheError::io(&self.work_path, e))?;
    writeln!(file, "{line}").map_err(|e| CacheError::io(&self.work_path, e))
  }

  /// Truncate the work file to zero length.
  pub fn clear_work(&self) -> Result<(), CacheError> {
    File::create(&self.work_path)
      .map(|_| ())
      .map_err(|e| CacheError::io(&self.work_path, e))
  }

  /// Atomically replace the durable snapshot with the work file, then leave an
  /// empty work file behind.
  ///
  /// The rename is what keeps readers from ever observing a half-written
  /// snapshot.
  pub fn promote_work(&self) -> Result<(), CacheError> {
    fs::rename(&self.work_path, &self.cache_path)
      .map_err(|e| CacheError::io(&self.cache_path, e))?;
    self.clear_work()?;
    debug!(path = %self.cache_path.display(), "Promoted work file");
    Ok(())
  }

  /// Read every well-formed record of the durable snapshot.
  pub fn read_snapshot<T: Cacheable>(&self) -> Result<HashMap<String, T>, CacheError> {
    read_records(&self.cache_path)
  }

  /// Read every well-formed record of the work file.
  pub fn read_work<T: Cacheable>(&self) -> Result<HashMap<String, T>, CacheError> {
    read_records(&self.work_path)
  }

  pub fn snapshot_exists(&self) -> bool {
    self.cache_path.exists()
  }

  pub fn snapshot_has_content(&self) -> bool {
    has_content(&self.cache_path)
  }

  pub fn work_has_content(&self) -> bool {
    has_content(&self.work_path)
  }

  /// Modification time of the durable snapshot.
  pub fn snapshot_modified(&self) -> Option<SystemTime> {
    fs::metadata(&self.cache_path)
      .and_then(|m| m.modified())
      .ok()
  }
}

fn has_content(path: &Path) -> bool {
  fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn read_records<T: Cacheable>(path: &Path) -> Result<HashMap<String, T>, CacheError> {
  match fs::read_to_string(path) {
    Ok(content) => Ok(decode_records(&content, path)),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
    Err(e) => Err(CacheError::io(path, e)),
  }
}

/// Serialize one entity into a record line (without the trailing newline).
pub fn encode_record<T: Cacheable>(entity: &T) -> Result<String, CacheError> {
  let id = entity.cache_key();
  if id.is_empty() || id.contains(RECORD_SEPARATOR) || id.contains(|c| c == '\n' || c == '\r') {
    return Err(CacheError::Codec {
      id,
      reason: "record id must be non-empty and free of tabs and newlines".to_string(),
    });
  }
  let body = serde_json::to_string(entity).map_err(|e| CacheError::Codec {
    id: id.clone(),
    reason: e.to_string(),
  })?;
  Ok(format!("{id}{RECORD_SEPARATOR}{body}"))
}

/// Parse record lines, skipping blank and malformed lines.
///
/// A later line with the same id replaces an earlier one, so an appended work
/// file behaves like an upsert log.
pub fn decode_records<T: Cacheable>(content: &str, origin: &Path) -> HashMap<String, T> {
  let mut records = HashMap::new();
  for (number, line) in content.lines().enumerate() {
    if line.trim().is_empty() {
      continue;
    }
    let Some((id, body)) = line.split_once(RECORD_SEPARATOR) else {
      warn!(file = %origin.display(), line = number + 1, "Skipping cache line without separator");
      continue;
    };
    match serde_json::from_str::<T>(body) {
      Ok(entity) => {
        records.insert(id.to_string(), entity);
      }
      Err(e) => {
        warn!(
          file = %origin.display(),
          line = number + 1,
          error = %e,
          "Skipping malformed cache record"
        );
      }
    }
  }
  records
}
