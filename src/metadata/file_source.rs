//! Metadata source backed by exported files in a directory.
//!
//! Layout:
//! - `unit_mappings.json`: JSON array of unit mappings
//! - `offerings.jsonl`: one JSON offering per line, streamed

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::source::MetadataSource;
use super::types::{Offering, UnitMapping};
use crate::cache::StreamingPopulation;
use crate::error::SourceError;

pub const UNIT_MAPPINGS_FILE: &str = "unit_mappings.json";
pub const OFFERINGS_FILE: &str = "offerings.jsonl";

/// Reads metadata exports from `dir`.
#[derive(Debug, Clone)]
pub struct SnapshotSource {
  dir: PathBuf,
}

impl SnapshotSource {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn open(&self, name: &str) -> Result<(PathBuf, File), SourceError> {
    let path = self.dir.join(name);
    let file = File::open(&path)
      .map_err(|e| SourceError::Backend(format!("failed to open {}: {}", path.display(), e)))?;
    Ok((path, file))
  }

  /// Visit every non-blank offering line, stopping at the first error.
  fn each_offering<F>(&self, mut visit: F) -> Result<(), SourceError>
  where
    F: FnMut(Offering) -> Result<(), SourceError>,
  {
    let (path, file) = self.open(OFFERINGS_FILE)?;
    for (number, line) in BufReader::new(file).lines().enumerate() {
      let line = line
        .map_err(|e| SourceError::Backend(format!("failed to read {}: {}", path.display(), e)))?;
      if line.trim().is_empty() {
        continue;
      }
      let offering: Offering = serde_json::from_str(&line).map_err(|e| {
        SourceError::Backend(format!("{}:{}: invalid offering: {}", path.display(), number + 1, e))
      })?;
      visit(offering)?;
    }
    Ok(())
  }

  fn count_offerings(&self) -> Result<usize, SourceError> {
    let (path, file) = self.open(OFFERINGS_FILE)?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
      let line = line
        .map_err(|e| SourceError::Backend(format!("failed to read {}: {}", path.display(), e)))?;
      if !line.trim().is_empty() {
        count += 1;
      }
    }
    Ok(count)
  }
}

impl MetadataSource<UnitMapping> for SnapshotSource {
  fn fetch_all(&self) -> Result<Vec<UnitMapping>, SourceError> {
    let path = self.dir.join(UNIT_MAPPINGS_FILE);
    let contents = fs::read_to_string(&path)
      .map_err(|e| SourceError::Backend(format!("failed to read {}: {}", path.display(), e)))?;
    let units: Vec<UnitMapping> = serde_json::from_str(&contents)
      .map_err(|e| SourceError::Backend(format!("failed to parse {}: {}", path.display(), e)))?;
    debug!(path = %path.display(), entries = units.len(), "Read unit mappings");
    Ok(units)
  }
}

impl MetadataSource<Offering> for SnapshotSource {
  fn fetch_all(&self) -> Result<Vec<Offering>, SourceError> {
    let mut offerings = Vec::new();
    self.each_offering(|offering| {
      offerings.push(offering);
      Ok(())
    })?;
    Ok(offerings)
  }

  fn supports_streaming(&self) -> bool {
    true
  }

  fn fetch_all_streaming(&self, sink: &mut dyn StreamingPopulation<Offering>) -> Result<(), SourceError> {
    sink.expected_count(self.count_offerings()?);
    let mut index = 0;
    self.each_offering(|offering| {
      sink.item(offering, index)?;
      index += 1;
      Ok(())
    })
  }
}
