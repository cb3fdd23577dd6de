use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unit of measurement used for one observed phenomenon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMapping {
  pub phenomenon: String,
  pub unit: String,
}

/// Time span covered by the observations of an offering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePeriod {
  pub begin: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

/// Spatial bounding box of an offering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub srid: u32,
  pub lower_corner: [f64; 2],
  pub upper_corner: [f64; 2],
}

/// Sensor offering summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
  pub identifier: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub procedures: Vec<String>,
  /// Observed property -> unit, when the unit is known
  #[serde(default)]
  pub observed_properties: BTreeMap<String, Option<String>>,
  #[serde(default)]
  pub features_of_interest: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phenomenon_time: Option<TimePeriod>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub envelope: Option<Envelope>,
}

/// The metadata kinds held in caches, in refresh order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MetadataKind {
  UnitMappings,
  Offerings,
}

impl MetadataKind {
  pub const ALL: [MetadataKind; 2] = [MetadataKind::UnitMappings, MetadataKind::Offerings];

  pub fn cache_name(self) -> &'static str {
    match self {
      MetadataKind::UnitMappings => "unit_mappings",
      MetadataKind::Offerings => "offerings",
    }
  }
}
