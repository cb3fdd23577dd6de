//! Caching implementations for metadata types.

use crate::cache::Cacheable;

use super::types::{MetadataKind, Offering, UnitMapping};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for UnitMapping {
  fn cache_key(&self) -> String {
    self.phenomenon.clone()
  }

  fn entity_type() -> &'static str {
    MetadataKind::UnitMappings.cache_name()
  }
}

impl Cacheable for Offering {
  fn cache_key(&self) -> String {
    self.identifier.clone()
  }

  fn entity_type() -> &'static str {
    MetadataKind::Offerings.cache_name()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{decode_records, encode_record};
  use crate::metadata::{Envelope, TimePeriod};
  use chrono::TimeZone;
  use chrono::Utc;
  use std::collections::BTreeMap;
  use std::path::Path;

  fn full_offering() -> Offering {
    let mut observed = BTreeMap::new();
    observed.insert("air_temperature".to_string(), Some("degC".to_string()));
    observed.insert("wind:direction".to_string(), None);
    Offering {
      identifier: "urn:offering:station-1".to_string(),
      name: Some("Station 1, pier\tnorth".to_string()),
      procedures: vec!["urn:procedure:thermo".to_string()],
      observed_properties: observed,
      features_of_interest: vec!["foi-1".to_string(), "foi-2".to_string()],
      phenomenon_time: Some(TimePeriod {
        begin: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap(),
      }),
      envelope: Some(Envelope {
        srid: 4326,
        lower_corner: [52.125, 7.5],
        upper_corner: [52.375, 7.75],
      }),
    }
  }

  #[test]
  fn test_offering_with_all_fields_survives_a_record_line() {
    let offering = full_offering();
    let line = encode_record(&offering).unwrap();
    assert!(!line.contains('\n'));

    let decoded = decode_records::<Offering>(&format!("{line}\n\n"), Path::new("test"));
    assert_eq!(decoded.get(&offering.identifier), Some(&offering));
  }

  #[test]
  fn test_offering_without_optionals_survives_a_record_line() {
    let offering = Offering {
      identifier: "bare".to_string(),
      name: None,
      procedures: vec![],
      observed_properties: BTreeMap::new(),
      features_of_interest: vec![],
      phenomenon_time: None,
      envelope: None,
    };
    let line = encode_record(&offering).unwrap();

    let decoded = decode_records::<Offering>(&line, Path::new("test"));
    assert_eq!(decoded.get("bare"), Some(&offering));
  }

  #[test]
  fn test_keys() {
    let unit = UnitMapping {
      phenomenon: "depth".to_string(),
      unit: "m".to_string(),
    };
    assert_eq!(unit.cache_key(), "depth");
    assert_eq!(full_offering().cache_key(), "urn:offering:station-1");
    assert_eq!(<Offering as Cacheable>::entity_type(), "offerings");
  }
}
