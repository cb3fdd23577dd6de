use chrono::NaiveTime;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::refresh::{MonitorConfig, ScheduleConfig};

pub const ENV_UPDATE_ON_STARTUP: &str = "SOSMETA_UPDATE_CACHE_ON_STARTUP";
pub const ENV_UPDATE_TIME: &str = "SOSMETA_CACHE_UPDATE_TIME";
pub const ENV_CACHE_DIR: &str = "SOSMETA_CACHE_DIR";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub source: SourceConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
  /// Identity of the backing store (e.g. its connection URL); selects the cache directory
  pub identity: String,
  /// Directory holding `unit_mappings.json` and `offerings.jsonl`
  pub snapshot_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Base cache directory (defaults to the platform cache dir)
  pub directory: Option<PathBuf>,
  pub update_on_startup: bool,
  /// Daily refresh time, "HH:MM" local time
  pub update_time: String,
  pub freshness_secs: u64,
  pub call_timeout_secs: u64,
  pub streaming_timeout_secs: u64,
  pub max_lock_age_secs: u64,
  pub stall_threshold_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      directory: None,
      update_on_startup: true,
      update_time: "03:00".to_string(),
      freshness_secs: 15 * 60,
      call_timeout_secs: 5 * 60,
      streaming_timeout_secs: 60 * 60,
      max_lock_age_secs: 12 * 60 * 60,
      stall_threshold_secs: 10 * 60,
    }
  }
}

impl Config {
  /// Load configuration from file, then apply environment overrides.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sosmeta.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sosmeta/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/sosmeta/config.yaml\n\
           See sosmeta.example.yaml for the format."
        ))
      }
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("sosmeta.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sosmeta").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.update_time()?;
    Ok(config)
  }

  /// Override file settings from the environment, read through `lookup`.
  pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(value) = lookup(ENV_UPDATE_ON_STARTUP) {
      self.cache.update_on_startup = parse_bool(&value)
        .ok_or_else(|| eyre!("{} must be true or false, got '{}'", ENV_UPDATE_ON_STARTUP, value))?;
    }
    if let Some(value) = lookup(ENV_UPDATE_TIME) {
      parse_time(&value).map_err(|e| eyre!("{}: {}", ENV_UPDATE_TIME, e))?;
      self.cache.update_time = value;
    }
    if let Some(value) = lookup(ENV_CACHE_DIR) {
      self.cache.directory = Some(PathBuf::from(value));
    }
    Ok(())
  }

  /// Base directory of all cache directories.
  pub fn cache_dir(&self) -> Result<PathBuf> {
    match &self.cache.directory {
      Some(dir) => Ok(dir.clone()),
      None => dirs::cache_dir()
        .map(|dir| dir.join("sosmeta"))
        .ok_or_else(|| eyre!("No cache directory configured and no platform cache dir available")),
    }
  }

  pub fn update_time(&self) -> Result<NaiveTime> {
    parse_time(&self.cache.update_time)
  }

  pub fn freshness(&self) -> Duration {
    Duration::from_secs(self.cache.freshness_secs)
  }

  pub fn schedule_config(&self) -> Result<ScheduleConfig> {
    let defaults = ScheduleConfig::default();
    let max_lock_age = Duration::from_secs(self.cache.max_lock_age_secs);
    Ok(ScheduleConfig {
      update_on_startup: self.cache.update_on_startup,
      update_time: self.update_time()?,
      call_timeout: Duration::from_secs(self.cache.call_timeout_secs),
      streaming_timeout: Duration::from_secs(self.cache.streaming_timeout_secs),
      monitor: MonitorConfig {
        delay: defaults.period / 2,
        max_lock_age,
        stall_threshold: Duration::from_secs(self.cache.stall_threshold_secs),
      },
      ..defaults
    })
  }
}

fn parse_time(value: &str) -> Result<NaiveTime> {
  NaiveTime::parse_from_str(value.trim(), "%H:%M")
    .or_else(|_| NaiveTime::parse_from_str(value.trim(), "%H:%M:%S"))
    .map_err(|_| eyre!("Invalid update time '{}', expected HH:MM", value))
}

fn parse_bool(value: &str) -> Option<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "true" | "1" | "yes" | "on" => Some(true),
    "false" | "0" | "no" | "off" => Some(false),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  const MINIMAL: &str = "
source:
  identity: postgres://db/sos
  snapshot_dir: /srv/export
";

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    assert_eq!(config.source.identity, "postgres://db/sos");
    assert!(config.cache.update_on_startup);
    assert_eq!(config.freshness(), Duration::from_secs(900));
    assert_eq!(config.update_time().unwrap(), NaiveTime::from_hms_opt(3, 0, 0).unwrap());

    let schedule = config.schedule_config().unwrap();
    assert_eq!(schedule.monitor.max_lock_age, Duration::from_secs(12 * 60 * 60));
    assert_eq!(schedule.period, Duration::from_secs(24 * 60 * 60));
    assert_eq!(schedule.monitor.delay, schedule.period / 2);
  }

  #[test]
  fn test_cache_section() {
    let yaml = format!(
      "{MINIMAL}
cache:
  directory: /tmp/sosmeta
  update_on_startup: false
  update_time: \"22:15\"
  max_lock_age_secs: 1800
"
    );
    let config = Config::from_yaml(&yaml).unwrap();
    assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/sosmeta"));
    assert!(!config.cache.update_on_startup);
    assert_eq!(config.update_time().unwrap(), NaiveTime::from_hms_opt(22, 15, 0).unwrap());
    assert_eq!(
      config.schedule_config().unwrap().monitor.max_lock_age,
      Duration::from_secs(1800)
    );
    assert_eq!(config.cache.call_timeout_secs, 300);
  }

  #[test]
  fn test_invalid_update_time_is_rejected() {
    let yaml = format!("{MINIMAL}\ncache:\n  update_time: \"25:99\"\n");
    assert!(Config::from_yaml(&yaml).is_err());
  }

  #[test]
  fn test_env_overrides() {
    let mut config = Config::from_yaml(MINIMAL).unwrap();
    let env: HashMap<&str, &str> = [
      (ENV_UPDATE_ON_STARTUP, "false"),
      (ENV_UPDATE_TIME, "04:30"),
      (ENV_CACHE_DIR, "/var/cache/other"),
    ]
    .into_iter()
    .collect();

    config
      .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
      .unwrap();
    assert!(!config.cache.update_on_startup);
    assert_eq!(config.update_time().unwrap(), NaiveTime::from_hms_opt(4, 30, 0).unwrap());
    assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/var/cache/other"));
  }

  #[test]
  fn test_bad_env_values_are_errors() {
    let mut config = Config::from_yaml(MINIMAL).unwrap();
    assert!(config
      .apply_env_overrides(|key| (key == ENV_UPDATE_ON_STARTUP).then(|| "maybe".to_string()))
      .is_err());
    assert!(config
      .apply_env_overrides(|key| (key == ENV_UPDATE_TIME).then(|| "noon".to_string()))
      .is_err());
  }
}
