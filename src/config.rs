use std::collections::BTreeSet;
use std::path::Path;
use serde::{Serialize, Deserialize};

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
  pub engine: EngineConfig,
  pub seed: SeedConfig,
  pub vector: VectorConfig,
  pub telemetry: TelemetryConfig,
  pub pattern: PatternConfig,
  pub emergency: EmergencyConfig,
  pub snapshots: SnapshotsConfig,
  pub outbox: OutboxConfig,
}

impl Config {
  pub fn load(path: &Path) -> crate::error::Result<Config> {
    let file = std::fs::File::open(path)?;
    Ok(serde_yaml::from_reader(file)?)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
  /// Minimum spacing of pattern checks in milliseconds.
  pub check_interval_ms: i64,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self { check_interval_ms: 30_000 }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedConfig {
  /// Directory watched for `*.seed.zst` artifacts.
  pub dir: String,
  /// (fresh, stale) age thresholds in hours. Must be monotonic.
  pub freshness_buckets_h: (i64, i64),
  /// Seconds between directory scans.
  pub scan_interval_secs: u64,
  pub fetch: SeedFetchConfig,
}

impl Default for SeedConfig {
  fn default() -> Self {
    Self {
      dir: "data/seeds".to_string(),
      freshness_buckets_h: (6, 12),
      scan_interval_secs: 60,
      fetch: SeedFetchConfig::default(),
    }
  }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedFetchConfig {
  pub enabled: bool,
  /// Endpoint serving the latest regional seed artifact.
  pub url: Option<String>,
  pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VectorConfig {
  /// Persistent index file. Unreadable/unwritable path puts the store in degraded mode.
  pub index_file: String,
  /// Soft deadline for similarity scans, in milliseconds.
  pub query_deadline_ms: u64,
  /// Seconds between dirty-index flushes.
  pub flush_interval_secs: u64,
}

impl Default for VectorConfig {
  fn default() -> Self {
    Self {
      index_file: "data/patterns.json".to_string(),
      query_deadline_ms: 200,
      flush_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryConfig {
  pub source: SourceKind,
  /// `host:port` of the Signal K delta stream.
  pub signalk_addr: String,
  /// `host:port` of the position-only device bridge.
  pub device_addr: String,
  /// Switch to the device source when the active source fails.
  pub auto_fallback: bool,
  /// Snapshots kept for pressure-trend derivation.
  pub ring_size: usize,
}

impl Default for TelemetryConfig {
  fn default() -> Self {
    Self {
      source: SourceKind::Signalk,
      signalk_addr: "127.0.0.1:8375".to_string(),
      device_addr: "127.0.0.1:8376".to_string(),
      auto_fallback: true,
      ring_size: 60,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
  Signalk,
  Device,
  Mock,
}

impl std::fmt::Display for SourceKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SourceKind::Signalk => write!(f, "signalk"),
      SourceKind::Device => write!(f, "device"),
      SourceKind::Mock => write!(f, "mock"),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatternConfig {
  /// Minimum similarity for a hit to be considered dangerous.
  pub alert_threshold: f32,
  /// Per-pattern suppression window in milliseconds.
  pub alert_cooldown_ms: i64,
  pub enabled_categories: BTreeSet<Category>,
}

impl Default for PatternConfig {
  fn default() -> Self {
    Self {
      alert_threshold: 0.75,
      alert_cooldown_ms: 900_000,
      enabled_categories: Category::all(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
  Squall,
  Gale,
  RogueWave,
  RapidPressureDrop,
  ConvergenceZone,
}

impl Category {
  pub fn all() -> BTreeSet<Category> {
    [
      Category::Squall,
      Category::Gale,
      Category::RogueWave,
      Category::RapidPressureDrop,
      Category::ConvergenceZone,
    ]
    .into_iter()
    .collect()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmergencyConfig {
  /// (elevated, high, critical) TSS bands. Must be monotonic in [0, 100].
  pub tss_thresholds: TssThresholds,
  pub auto_recovery: bool,
}

impl Default for EmergencyConfig {
  fn default() -> Self {
    Self {
      tss_thresholds: TssThresholds::default(),
      auto_recovery: true,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TssThresholds {
  pub elevated: u8,
  pub high: u8,
  pub critical: u8,
}

impl Default for TssThresholds {
  fn default() -> Self {
    Self { elevated: 40, high: 60, critical: 80 }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotsConfig {
  /// Directory receiving anonymized divergence snapshots.
  pub dir: String,
}

impl Default for SnapshotsConfig {
  fn default() -> Self {
    Self { dir: "data/snapshots".to_string() }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxConfig {
  pub dir: String,
  /// Upload endpoint for divergence snapshots.
  pub endpoint: Option<String>,
  /// Battery floor in [0, 1] below which uploads are skipped.
  pub min_battery: f64,
  pub max_attempts: u8,
  /// Background scheduler floor in seconds.
  pub sync_interval_secs: u64,
  /// Uploaded entries older than this are swept.
  pub retention_days: i64,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    Self {
      dir: "data/outbox".to_string(),
      endpoint: None,
      min_battery: 0.2,
      max_attempts: 5,
      sync_interval_secs: 900,
      retention_days: 30,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_documented_values() {
    let config = Config::default();

    assert_eq!(config.engine.check_interval_ms, 30_000);
    assert_eq!(config.pattern.alert_threshold, 0.75);
    assert_eq!(config.pattern.alert_cooldown_ms, 900_000);
    assert_eq!(config.pattern.enabled_categories.len(), 5);
    assert_eq!(config.emergency.tss_thresholds.elevated, 40);
    assert_eq!(config.emergency.tss_thresholds.high, 60);
    assert_eq!(config.emergency.tss_thresholds.critical, 80);
    assert!(config.emergency.auto_recovery);
    assert_eq!(config.outbox.min_battery, 0.2);
    assert_eq!(config.outbox.max_attempts, 5);
    assert_eq!(config.seed.freshness_buckets_h, (6, 12));
  }

  #[test]
  fn partial_yaml_fills_defaults() {
    let yaml = r#"
pattern:
  alertThreshold: 0.7
  enabledCategories: [squall, gale]
outbox:
  minBattery: 0.5
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.pattern.alert_threshold, 0.7);
    assert_eq!(config.pattern.enabled_categories.len(), 2);
    assert!(config.pattern.enabled_categories.contains(&Category::Gale));
    assert_eq!(config.outbox.min_battery, 0.5);
    assert_eq!(config.engine.check_interval_ms, 30_000);
  }
}
