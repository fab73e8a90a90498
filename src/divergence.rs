//! Packages a confirmed divergence into an anonymized snapshot, writes it to
//! the local snapshot directory, and queues it for upload.
//!
//! Nothing in a snapshot may identify the vessel: the id is a salted hash of
//! a coarse space-time bucket, the location is rounded to 0.1°, and the
//! region tag comes from a fixed decision tree.

use std::path::PathBuf;
use std::sync::Arc;
use chrono::{SecondsFormat, TimeZone, Utc};
use rand::RngCore;
use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};
use crate::embedding::AtmosphericVector;
use crate::outbox::Outbox;
use crate::pattern::MatchedPattern;
use crate::telemetry::TelemetrySnapshot;
use crate::truth::{DivergenceReport, Prediction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DivergenceSeverity {
    Minor,
    Moderate,
    Severe,
    Critical,
}

impl std::fmt::Display for DivergenceSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DivergenceSeverity::Minor => write!(f, "minor"),
            DivergenceSeverity::Moderate => write!(f, "moderate"),
            DivergenceSeverity::Severe => write!(f, "severe"),
            DivergenceSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Severity bands, inclusive at the lower edge.
pub fn severity_for(wind_error_kts: f64, pressure_error_hpa: f64) -> DivergenceSeverity {
    if wind_error_kts >= 25.0 || pressure_error_hpa >= 15.0 {
        DivergenceSeverity::Critical
    } else if wind_error_kts >= 15.0 || pressure_error_hpa >= 10.0 {
        DivergenceSeverity::Severe
    } else if wind_error_kts >= 8.0 || pressure_error_hpa >= 5.0 {
        DivergenceSeverity::Moderate
    } else {
        DivergenceSeverity::Minor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataQuality {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundedLocation {
    /// Multiple of 0.1°.
    pub lat: f64,
    /// Multiple of 0.1°.
    pub lon: f64,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedConditions {
    pub pressure_hpa: f64,
    pub wind_speed_kts: f64,
    pub wind_dir_deg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_height_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_period_s: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceMetrics {
    pub wind_error_kts: f64,
    pub pressure_error_hpa: f64,
    pub severity: DivergenceSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPatternRef {
    pub pattern_id: String,
    pub label: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub consensus_level: String,
    pub data_quality: DataQuality,
    pub sensor_sources: Vec<String>,
    pub app_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceSnapshot {
    pub snapshot_id: String,
    pub captured_at_iso: String,
    pub location: RoundedLocation,
    pub observed: ObservedConditions,
    pub predicted: Prediction,
    pub divergence_metrics: DivergenceMetrics,
    pub embedding: AtmosphericVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<MatchedPatternRef>,
    pub metadata: SnapshotMetadata,
}

pub struct DivergenceCapturer {
    snapshots_dir: PathBuf,
    outbox: Arc<Outbox>,
}

impl DivergenceCapturer {
    pub fn new(snapshots_dir: &str, outbox: Arc<Outbox>) -> Self {
        Self { snapshots_dir: PathBuf::from(snapshots_dir), outbox }
    }

    /// Builds, persists, and enqueues the anonymized snapshot.
    pub fn capture(
        &self,
        snapshot: &TelemetrySnapshot,
        embedding: AtmosphericVector,
        report: &DivergenceReport,
        prediction: &Prediction,
        matched: Option<&MatchedPattern>,
    ) -> crate::error::Result<DivergenceSnapshot> {
        let lat = round_tenth(snapshot.lat);
        let lon = round_tenth(snapshot.lon);

        let divergence = DivergenceSnapshot {
            snapshot_id: snapshot_id(snapshot.timestamp_ms, snapshot.lat, snapshot.lon),
            captured_at_iso: Utc
                .timestamp_millis(snapshot.timestamp_ms)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            location: RoundedLocation { lat, lon, region: region_for(lat, lon).to_string() },
            observed: ObservedConditions {
                pressure_hpa: snapshot.barometer_hpa.unwrap_or_default(),
                wind_speed_kts: snapshot.true_wind_speed_kts.unwrap_or_default(),
                wind_dir_deg: snapshot.true_wind_angle_deg.unwrap_or_default(),
                temperature_c: snapshot.temperature_c,
                humidity_pct: snapshot.humidity_pct,
                wave_height_m: snapshot.wave_height_m,
                wave_period_s: snapshot.wave_period_s,
            },
            predicted: prediction.clone(),
            divergence_metrics: DivergenceMetrics {
                wind_error_kts: report.wind_delta_kts,
                pressure_error_hpa: report.pressure_delta_hpa,
                severity: severity_for(report.wind_delta_kts, report.pressure_delta_hpa),
            },
            embedding,
            matched_pattern: matched.map(|matched| MatchedPatternRef {
                pattern_id: matched.pattern_id.clone(),
                label: matched.label.clone(),
                similarity: matched.similarity,
            }),
            metadata: SnapshotMetadata {
                consensus_level: "divergent".to_string(),
                data_quality: data_quality(snapshot),
                sensor_sources: sensor_sources(snapshot),
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        self.persist(&divergence)?;
        self.outbox.enqueue(
            &divergence.snapshot_id,
            serde_json::to_value(&divergence)?,
            snapshot.timestamp_ms,
        )?;

        log::info!(
            "divergence - Captured `{}` ({}, {})",
            divergence.snapshot_id,
            divergence.divergence_metrics.severity,
            divergence.location.region
        );

        Ok(divergence)
    }

    fn persist(&self, divergence: &DivergenceSnapshot) -> crate::error::Result<()> {
        std::fs::create_dir_all(&self.snapshots_dir)?;

        let file = tempfile::NamedTempFile::new_in(&self.snapshots_dir)?;
        {
            let mut writer = std::io::BufWriter::new(file.as_file());
            serde_json::to_writer_pretty(&mut writer, divergence)?;
            std::io::Write::flush(&mut writer)?;
        }
        let target = self.snapshots_dir.join(format!("{}.json", divergence.snapshot_id));
        file.persist(&target).map_err(|e| e.error)?;

        Ok(())
    }
}

/// `"snap_" + first-16-hex(SHA-256(minute_bucket ‖ round(lat·10) ‖
/// round(lon·10) ‖ 16 random bytes))`. The salt makes the id
/// non-correlatable; the bucket keys server-side idempotence.
fn snapshot_id(timestamp_ms: i64, lat: f64, lon: f64) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut hasher = Sha256::new();
    hasher.update((timestamp_ms / 60_000).to_be_bytes());
    hasher.update(((lat * 10.0).round() as i32).to_be_bytes());
    hasher.update(((lon * 10.0).round() as i32).to_be_bytes());
    hasher.update(salt);

    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|byte| format!("{:02x}", byte)).collect();

    format!("snap_{}", hex)
}

fn round_tenth(degrees: f64) -> f64 {
    (degrees * 10.0).round() / 10.0
}

/// Fixed region decision tree over the rounded position.
pub fn region_for(lat: f64, lon: f64) -> &'static str {
    if lat < -40.0 {
        "Southern Ocean"
    } else if (8.0..=28.0).contains(&lat) && (-90.0..=-58.0).contains(&lon) {
        "Caribbean"
    } else if (25.0..=45.0).contains(&lat) && (-82.0..=-40.0).contains(&lon) {
        "Gulf Stream"
    } else if lat.abs() <= 10.0 && (lon >= 120.0 || lon <= -80.0) {
        "Tropical Pacific"
    } else if lat > 10.0 && (lon <= -100.0 || lon >= 120.0) {
        "North Pacific"
    } else if lat > 10.0 && (-100.0..=20.0).contains(&lon) {
        "North Atlantic"
    } else {
        "Open Ocean"
    }
}

fn data_quality(snapshot: &TelemetrySnapshot) -> DataQuality {
    let optional_feeds = [
        snapshot.true_wind_speed_kts.is_some(),
        snapshot.temperature_c.is_some(),
        snapshot.humidity_pct.is_some(),
        snapshot.wave_height_m.is_some(),
    ]
    .into_iter()
    .filter(|present| *present)
    .count();

    if optional_feeds >= 3 {
        DataQuality::High
    } else if optional_feeds >= 1 {
        DataQuality::Medium
    } else {
        DataQuality::Low
    }
}

fn sensor_sources(snapshot: &TelemetrySnapshot) -> Vec<String> {
    let mut sources = vec!["gps".to_string(), "barometer".to_string()];

    if snapshot.true_wind_speed_kts.is_some() || snapshot.apparent_wind_speed_kts.is_some() {
        sources.push("anemometer".to_string());
    }
    if snapshot.temperature_c.is_some() || snapshot.humidity_pct.is_some() {
        sources.push("thermo_hygro".to_string());
    }
    if snapshot.wave_height_m.is_some() {
        sources.push("wave_sensor".to_string());
    }

    sources
}
