//! Compares observed conditions against the seed prediction at the vessel's
//! position and time.

use serde::{Serialize, Deserialize};
use crate::embedding::KNOTS_PER_MS;
use crate::seed::{Seed, VAR_PRESSURE, VAR_U10, VAR_V10};
use crate::telemetry::TelemetrySnapshot;

/// Inclusive divergence thresholds.
const WIND_DIVERGENT_KTS: f64 = 8.0;
const PRESSURE_DIVERGENT_HPA: f64 = 4.0;
/// Inclusive hard-disagreement thresholds.
const WIND_DISAGREE_KTS: f64 = 15.0;
const PRESSURE_DISAGREE_HPA: f64 = 8.0;
/// Exclusive soft-agreement thresholds.
const WIND_AGREE_KTS: f64 = 4.0;
const PRESSURE_AGREE_HPA: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Consensus {
    Agree,
    Partial,
    Disagree,
}

impl std::fmt::Display for Consensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consensus::Agree => write!(f, "agree"),
            Consensus::Partial => write!(f, "partial"),
            Consensus::Disagree => write!(f, "disagree"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceReport {
    pub level: Consensus,
    pub wind_delta_kts: f64,
    pub pressure_delta_hpa: f64,
    pub is_divergent: bool,
    pub timestamp_ms: i64,
}

/// What the seed said about this place and time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub model_source: String,
    pub model_run_time_ms: i64,
    pub valid_time_ms: i64,
    pub predicted_wind_kts: f64,
    pub predicted_pressure_hpa: f64,
    pub confidence: f64,
}

pub struct TruthChecker {
    freshness_buckets_h: (i64, i64),
}

impl TruthChecker {
    pub fn new(freshness_buckets_h: (i64, i64)) -> Self {
        Self { freshness_buckets_h }
    }

    /// Nearest-neighbor truth check. `None` when the snapshot or the seed
    /// lacks the wind/pressure pair the comparison needs.
    pub fn check(&self, snapshot: &TelemetrySnapshot, seed: &Seed, time_idx: usize) -> Option<(DivergenceReport, Prediction)> {
        let observed_wind_kts = snapshot.true_wind_speed_kts?;
        let observed_pressure_hpa = snapshot.barometer_hpa?;

        let u10 = seed.sample(VAR_U10, time_idx, snapshot.lat, snapshot.lon).ok()?;
        let v10 = seed.sample(VAR_V10, time_idx, snapshot.lat, snapshot.lon).ok()?;
        let pressure = seed.sample(VAR_PRESSURE, time_idx, snapshot.lat, snapshot.lon).ok()?;

        let predicted_wind_kts = ((u10 as f64).hypot(v10 as f64)) * KNOTS_PER_MS;
        // Seeds may carry surface pressure in Pa or hPa; normalize by magnitude.
        let predicted_pressure_hpa = if pressure > 2_000.0 { pressure as f64 / 100.0 } else { pressure as f64 };

        let wind_delta_kts = (observed_wind_kts - predicted_wind_kts).abs();
        let pressure_delta_hpa = (observed_pressure_hpa - predicted_pressure_hpa).abs();

        let is_divergent = wind_delta_kts >= WIND_DIVERGENT_KTS || pressure_delta_hpa >= PRESSURE_DIVERGENT_HPA;
        let level = if wind_delta_kts >= WIND_DISAGREE_KTS || pressure_delta_hpa >= PRESSURE_DISAGREE_HPA {
            Consensus::Disagree
        } else if wind_delta_kts < WIND_AGREE_KTS && pressure_delta_hpa < PRESSURE_AGREE_HPA {
            Consensus::Agree
        } else {
            Consensus::Partial
        };

        let report = DivergenceReport {
            level,
            wind_delta_kts,
            pressure_delta_hpa,
            is_divergent,
            timestamp_ms: snapshot.timestamp_ms,
        };
        let prediction = Prediction {
            model_source: seed.model_source.clone(),
            model_run_time_ms: seed.forecast_start_time_ms,
            valid_time_ms: seed.time_steps_ms.get(time_idx).copied().unwrap_or(seed.forecast_start_time_ms),
            predicted_wind_kts,
            predicted_pressure_hpa,
            confidence: self.confidence(seed, snapshot.timestamp_ms),
        };

        Some((report, prediction))
    }

    fn confidence(&self, seed: &Seed, now_ms: i64) -> f64 {
        match seed.freshness(now_ms, self.freshness_buckets_h) {
            crate::seed::Freshness::Fresh => 0.9,
            crate::seed::Freshness::Stale => 0.6,
            crate::seed::Freshness::Expired => 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::seed::Values;

    /// Single-cell seed predicting the given wind (from the north) and pressure.
    fn seed_predicting(wind_kts: f64, pressure_hpa: f64) -> Seed {
        let wind_ms = wind_kts / KNOTS_PER_MS;
        let mut variables = BTreeMap::new();
        variables.insert(VAR_U10.to_string(), Values::Raw(vec![0.0]));
        variables.insert(VAR_V10.to_string(), Values::Raw(vec![-(wind_ms as f32)]));
        variables.insert(VAR_PRESSURE.to_string(), Values::Raw(vec![(pressure_hpa * 100.0) as f32]));

        Seed {
            seed_id: "seed-test".to_string(),
            model_source: "ECMWF-AIFS-28km".to_string(),
            forecast_start_time_ms: 0,
            time_steps_ms: vec![0],
            latitudes: vec![10.0],
            longitudes: vec![-60.0],
            variables,
        }
    }

    fn observed(wind_kts: f64, pressure_hpa: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp_ms: 1_000,
            lat: 10.0,
            lon: -60.0,
            heading_deg_true: None,
            sog_kts: None,
            true_wind_speed_kts: Some(wind_kts),
            true_wind_angle_deg: Some(0.0),
            apparent_wind_speed_kts: None,
            apparent_wind_angle_deg: None,
            barometer_hpa: Some(pressure_hpa),
            temperature_c: None,
            humidity_pct: None,
            wave_height_m: None,
            wave_period_s: None,
        }
    }

    #[test]
    fn agreement_when_both_deltas_are_small() {
        let checker = TruthChecker::new((6, 12));
        let (report, prediction) = checker
            .check(&observed(10.0, 1013.0), &seed_predicting(9.0, 1013.5), 0)
            .unwrap();

        assert_eq!(report.level, Consensus::Agree);
        assert!(!report.is_divergent);
        assert!((prediction.predicted_wind_kts - 9.0).abs() < 0.01);
        assert!((prediction.predicted_pressure_hpa - 1013.5).abs() < 0.01);
        assert_eq!(prediction.confidence, 0.9);
    }

    #[test]
    fn divergence_thresholds_are_inclusive() {
        let checker = TruthChecker::new((6, 12));

        let (report, _) = checker.check(&observed(18.0, 1013.0), &seed_predicting(10.0, 1013.0), 0).unwrap();
        assert!((report.wind_delta_kts - 8.0).abs() < 0.01);
        assert!(report.is_divergent);
        assert_eq!(report.level, Consensus::Partial);

        let (report, _) = checker.check(&observed(10.0, 1009.0), &seed_predicting(10.0, 1013.0), 0).unwrap();
        assert!((report.pressure_delta_hpa - 4.0).abs() < 0.01);
        assert!(report.is_divergent);
    }

    #[test]
    fn large_wind_error_disagrees() {
        // Predicted 10 kt, observed 25 kt.
        let checker = TruthChecker::new((6, 12));
        let (report, _) = checker.check(&observed(25.0, 1013.0), &seed_predicting(10.0, 1013.0), 0).unwrap();

        assert_eq!(report.level, Consensus::Disagree);
        assert!(report.is_divergent);
    }

    #[test]
    fn large_pressure_error_disagrees() {
        let checker = TruthChecker::new((6, 12));
        let (report, _) = checker.check(&observed(10.0, 1004.0), &seed_predicting(10.0, 1013.0), 0).unwrap();

        assert_eq!(report.level, Consensus::Disagree);
    }

    #[test]
    fn middling_deltas_are_partial() {
        let checker = TruthChecker::new((6, 12));
        let (report, _) = checker.check(&observed(15.0, 1013.0), &seed_predicting(10.0, 1013.0), 0).unwrap();

        assert_eq!(report.level, Consensus::Partial);
        assert!(!report.is_divergent);
    }

    #[test]
    fn hpa_seeds_are_not_rescaled() {
        let mut seed = seed_predicting(10.0, 1013.0);
        seed.variables.insert(VAR_PRESSURE.to_string(), Values::Raw(vec![1008.0]));

        let checker = TruthChecker::new((6, 12));
        let (_, prediction) = checker.check(&observed(10.0, 1013.0), &seed, 0).unwrap();

        assert!((prediction.predicted_pressure_hpa - 1008.0).abs() < 1e-6);
    }

    #[test]
    fn missing_observed_wind_skips_the_check() {
        let checker = TruthChecker::new((6, 12));
        let mut snapshot = observed(10.0, 1013.0);
        snapshot.true_wind_speed_kts = None;

        assert!(checker.check(&snapshot, &seed_predicting(10.0, 1013.0), 0).is_none());
    }

    #[test]
    fn stale_seed_lowers_confidence() {
        let checker = TruthChecker::new((6, 12));
        let mut snapshot = observed(10.0, 1013.0);
        snapshot.timestamp_ms = 7 * 3_600_000;

        let (_, prediction) = checker.check(&snapshot, &seed_predicting(10.0, 1013.0), 0).unwrap();
        assert_eq!(prediction.confidence, 0.6);
    }
}
