//! Canonical vessel state from incremental sensor deltas.
//!
//! The aggregator accumulates readings in their wire units and converts at
//! emission time. A snapshot is emitted only once position and barometer are
//! both known. Emitted pressure is median-smoothed over the last five raw
//! samples; the raw samples stay in the snapshot ring so the pressure trend
//! is not flattened by the smoothing.

pub mod delta;

use std::collections::VecDeque;
use serde::{Serialize, Deserialize};
use crate::embedding::KNOTS_PER_MS;
use crate::telemetry::delta::{Reading, SensorDelta};

const PRESSURE_MEDIAN_WINDOW: usize = 5;
const MIN_TREND_HOURS: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_deg_true: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sog_kts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub true_wind_speed_kts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub true_wind_angle_deg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparent_wind_speed_kts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparent_wind_angle_deg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barometer_hpa: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_height_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_period_s: Option<f64>,
}

/// Accumulated state in canonical units, before the sufficiency predicate
/// holds. Barometer here is the raw (unsmoothed) reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialSnapshot {
    pub timestamp_ms: Option<i64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub heading_deg_true: Option<f64>,
    pub sog_kts: Option<f64>,
    pub true_wind_speed_kts: Option<f64>,
    pub true_wind_angle_deg: Option<f64>,
    pub apparent_wind_speed_kts: Option<f64>,
    pub apparent_wind_angle_deg: Option<f64>,
    pub barometer_hpa: Option<f64>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub wave_height_m: Option<f64>,
    pub wave_period_s: Option<f64>,
}

#[derive(Debug, Clone, Default)]
struct Accumulated {
    timestamp_ms: Option<i64>,
    lat: Option<f64>,
    lon: Option<f64>,
    heading_rad: Option<f64>,
    sog_ms: Option<f64>,
    wind_speed_true_ms: Option<f64>,
    wind_angle_water_rad: Option<f64>,
    wind_angle_ground_rad: Option<f64>,
    wind_speed_apparent_ms: Option<f64>,
    wind_angle_apparent_rad: Option<f64>,
    wind_u10_ms: Option<f64>,
    wind_v10_ms: Option<f64>,
    pressure_pa: Option<f64>,
    temperature_k: Option<f64>,
    humidity_ratio: Option<f64>,
    wave_height_m: Option<f64>,
    wave_period_s: Option<f64>,
}

pub struct TelemetryAggregator {
    acc: Accumulated,
    /// Raw pressure samples for the median window.
    pressure_window: VecDeque<f64>,
    /// (timestamp_ms, raw barometer hPa) per emitted snapshot.
    ring: VecDeque<(i64, f64)>,
    ring_size: usize,
}

impl TelemetryAggregator {
    pub fn new(ring_size: usize) -> Self {
        Self {
            acc: Accumulated::default(),
            pressure_window: VecDeque::with_capacity(PRESSURE_MEDIAN_WINDOW),
            ring: VecDeque::with_capacity(ring_size),
            ring_size: ring_size.max(2),
        }
    }

    pub fn apply(&mut self, delta: &SensorDelta) {
        for (timestamp, reading) in delta.readings() {
            if let Some(timestamp) = timestamp {
                let millis = timestamp.timestamp_millis();
                // Timestamps never move backwards.
                if self.acc.timestamp_ms.map_or(true, |current| millis >= current) {
                    self.acc.timestamp_ms = Some(millis);
                }
            }

            match reading {
                Reading::Position { latitude, longitude } => {
                    self.acc.lat = Some(latitude);
                    self.acc.lon = Some(longitude);
                }
                Reading::HeadingTrueRad(rad) => self.acc.heading_rad = Some(rad),
                Reading::SpeedOverGroundMs(ms) => self.acc.sog_ms = Some(ms),
                Reading::WindSpeedTrueMs(ms) => self.acc.wind_speed_true_ms = Some(ms),
                Reading::WindAngleTrueWaterRad(rad) => self.acc.wind_angle_water_rad = Some(rad),
                Reading::WindAngleTrueGroundRad(rad) => self.acc.wind_angle_ground_rad = Some(rad),
                Reading::WindSpeedApparentMs(ms) => self.acc.wind_speed_apparent_ms = Some(ms),
                Reading::WindAngleApparentRad(rad) => self.acc.wind_angle_apparent_rad = Some(rad),
                Reading::WindU10Ms(ms) => self.acc.wind_u10_ms = Some(ms),
                Reading::WindV10Ms(ms) => self.acc.wind_v10_ms = Some(ms),
                Reading::PressurePa(pa) => {
                    self.acc.pressure_pa = Some(pa);
                    if self.pressure_window.len() == PRESSURE_MEDIAN_WINDOW {
                        self.pressure_window.pop_front();
                    }
                    self.pressure_window.push_back(pa / 100.0);
                }
                Reading::TemperatureK(k) => self.acc.temperature_k = Some(k),
                Reading::HumidityRatio(ratio) => self.acc.humidity_ratio = Some(ratio),
                Reading::WaveHeightM(m) => self.acc.wave_height_m = Some(m),
                Reading::WavePeriodS(s) => self.acc.wave_period_s = Some(s),
            }
        }
    }

    /// Accumulated state in canonical units, regardless of sufficiency.
    pub fn current(&self) -> PartialSnapshot {
        let (true_wind_speed_kts, true_wind_angle_deg) = self.true_wind();

        PartialSnapshot {
            timestamp_ms: self.acc.timestamp_ms,
            lat: self.acc.lat,
            lon: self.acc.lon,
            heading_deg_true: self.acc.heading_rad.map(to_degrees_0_360),
            sog_kts: self.acc.sog_ms.map(|ms| ms * KNOTS_PER_MS),
            true_wind_speed_kts,
            true_wind_angle_deg,
            apparent_wind_speed_kts: self.acc.wind_speed_apparent_ms.map(|ms| ms * KNOTS_PER_MS),
            apparent_wind_angle_deg: self.acc.wind_angle_apparent_rad.map(to_degrees_0_360),
            barometer_hpa: self.acc.pressure_pa.map(|pa| pa / 100.0),
            temperature_c: self.acc.temperature_k.map(|k| k - 273.15),
            humidity_pct: self.acc.humidity_ratio.map(|ratio| ratio * 100.0),
            wave_height_m: self.acc.wave_height_m,
            wave_period_s: self.acc.wave_period_s,
        }
    }

    /// Emits once `position && barometer` hold. Emission is a pure function
    /// of accumulated state: re-applying the same delta re-emits an
    /// identical snapshot.
    pub fn try_emit(&mut self, now_ms: i64) -> Option<TelemetrySnapshot> {
        let partial = self.current();

        let (lat, lon) = match (partial.lat, partial.lon) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return None,
        };
        let raw_hpa = partial.barometer_hpa?;

        let timestamp_ms = partial.timestamp_ms.unwrap_or(now_ms);
        if self.ring.len() == self.ring_size {
            self.ring.pop_front();
        }
        self.ring.push_back((timestamp_ms, raw_hpa));

        Some(TelemetrySnapshot {
            timestamp_ms,
            lat,
            lon,
            heading_deg_true: partial.heading_deg_true,
            sog_kts: partial.sog_kts,
            true_wind_speed_kts: partial.true_wind_speed_kts,
            true_wind_angle_deg: partial.true_wind_angle_deg,
            apparent_wind_speed_kts: partial.apparent_wind_speed_kts,
            apparent_wind_angle_deg: partial.apparent_wind_angle_deg,
            barometer_hpa: Some(median(&self.pressure_window)),
            temperature_c: partial.temperature_c,
            humidity_pct: partial.humidity_pct,
            wave_height_m: partial.wave_height_m,
            wave_period_s: partial.wave_period_s,
        })
    }

    /// `(p_now − p_oldest) / Δhours` over the raw snapshot ring.
    pub fn pressure_trend_hpa_per_hr(&self) -> Option<f64> {
        let (oldest_ms, oldest_hpa) = self.ring.front()?;
        let (newest_ms, newest_hpa) = self.ring.back()?;

        let delta_hours = (newest_ms - oldest_ms) as f64 / 3_600_000.0;
        if delta_hours <= MIN_TREND_HOURS {
            return None;
        }

        Some((newest_hpa - oldest_hpa) / delta_hours)
    }

    /// True wind from direct readings when available, else derived from the
    /// u10/v10 components. Water-referenced angle wins over ground-referenced.
    fn true_wind(&self) -> (Option<f64>, Option<f64>) {
        let direct_angle = self.acc.wind_angle_water_rad.or(self.acc.wind_angle_ground_rad);
        if let (Some(speed_ms), Some(angle_rad)) = (self.acc.wind_speed_true_ms, direct_angle) {
            return (Some(speed_ms * KNOTS_PER_MS), Some(to_degrees_0_360(angle_rad)));
        }

        if let (Some(u), Some(v)) = (self.acc.wind_u10_ms, self.acc.wind_v10_ms) {
            let speed_ms = (u * u + v * v).sqrt();
            let angle_deg = (u.atan2(v).to_degrees() + 180.0).rem_euclid(360.0);
            return (Some(speed_ms * KNOTS_PER_MS), Some(angle_deg));
        }

        (None, None)
    }
}

fn to_degrees_0_360(rad: f64) -> f64 {
    rad.to_degrees().rem_euclid(360.0)
}

fn median(window: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}
