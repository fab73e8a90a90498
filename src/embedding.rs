//! 16-wide normalized description of instantaneous atmospheric state.
//!
//! Indices 0–8 are meaningful, 9–15 are reserved and stay zero. The
//! normalization constants are a contract shared with the shore-side
//! services; changing one invalidates every stored pattern:
//!
//! | idx | field          | normalization                  | range   |
//! |-----|----------------|--------------------------------|---------|
//! | 0   | temperature    | (°C − 15) / 25                 | [−1, 1] |
//! | 1   | pressure       | (hPa − 1013) / 30              | [−1, 1] |
//! | 2   | humidity       | pct / 100                      | [0, 1]  |
//! | 3   | wind u         | m·s⁻¹ / 40                     | [−1, 1] |
//! | 4   | wind v         | m·s⁻¹ / 40                     | [−1, 1] |
//! | 5   | pressure trend | hPa·hr⁻¹ / 10                  | [−1, 1] |
//! | 6   | cloud cover    | fraction                       | [0, 1]  |
//! | 7   | wave height    | m / 15                         | [0, 1]  |
//! | 8   | wave period    | s / 25                         | [0, 1]  |

use serde::{Serialize, Deserialize};
use crate::telemetry::TelemetrySnapshot;

pub const WIDTH: usize = 16;

pub const IDX_TEMPERATURE: usize = 0;
pub const IDX_PRESSURE: usize = 1;
pub const IDX_HUMIDITY: usize = 2;
pub const IDX_WIND_U: usize = 3;
pub const IDX_WIND_V: usize = 4;
pub const IDX_PRESSURE_TREND: usize = 5;
pub const IDX_CLOUD_COVER: usize = 6;
pub const IDX_WAVE_HEIGHT: usize = 7;
pub const IDX_WAVE_PERIOD: usize = 8;

pub const KNOTS_PER_MS: f64 = 1.943844;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AtmosphericVector(pub [f32; WIDTH]);

impl Default for AtmosphericVector {
    fn default() -> Self {
        Self([0.0; WIDTH])
    }
}

impl AtmosphericVector {
    /// Builds the observation embedding. Missing optionals contribute zero
    /// rather than an invented reading.
    pub fn from_snapshot(snapshot: &TelemetrySnapshot, pressure_trend_hpa_per_hr: Option<f64>) -> Self {
        let mut components = [0.0f32; WIDTH];

        if let Some(c) = snapshot.temperature_c {
            components[IDX_TEMPERATURE] = norm_temperature(c);
        }
        if let Some(hpa) = snapshot.barometer_hpa {
            components[IDX_PRESSURE] = norm_pressure(hpa);
        }
        if let Some(pct) = snapshot.humidity_pct {
            components[IDX_HUMIDITY] = norm_humidity(pct);
        }
        if let (Some(speed_kts), Some(angle_deg)) = (snapshot.true_wind_speed_kts, snapshot.true_wind_angle_deg) {
            let (u, v) = wind_components_ms(speed_kts, angle_deg);
            components[IDX_WIND_U] = norm_wind(u);
            components[IDX_WIND_V] = norm_wind(v);
        }
        if let Some(trend) = pressure_trend_hpa_per_hr {
            components[IDX_PRESSURE_TREND] = norm_pressure_trend(trend);
        }
        if let Some(m) = snapshot.wave_height_m {
            components[IDX_WAVE_HEIGHT] = norm_wave_height(m);
        }
        if let Some(s) = snapshot.wave_period_s {
            components[IDX_WAVE_PERIOD] = norm_wave_period(s);
        }

        Self(components)
    }

    pub fn components(&self) -> &[f32; WIDTH] {
        &self.0
    }
}

/// Wind vector in m·s⁻¹ from speed and the meteorological "from" direction.
pub fn wind_components_ms(speed_kts: f64, angle_deg: f64) -> (f64, f64) {
    let speed_ms = speed_kts / KNOTS_PER_MS;
    let rad = angle_deg.to_radians();

    (-speed_ms * rad.sin(), -speed_ms * rad.cos())
}

pub fn norm_temperature(celsius: f64) -> f32 {
    (((celsius - 15.0) / 25.0) as f32).clamp(-1.0, 1.0)
}

pub fn norm_pressure(hpa: f64) -> f32 {
    (((hpa - 1013.0) / 30.0) as f32).clamp(-1.0, 1.0)
}

pub fn norm_humidity(pct: f64) -> f32 {
    ((pct / 100.0) as f32).clamp(0.0, 1.0)
}

pub fn norm_wind(ms: f64) -> f32 {
    ((ms / 40.0) as f32).clamp(-1.0, 1.0)
}

pub fn norm_pressure_trend(hpa_per_hr: f64) -> f32 {
    ((hpa_per_hr / 10.0) as f32).clamp(-1.0, 1.0)
}

pub fn norm_cloud_cover(fraction: f64) -> f32 {
    (fraction as f32).clamp(0.0, 1.0)
}

pub fn norm_wave_height(meters: f64) -> f32 {
    ((meters / 15.0) as f32).clamp(0.0, 1.0)
}

pub fn norm_wave_period(seconds: f64) -> f32 {
    ((seconds / 25.0) as f32).clamp(0.0, 1.0)
}

/// Cosine similarity between two embeddings, accumulated in f64.
pub fn cosine_similarity(a: &[f32; WIDTH], b: &[f32; WIDTH]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom) as f32
    }
}
