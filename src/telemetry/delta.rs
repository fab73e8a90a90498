//! Signal K compatible sensor delta envelope:
//! `{ updates: [ { source?, timestamp, values: [ {path, value} ] } ] }`.
//! Unknown paths are ignored silently.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

pub const PATH_POSITION: &str = "navigation.position";
pub const PATH_HEADING_TRUE: &str = "navigation.headingTrue";
pub const PATH_SOG: &str = "navigation.speedOverGround";
pub const PATH_WIND_SPEED_TRUE: &str = "environment.wind.speedTrue";
pub const PATH_WIND_ANGLE_TRUE_WATER: &str = "environment.wind.angleTrueWater";
pub const PATH_WIND_ANGLE_TRUE_GROUND: &str = "environment.wind.angleTrueGround";
pub const PATH_WIND_SPEED_APPARENT: &str = "environment.wind.speedApparent";
pub const PATH_WIND_ANGLE_APPARENT: &str = "environment.wind.angleApparent";
pub const PATH_WIND_U10: &str = "environment.wind.u10";
pub const PATH_WIND_V10: &str = "environment.wind.v10";
pub const PATH_PRESSURE: &str = "environment.outside.pressure";
pub const PATH_TEMPERATURE: &str = "environment.outside.temperature";
pub const PATH_HUMIDITY: &str = "environment.outside.humidity";
pub const PATH_WAVE_HEIGHT: &str = "environment.water.waves.significantHeight";
pub const PATH_WAVE_PERIOD: &str = "environment.water.waves.period";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDelta {
    #[serde(default)]
    pub updates: Vec<Update>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub values: Vec<PathValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathValue {
    pub path: String,
    pub value: serde_json::Value,
}

/// A recognized sensor reading in its wire units (SI: radians, m/s, Pa,
/// Kelvin, humidity ratio).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Position { latitude: f64, longitude: f64 },
    HeadingTrueRad(f64),
    SpeedOverGroundMs(f64),
    WindSpeedTrueMs(f64),
    WindAngleTrueWaterRad(f64),
    WindAngleTrueGroundRad(f64),
    WindSpeedApparentMs(f64),
    WindAngleApparentRad(f64),
    WindU10Ms(f64),
    WindV10Ms(f64),
    PressurePa(f64),
    TemperatureK(f64),
    HumidityRatio(f64),
    WaveHeightM(f64),
    WavePeriodS(f64),
}

impl SensorDelta {
    pub fn parse(json: &str) -> Result<SensorDelta, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Recognized readings in envelope order, each with its update timestamp.
    pub fn readings(&self) -> Vec<(Option<DateTime<Utc>>, Reading)> {
        let mut readings = Vec::new();

        for update in &self.updates {
            for path_value in &update.values {
                if let Some(reading) = parse_reading(&path_value.path, &path_value.value) {
                    readings.push((update.timestamp, reading));
                }
            }
        }

        readings
    }
}

fn parse_reading(path: &str, value: &serde_json::Value) -> Option<Reading> {
    match path {
        PATH_POSITION => {
            let latitude = value.get("latitude")?.as_f64()?;
            let longitude = value.get("longitude")?.as_f64()?;
            Some(Reading::Position { latitude, longitude })
        }
        PATH_HEADING_TRUE => value.as_f64().map(Reading::HeadingTrueRad),
        PATH_SOG => value.as_f64().map(Reading::SpeedOverGroundMs),
        PATH_WIND_SPEED_TRUE => value.as_f64().map(Reading::WindSpeedTrueMs),
        PATH_WIND_ANGLE_TRUE_WATER => value.as_f64().map(Reading::WindAngleTrueWaterRad),
        PATH_WIND_ANGLE_TRUE_GROUND => value.as_f64().map(Reading::WindAngleTrueGroundRad),
        PATH_WIND_SPEED_APPARENT => value.as_f64().map(Reading::WindSpeedApparentMs),
        PATH_WIND_ANGLE_APPARENT => value.as_f64().map(Reading::WindAngleApparentRad),
        PATH_WIND_U10 => value.as_f64().map(Reading::WindU10Ms),
        PATH_WIND_V10 => value.as_f64().map(Reading::WindV10Ms),
        PATH_PRESSURE => value.as_f64().map(Reading::PressurePa),
        PATH_TEMPERATURE => value.as_f64().map(Reading::TemperatureK),
        PATH_HUMIDITY => value.as_f64().map(Reading::HumidityRatio),
        PATH_WAVE_HEIGHT => value.as_f64().map(Reading::WaveHeightM),
        PATH_WAVE_PERIOD => value.as_f64().map(Reading::WavePeriodS),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_signalk_envelope() {
        let json = r#"{
            "updates": [{
                "source": {"label": "nmea"},
                "timestamp": "2026-07-30T12:00:00Z",
                "values": [
                    {"path": "navigation.position", "value": {"latitude": 12.1, "longitude": -61.7}},
                    {"path": "environment.outside.pressure", "value": 101250.0},
                    {"path": "navigation.headingTrue", "value": 1.5707963}
                ]
            }]
        }"#;

        let delta = SensorDelta::parse(json).unwrap();
        let readings = delta.readings();

        assert_eq!(readings.len(), 3);
        assert!(readings[0].0.is_some());
        assert_eq!(readings[0].1, Reading::Position { latitude: 12.1, longitude: -61.7 });
        assert_eq!(readings[1].1, Reading::PressurePa(101250.0));
    }

    #[test]
    fn unknown_paths_are_ignored_silently() {
        let json = r#"{
            "updates": [{
                "values": [
                    {"path": "electrical.batteries.0.voltage", "value": 12.8},
                    {"path": "environment.outside.temperature", "value": 300.15}
                ]
            }]
        }"#;

        let readings = SensorDelta::parse(json).unwrap().readings();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].1, Reading::TemperatureK(300.15));
    }

    #[test]
    fn malformed_position_payload_is_dropped() {
        let json = r#"{"updates": [{"values": [{"path": "navigation.position", "value": 3.5}]}]}"#;

        assert!(SensorDelta::parse(json).unwrap().readings().is_empty());
    }
}
