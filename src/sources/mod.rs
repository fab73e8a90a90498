//! Telemetry sources. Exactly one source is active at a time; the service
//! owns the selection, switches only at delta boundaries, and falls back to
//! the device bridge when the active source fails.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use crate::config::{SourceKind, TelemetryConfig};
use crate::emergency::SharedEmergency;
use crate::engine::{CoreEvent, EngineEvent};
use crate::telemetry::delta::{PathValue, SensorDelta, Update};

const RECONNECT_DELAY_SECS: u64 = 5;

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("PermissionDenied({0})")]
    PermissionDenied(String),

    #[error("Disconnected({0})")]
    Disconnected(String),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
}

pub struct TelemetryService {
    config: TelemetryConfig,
    engine_tx: mpsc::Sender<EngineEvent>,
    events: broadcast::Sender<CoreEvent>,
    emergency: SharedEmergency,
}

impl TelemetryService {
    pub fn new(
        config: TelemetryConfig,
        engine_tx: mpsc::Sender<EngineEvent>,
        events: broadcast::Sender<CoreEvent>,
        emergency: SharedEmergency,
    ) -> Self {
        Self { config, engine_tx, events, emergency }
    }

    pub async fn run(self) {
        let mut active = self.config.source;
        log::info!("telemetry - Start service with source `{}`", active);

        loop {
            let result = match active {
                SourceKind::Mock => run_mock(&self.engine_tx, &self.emergency).await,
                SourceKind::Signalk => run_signalk(&self.config.signalk_addr, &self.engine_tx).await,
                SourceKind::Device => run_device(&self.config.device_addr, &self.engine_tx).await,
            };

            match result {
                Ok(()) => {
                    log::info!("telemetry - Engine gone, stopping source `{}`", active);
                    return;
                }
                Err(e) => {
                    log::error!("telemetry - Source `{}` failed : {:?}", active, e);
                    if self.config.auto_fallback && active != SourceKind::Device {
                        let from = active;
                        active = SourceKind::Device;
                        log::warn!("telemetry - Falling back to `{}`", active);
                        let _ = self.events.send(CoreEvent::SourceChanged { from, to: active });
                    } else {
                        tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                    }
                }
            }
        }
    }
}

/// Reads newline-delimited Signal K delta JSON from the bridge socket.
/// `Ok(())` means the engine side hung up; errors mean the source died.
pub(crate) async fn run_signalk(addr: &str, engine_tx: &mpsc::Sender<EngineEvent>) -> Result<(), SourceError> {
    let stream = TcpStream::connect(addr).await.map_err(classify_connect)?;
    log::info!("telemetry - Connected to signalk bridge at {}", addr);

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match SensorDelta::parse(&line) {
            Ok(delta) => {
                if engine_tx.send(EngineEvent::SensorDelta(delta)).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => log::debug!("telemetry - Skipping malformed delta : {}", e),
        }
    }

    Err(SourceError::Disconnected(addr.to_string()))
}

/// GPS-only bridge: same wire format as signalk but anything outside
/// `navigation.*` is stripped before the engine sees it.
pub(crate) async fn run_device(addr: &str, engine_tx: &mpsc::Sender<EngineEvent>) -> Result<(), SourceError> {
    let stream = TcpStream::connect(addr).await.map_err(classify_connect)?;
    log::info!("telemetry - Connected to device bridge at {}", addr);

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match SensorDelta::parse(&line) {
            Ok(mut delta) => {
                for update in &mut delta.updates {
                    update.values.retain(|value| value.path.starts_with("navigation."));
                }
                if engine_tx.send(EngineEvent::SensorDelta(delta)).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => log::debug!("telemetry - Skipping malformed delta : {}", e),
        }
    }

    Err(SourceError::Disconnected(addr.to_string()))
}

/// Synthetic conditions for dock testing: a slow pressure swing, veering
/// wind, and a drifting position, paced by the machine's polling rate.
pub(crate) async fn run_mock(engine_tx: &mpsc::Sender<EngineEvent>, emergency: &SharedEmergency) -> Result<(), SourceError> {
    use rand::Rng;

    let mut step = 0u64;
    loop {
        let polling_hz = {
            emergency.read().expect("emergency state lock").polling_rate_hz.max(1)
        };
        tokio::time::sleep(std::time::Duration::from_millis(1_000 / polling_hz as u64)).await;

        let t = step as f64;
        let (pressure_pa, wind_ms) = {
            let mut rng = rand::thread_rng();
            let pressure_pa = 101_300.0 + (t / 900.0).sin() * 600.0 + rng.gen_range(-20.0..20.0);
            let wind_ms = 7.0 + (t / 600.0).sin() * 4.0 + rng.gen_range(-0.5..0.5);
            (pressure_pa, wind_ms)
        };
        let wind_rad = (t / 1_800.0) % (2.0 * std::f64::consts::PI);

        let delta = SensorDelta {
            updates: vec![Update {
                source: None,
                timestamp: Some(chrono::Utc::now()),
                values: vec![
                    PathValue {
                        path: crate::telemetry::delta::PATH_POSITION.to_string(),
                        value: serde_json::json!({
                            "latitude": 12.0 + t * 1e-5,
                            "longitude": -61.0 + t * 1e-5,
                        }),
                    },
                    PathValue {
                        path: crate::telemetry::delta::PATH_PRESSURE.to_string(),
                        value: serde_json::json!(pressure_pa),
                    },
                    PathValue {
                        path: crate::telemetry::delta::PATH_WIND_SPEED_TRUE.to_string(),
                        value: serde_json::json!(wind_ms),
                    },
                    PathValue {
                        path: crate::telemetry::delta::PATH_WIND_ANGLE_TRUE_WATER.to_string(),
                        value: serde_json::json!(wind_rad),
                    },
                ],
            }],
        };

        if engine_tx.send(EngineEvent::SensorDelta(delta)).await.is_err() {
            return Ok(());
        }
        step += 1;
    }
}

fn classify_connect(e: std::io::Error) -> SourceError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        SourceError::PermissionDenied(e.to_string())
    } else {
        SourceError::IoError(e)
    }
}
