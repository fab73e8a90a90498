//! Single-consumer engine loop. Every sensor delta flows through
//! aggregation, pattern matching, truth checking, and the emergency machine
//! in that order, so alert ordering is deterministic per snapshot. Slow work
//! (snapshot persistence, uploads, seed decode) stays off this loop; the
//! truth check reads whatever seed handle is installed right now and skips
//! when a rotation is in flight.

use std::sync::Arc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use crate::config::{Config, SourceKind};
use crate::divergence::{DivergenceCapturer, DivergenceSeverity};
use crate::emergency::{
    EmergencyReason, EmergencyStateMachine, MachineInput, Phase, SharedEmergency, TrendDirection,
    EMERGENCY_POLLING_HZ,
};
use crate::outbox::Outbox;
use crate::pattern::{PatternAlert, PatternMatcher};
use crate::seed::{Freshness, Seed, SeedStore};
use crate::telemetry::delta::SensorDelta;
use crate::telemetry::TelemetryAggregator;
use crate::truth::TruthChecker;
use crate::vector::VectorStore;

#[derive(Debug)]
pub enum EngineEvent {
    SensorDelta(SensorDelta),
    SeedRotated(Arc<Seed>),
    Tick(i64),
    Acknowledge(String),
    TriggerEmergency(EmergencyReason),
    ExitEmergency,
}

/// Typed events for external collaborators (UI bridge, notifier, logs).
#[derive(Debug, Clone)]
pub enum CoreEvent {
    SeedStateChanged { freshness: Freshness },
    AlertRaised { alert: PatternAlert },
    PhaseChanged { from: Phase, to: Phase, reason: Option<EmergencyReason> },
    DivergenceCaptured { snapshot_id: String, severity: DivergenceSeverity },
    OutboxProgress { uploaded: usize, pending: usize, failed: usize },
    SourceChanged { from: SourceKind, to: SourceKind },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedStatus {
    pub seed_id: String,
    pub model_source: String,
    pub forecast_start_time_ms: i64,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridStatus {
    pub phase: Phase,
    pub severity_score: u8,
    pub trend_direction: TrendDirection,
    pub polling_rate_hz: u32,
    pub seed: Option<SeedStatus>,
    pub active_alerts: usize,
    pub outbox_uploaded: usize,
    pub outbox_pending: usize,
    pub outbox_failed: usize,
    pub last_snapshot_ms: Option<i64>,
}

impl Default for GridStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Normal,
            severity_score: 0,
            trend_direction: TrendDirection::Stable,
            polling_rate_hz: crate::emergency::NORMAL_POLLING_HZ,
            seed: None,
            active_alerts: 0,
            outbox_uploaded: 0,
            outbox_pending: 0,
            outbox_failed: 0,
            last_snapshot_ms: None,
        }
    }
}

pub type SharedStatus = Arc<std::sync::RwLock<GridStatus>>;
pub type SharedAlerts = Arc<std::sync::RwLock<Vec<PatternAlert>>>;

pub struct Engine {
    aggregator: TelemetryAggregator,
    matcher: PatternMatcher,
    checker: TruthChecker,
    machine: EmergencyStateMachine,
    capturer: Arc<DivergenceCapturer>,
    seeds: Arc<SeedStore>,
    outbox: Arc<Outbox>,
    emergency_view: SharedEmergency,
    status: SharedStatus,
    alerts: SharedAlerts,
    events: broadcast::Sender<CoreEvent>,
    base_check_interval_ms: i64,
    freshness_buckets_h: (i64, i64),
    last_input: Option<MachineInput>,
}

impl Engine {
    pub fn new(
        config: &Config,
        seeds: Arc<SeedStore>,
        vectors: Arc<VectorStore>,
        outbox: Arc<Outbox>,
        emergency_view: SharedEmergency,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        let matcher = PatternMatcher::new(vectors, config.pattern.clone(), config.engine.check_interval_ms);
        if let Err(e) = matcher.seed_catalog() {
            log::error!("engine - Error seeding pattern catalog : {:?}", e);
        }

        Self {
            aggregator: TelemetryAggregator::new(config.telemetry.ring_size),
            matcher,
            checker: TruthChecker::new(config.seed.freshness_buckets_h),
            machine: EmergencyStateMachine::new(config.emergency.clone()),
            capturer: Arc::new(DivergenceCapturer::new(&config.snapshots.dir, outbox.clone())),
            seeds,
            outbox,
            emergency_view,
            status: Arc::new(std::sync::RwLock::new(GridStatus::default())),
            alerts: Arc::new(std::sync::RwLock::new(Vec::new())),
            events,
            base_check_interval_ms: config.engine.check_interval_ms,
            freshness_buckets_h: config.seed.freshness_buckets_h,
            last_input: None,
        }
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn alerts(&self) -> SharedAlerts {
        self.alerts.clone()
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineEvent>) {
        log::info!("engine - Start");

        while let Some(event) = rx.recv().await {
            self.handle(event);
        }

        log::info!("engine - Event bus closed, stopping");
    }

    pub(crate) fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::SensorDelta(delta) => self.on_delta(&delta),
            EngineEvent::SeedRotated(seed) => {
                log::info!("engine - Seed rotated to `{}`", seed.seed_id);
                self.refresh_views(chrono::Utc::now().timestamp_millis());
            }
            EngineEvent::Tick(now_ms) => self.on_tick(now_ms),
            EngineEvent::Acknowledge(alert_id) => {
                if self.matcher.acknowledge(&alert_id) {
                    log::info!("engine - Alert `{}` acknowledged", alert_id);
                }
                self.refresh_views(chrono::Utc::now().timestamp_millis());
            }
            EngineEvent::TriggerEmergency(reason) => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let change = self.machine.trigger_emergency(reason, now_ms);
                let _ = self.events.send(CoreEvent::PhaseChanged {
                    from: change.from,
                    to: change.to,
                    reason: change.reason,
                });
                self.refresh_views(now_ms);
            }
            EngineEvent::ExitEmergency => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let change = self.machine.exit_emergency(now_ms);
                let _ = self.events.send(CoreEvent::PhaseChanged {
                    from: change.from,
                    to: change.to,
                    reason: change.reason,
                });
                self.refresh_views(now_ms);
            }
        }
    }

    fn on_delta(&mut self, delta: &SensorDelta) {
        self.aggregator.apply(delta);

        let snapshot = match self.aggregator.try_emit(chrono::Utc::now().timestamp_millis()) {
            Some(snapshot) => snapshot,
            None => return,
        };
        let now_ms = snapshot.timestamp_ms;
        let trend = self.aggregator.pressure_trend_hpa_per_hr();

        // C4 — pattern check, cadence sourced from the current phase.
        let interval_ms = if self.machine.state().phase == Phase::Emergency {
            1_000 / EMERGENCY_POLLING_HZ as i64
        } else {
            self.base_check_interval_ms
        };
        self.matcher.set_check_interval(interval_ms);
        if let Some(alert) = self.matcher.ingest(&snapshot, trend, now_ms) {
            let _ = self.events.send(CoreEvent::AlertRaised { alert });
        }

        // C5 — truth check against the installed seed handle.
        let mut consensus = None;
        let mut predicted_wind_kts = None;
        if let Some(seed) = self.seeds.try_current() {
            let time_idx = seed.timestep_index_for(now_ms);
            if let Some((report, prediction)) = self.checker.check(&snapshot, &seed, time_idx) {
                consensus = Some(report.level);
                predicted_wind_kts = Some(prediction.predicted_wind_kts);

                if report.is_divergent {
                    let capturer = self.capturer.clone();
                    let events = self.events.clone();
                    let embedding = self.matcher.current_embedding();
                    let matched = self.matcher.last_match();
                    let snapshot = snapshot.clone();
                    // Persistence stays off the engine loop.
                    tokio::task::spawn_blocking(move || {
                        match capturer.capture(&snapshot, embedding, &report, &prediction, matched.as_ref()) {
                            Ok(captured) => {
                                let _ = events.send(CoreEvent::DivergenceCaptured {
                                    snapshot_id: captured.snapshot_id,
                                    severity: captured.divergence_metrics.severity,
                                });
                            }
                            Err(e) => log::error!("engine - Error capturing divergence : {:?}", e),
                        }
                    });
                }
            }
        }

        // C6 — machine step with this snapshot's inputs.
        let input = MachineInput {
            now_ms,
            consensus,
            pressure_trend_hpa_per_hr: trend,
            wind_obs_kts: snapshot.true_wind_speed_kts,
            wind_pred_kts: predicted_wind_kts,
            vibe_confirmed: self.matcher.vibe_confirmed(),
        };
        self.last_input = Some(input);
        if let Some(change) = self.machine.step(input) {
            let _ = self.events.send(CoreEvent::PhaseChanged {
                from: change.from,
                to: change.to,
                reason: change.reason,
            });
        }

        self.refresh_views(now_ms);
        self.status.write().expect("status lock").last_snapshot_ms = Some(now_ms);
    }

    /// Ticks advance the sustain windows when no deltas arrive.
    fn on_tick(&mut self, now_ms: i64) {
        if let Some(mut input) = self.last_input {
            input.now_ms = now_ms;
            if let Some(change) = self.machine.step(input) {
                let _ = self.events.send(CoreEvent::PhaseChanged {
                    from: change.from,
                    to: change.to,
                    reason: change.reason,
                });
            }
        }
        self.refresh_views(now_ms);
    }

    fn refresh_views(&self, now_ms: i64) {
        {
            let mut view = self.emergency_view.write().expect("emergency state lock");
            *view = self.machine.state().clone();
        }
        {
            let mut alerts = self.alerts.write().expect("alerts lock");
            *alerts = self.matcher.active_alerts();
        }

        let counts = self.outbox.counts();
        let state = self.machine.state();
        let mut status = self.status.write().expect("status lock");
        status.phase = state.phase;
        status.severity_score = state.severity_score;
        status.trend_direction = state.trend_direction;
        status.polling_rate_hz = state.polling_rate_hz;
        status.seed = self.seeds.try_current().map(|seed| SeedStatus {
            seed_id: seed.seed_id.clone(),
            model_source: seed.model_source.clone(),
            forecast_start_time_ms: seed.forecast_start_time_ms,
            freshness: seed.freshness(now_ms, self.freshness_buckets_h),
        });
        status.active_alerts = self.matcher.active_alerts().iter().filter(|alert| !alert.acknowledged).count();
        status.outbox_uploaded = counts.uploaded;
        status.outbox_pending = counts.pending;
        status.outbox_failed = counts.failed;
    }
}

/// 1 Hz housekeeping ticks for the engine loop.
pub async fn run_ticker(engine_tx: mpsc::Sender<EngineEvent>) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        if engine_tx.send(EngineEvent::Tick(chrono::Utc::now().timestamp_millis())).await.is_err() {
            return;
        }
    }
}
