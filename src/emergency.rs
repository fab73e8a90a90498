//! Graded emergency state machine driven by consensus, the trend severity
//! score, and vibe confirmation from the pattern matcher.
//!
//! Phases walk `normal → detecting → confirming → emergency → recovering →
//! normal`; no other edges exist apart from the manual overrides. Entry into
//! `emergency` boosts polling to 10 Hz and suspends the background task set;
//! only re-entry into `normal` restores them — `recovering` keeps the boost.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use serde::{Serialize, Deserialize};
use crate::config::EmergencyConfig;
use crate::truth::Consensus;

pub const TASK_PATTERN_INDEXING: &str = "pattern_indexing";
pub const TASK_SEED_PREFETCH: &str = "seed_prefetch";
pub const TASK_ANALYTICS_UPLOAD: &str = "analytics_upload";
pub const TASK_TILE_CACHE_CLEANUP: &str = "tile_cache_cleanup";

pub const SUSPENDABLE_TASKS: [&str; 4] = [
    TASK_PATTERN_INDEXING,
    TASK_SEED_PREFETCH,
    TASK_ANALYTICS_UPLOAD,
    TASK_TILE_CACHE_CLEANUP,
];

pub const NORMAL_POLLING_HZ: u32 = 1;
pub const EMERGENCY_POLLING_HZ: u32 = 10;

/// TSS below which auto-recovery begins.
const AUTO_EXIT_TSS: u8 = 35;
/// Disagreement must hold this long before `detecting`.
const DISAGREE_SUSTAIN_MS: i64 = 10_000;
/// Calm must hold this long before `recovering` completes.
const RECOVERY_SUSTAIN_MS: i64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Normal,
    Detecting,
    Confirming,
    Emergency,
    Recovering,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Normal => write!(f, "normal"),
            Phase::Detecting => write!(f, "detecting"),
            Phase::Confirming => write!(f, "confirming"),
            Phase::Emergency => write!(f, "emergency"),
            Phase::Recovering => write!(f, "recovering"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmergencyReason {
    DivergentConsensus,
    SeverityThreshold,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrendDirection {
    Worsening,
    Stable,
    Improving,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyState {
    pub phase: Phase,
    pub activated_at_ms: Option<i64>,
    pub reason: Option<EmergencyReason>,
    pub severity_score: u8,
    pub trend_direction: TrendDirection,
    pub polling_rate_hz: u32,
    pub suspended_task_ids: BTreeSet<String>,
}

impl Default for EmergencyState {
    fn default() -> Self {
        Self {
            phase: Phase::Normal,
            activated_at_ms: None,
            reason: None,
            severity_score: 0,
            trend_direction: TrendDirection::Stable,
            polling_rate_hz: NORMAL_POLLING_HZ,
            suspended_task_ids: BTreeSet::new(),
        }
    }
}

/// View of the machine shared with background tasks.
pub type SharedEmergency = Arc<RwLock<EmergencyState>>;

pub fn shared() -> SharedEmergency {
    Arc::new(RwLock::new(EmergencyState::default()))
}

pub fn is_task_suspended(shared: &SharedEmergency, task_id: &str) -> bool {
    shared.read().expect("emergency state lock").suspended_task_ids.contains(task_id)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MachineInput {
    pub now_ms: i64,
    pub consensus: Option<Consensus>,
    pub pressure_trend_hpa_per_hr: Option<f64>,
    pub wind_obs_kts: Option<f64>,
    pub wind_pred_kts: Option<f64>,
    pub vibe_confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
    pub reason: Option<EmergencyReason>,
}

pub struct EmergencyStateMachine {
    config: EmergencyConfig,
    state: EmergencyState,
    prev_tss: Option<u8>,
    disagree_since_ms: Option<i64>,
    calm_since_ms: Option<i64>,
}

impl EmergencyStateMachine {
    pub fn new(config: EmergencyConfig) -> Self {
        Self {
            config,
            state: EmergencyState::default(),
            prev_tss: None,
            disagree_since_ms: None,
            calm_since_ms: None,
        }
    }

    pub fn state(&self) -> &EmergencyState {
        &self.state
    }

    /// Trend Severity Score from pressure-fall rate and wind prediction
    /// error: `σ = (−ΔP/Δt)·2.5 + (W_obs − W_pred)·0.8`, normalized to
    /// [0, 100] via `clamp((σ + 30)·100/60)`.
    pub fn tss(input: &MachineInput) -> u8 {
        let pressure_term = input.pressure_trend_hpa_per_hr.map(|trend| -trend * 2.5).unwrap_or(0.0);
        let wind_term = match (input.wind_obs_kts, input.wind_pred_kts) {
            (Some(observed), Some(predicted)) => (observed - predicted) * 0.8,
            _ => 0.0,
        };

        let sigma = pressure_term + wind_term;
        ((sigma + 30.0) * 100.0 / 60.0).clamp(0.0, 100.0).round() as u8
    }

    /// One table-driven transition at most per step.
    pub fn step(&mut self, input: MachineInput) -> Option<PhaseChange> {
        let tss = Self::tss(&input);
        self.state.trend_direction = match self.prev_tss {
            Some(prev) if tss as i16 - prev as i16 > 5 => TrendDirection::Worsening,
            Some(prev) if (tss as i16 - prev as i16) < -5 => TrendDirection::Improving,
            Some(_) => TrendDirection::Stable,
            None => TrendDirection::Stable,
        };
        self.prev_tss = Some(tss);
        self.state.severity_score = tss;

        let disagree = input.consensus == Some(Consensus::Disagree);
        let thresholds = self.config.tss_thresholds;

        match self.state.phase {
            Phase::Normal => {
                if disagree {
                    let since = *self.disagree_since_ms.get_or_insert(input.now_ms);
                    if input.now_ms - since >= DISAGREE_SUSTAIN_MS {
                        return Some(self.enter(Phase::Detecting, None, input.now_ms));
                    }
                } else {
                    self.disagree_since_ms = None;
                }
                None
            }
            Phase::Detecting => {
                if !disagree {
                    Some(self.enter(Phase::Normal, None, input.now_ms))
                } else if tss >= thresholds.elevated {
                    Some(self.enter(Phase::Confirming, None, input.now_ms))
                } else {
                    None
                }
            }
            Phase::Confirming => {
                if input.vibe_confirmed || tss >= thresholds.high {
                    let reason = if tss >= thresholds.high {
                        EmergencyReason::SeverityThreshold
                    } else {
                        EmergencyReason::DivergentConsensus
                    };
                    Some(self.enter(Phase::Emergency, Some(reason), input.now_ms))
                } else if !disagree && tss < thresholds.elevated {
                    Some(self.enter(Phase::Normal, None, input.now_ms))
                } else {
                    None
                }
            }
            Phase::Emergency => {
                if self.config.auto_recovery && tss < AUTO_EXIT_TSS {
                    self.calm_since_ms = Some(input.now_ms);
                    Some(self.enter(Phase::Recovering, self.state.reason, input.now_ms))
                } else {
                    None
                }
            }
            Phase::Recovering => {
                if tss >= AUTO_EXIT_TSS {
                    self.calm_since_ms = None;
                    Some(self.enter(Phase::Emergency, self.state.reason, input.now_ms))
                } else {
                    let since = *self.calm_since_ms.get_or_insert(input.now_ms);
                    if input.now_ms - since >= RECOVERY_SUSTAIN_MS {
                        Some(self.enter(Phase::Normal, None, input.now_ms))
                    } else {
                        None
                    }
                }
            }
        }
    }

    /// Manual override; bypasses the table.
    pub fn trigger_emergency(&mut self, reason: EmergencyReason, now_ms: i64) -> PhaseChange {
        self.enter(Phase::Emergency, Some(reason), now_ms)
    }

    /// Manual override; bypasses the table.
    pub fn exit_emergency(&mut self, now_ms: i64) -> PhaseChange {
        self.enter(Phase::Normal, None, now_ms)
    }

    fn enter(&mut self, to: Phase, reason: Option<EmergencyReason>, now_ms: i64) -> PhaseChange {
        let from = self.state.phase;
        self.state.phase = to;

        match to {
            Phase::Emergency => {
                self.state.polling_rate_hz = EMERGENCY_POLLING_HZ;
                self.state.suspended_task_ids = SUSPENDABLE_TASKS.iter().map(|id| id.to_string()).collect();
                if self.state.activated_at_ms.is_none() {
                    self.state.activated_at_ms = Some(now_ms);
                }
                self.state.reason = reason;
                log::warn!("emergency - Entered emergency ({:?})", reason);
            }
            Phase::Normal => {
                self.state.polling_rate_hz = NORMAL_POLLING_HZ;
                self.state.suspended_task_ids.clear();
                self.state.activated_at_ms = None;
                self.state.reason = None;
                self.disagree_since_ms = None;
                self.calm_since_ms = None;
            }
            Phase::Detecting | Phase::Confirming | Phase::Recovering => {}
        }

        log::info!("emergency - {} -> {}", from, to);
        PhaseChange { from, to, reason: self.state.reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Input producing the requested TSS through the pressure term alone.
    fn input_for_tss(tss: f64, now_ms: i64) -> MachineInput {
        let sigma = tss * 60.0 / 100.0 - 30.0;
        MachineInput {
            now_ms,
            consensus: Some(Consensus::Agree),
            pressure_trend_hpa_per_hr: Some(-sigma / 2.5),
            wind_obs_kts: None,
            wind_pred_kts: None,
            vibe_confirmed: false,
        }
    }

    fn disagreeing(mut input: MachineInput) -> MachineInput {
        input.consensus = Some(Consensus::Disagree);
        input
    }

    #[test]
    fn tss_combines_pressure_fall_and_wind_error() {
        // Falling 4 hPa/hr and blowing 10 kt over prediction:
        // sigma = 10 + 8 = 18 -> tss = 80.
        let input = MachineInput {
            now_ms: 0,
            consensus: None,
            pressure_trend_hpa_per_hr: Some(-4.0),
            wind_obs_kts: Some(20.0),
            wind_pred_kts: Some(10.0),
            vibe_confirmed: false,
        };

        assert_eq!(EmergencyStateMachine::tss(&input), 80);
    }

    #[test]
    fn tss_boundaries_map_exactly() {
        assert_eq!(EmergencyStateMachine::tss(&input_for_tss(40.0, 0)), 40);
        assert_eq!(EmergencyStateMachine::tss(&input_for_tss(60.0, 0)), 60);
        assert_eq!(EmergencyStateMachine::tss(&input_for_tss(80.0, 0)), 80);
        assert_eq!(EmergencyStateMachine::tss(&input_for_tss(35.0, 0)), 35);
        assert_eq!(EmergencyStateMachine::tss(&input_for_tss(0.0, 0)), 0);
        assert_eq!(EmergencyStateMachine::tss(&input_for_tss(150.0, 0)), 100);
    }

    #[test]
    fn full_escalation_walk() {
        let mut machine = EmergencyStateMachine::new(EmergencyConfig::default());

        // Sustained disagreement: nothing for 10 s, then detecting.
        assert!(machine.step(disagreeing(input_for_tss(20.0, 0))).is_none());
        assert!(machine.step(disagreeing(input_for_tss(20.0, 5_000))).is_none());
        let change = machine.step(disagreeing(input_for_tss(20.0, 10_000))).unwrap();
        assert_eq!((change.from, change.to), (Phase::Normal, Phase::Detecting));

        // TSS at the elevated band moves to confirming.
        let change = machine.step(disagreeing(input_for_tss(40.0, 11_000))).unwrap();
        assert_eq!(change.to, Phase::Confirming);

        // TSS at the high band enters emergency with the severity reason.
        let change = machine.step(disagreeing(input_for_tss(60.0, 12_000))).unwrap();
        assert_eq!(change.to, Phase::Emergency);
        assert_eq!(change.reason, Some(EmergencyReason::SeverityThreshold));

        let state = machine.state();
        assert_eq!(state.polling_rate_hz, EMERGENCY_POLLING_HZ);
        for task in SUSPENDABLE_TASKS {
            assert!(state.suspended_task_ids.contains(task), "{}", task);
        }
        assert_eq!(state.activated_at_ms, Some(12_000));

        // Calm: recovering immediately, normal after five sustained minutes.
        let change = machine.step(input_for_tss(34.0, 20_000)).unwrap();
        assert_eq!(change.to, Phase::Recovering);
        assert_eq!(machine.state().polling_rate_hz, EMERGENCY_POLLING_HZ);
        assert!(machine.step(input_for_tss(30.0, 200_000)).is_none());
        let change = machine.step(input_for_tss(30.0, 320_000)).unwrap();
        assert_eq!(change.to, Phase::Normal);

        let state = machine.state();
        assert_eq!(state.polling_rate_hz, NORMAL_POLLING_HZ);
        assert!(state.suspended_task_ids.is_empty());
        assert_eq!(state.activated_at_ms, None);
        assert_eq!(state.reason, None);
    }

    #[test]
    fn vibe_confirmation_enters_emergency_below_the_high_band() {
        let mut machine = EmergencyStateMachine::new(EmergencyConfig::default());
        machine.step(disagreeing(input_for_tss(45.0, 0)));
        machine.step(disagreeing(input_for_tss(45.0, 10_000)));
        machine.step(disagreeing(input_for_tss(45.0, 10_500)));
        assert_eq!(machine.state().phase, Phase::Confirming);

        let mut input = disagreeing(input_for_tss(45.0, 11_000));
        input.vibe_confirmed = true;
        let change = machine.step(input).unwrap();

        assert_eq!(change.to, Phase::Emergency);
        assert_eq!(change.reason, Some(EmergencyReason::DivergentConsensus));
    }

    #[test]
    fn detecting_returns_to_normal_when_consensus_breaks() {
        let mut machine = EmergencyStateMachine::new(EmergencyConfig::default());
        machine.step(disagreeing(input_for_tss(20.0, 0)));
        machine.step(disagreeing(input_for_tss(20.0, 10_000)));
        assert_eq!(machine.state().phase, Phase::Detecting);

        let change = machine.step(input_for_tss(20.0, 11_000)).unwrap();
        assert_eq!((change.from, change.to), (Phase::Detecting, Phase::Normal));
    }

    #[test]
    fn interrupted_disagreement_restarts_the_sustain_window() {
        let mut machine = EmergencyStateMachine::new(EmergencyConfig::default());
        machine.step(disagreeing(input_for_tss(20.0, 0)));
        machine.step(input_for_tss(20.0, 6_000)); // consensus recovers
        assert!(machine.step(disagreeing(input_for_tss(20.0, 10_000))).is_none());
        assert_eq!(machine.state().phase, Phase::Normal);
    }

    #[test]
    fn recovering_reenters_emergency_when_tss_rises() {
        let mut machine = EmergencyStateMachine::new(EmergencyConfig::default());
        machine.trigger_emergency(EmergencyReason::Manual, 0);
        machine.step(input_for_tss(30.0, 1_000));
        assert_eq!(machine.state().phase, Phase::Recovering);

        let change = machine.step(input_for_tss(35.0, 2_000)).unwrap();
        assert_eq!(change.to, Phase::Emergency);
    }

    #[test]
    fn auto_recovery_off_requires_manual_exit() {
        let config = EmergencyConfig { auto_recovery: false, ..EmergencyConfig::default() };
        let mut machine = EmergencyStateMachine::new(config);
        machine.trigger_emergency(EmergencyReason::Manual, 0);

        assert!(machine.step(input_for_tss(0.0, 60_000)).is_none());
        assert_eq!(machine.state().phase, Phase::Emergency);

        let change = machine.exit_emergency(61_000);
        assert_eq!(change.to, Phase::Normal);
        assert_eq!(machine.state().polling_rate_hz, NORMAL_POLLING_HZ);
    }

    #[test]
    fn trend_direction_follows_tss_deltas() {
        let mut machine = EmergencyStateMachine::new(EmergencyConfig::default());
        machine.step(input_for_tss(50.0, 0));
        assert_eq!(machine.state().trend_direction, TrendDirection::Stable);

        machine.step(input_for_tss(56.0, 1_000));
        assert_eq!(machine.state().trend_direction, TrendDirection::Worsening);

        machine.step(input_for_tss(58.0, 2_000));
        assert_eq!(machine.state().trend_direction, TrendDirection::Stable);

        machine.step(input_for_tss(40.0, 3_000));
        assert_eq!(machine.state().trend_direction, TrendDirection::Improving);
    }

    #[test]
    fn forced_emergency_steps_down_through_recovery() {
        // TSS 80 -> 30 while consensus agrees: recovering at 34, normal
        // five minutes later.
        let mut machine = EmergencyStateMachine::new(EmergencyConfig::default());
        machine.trigger_emergency(EmergencyReason::Manual, 0);

        assert!(machine.step(input_for_tss(80.0, 10_000)).is_none());
        assert!(machine.step(input_for_tss(50.0, 30_000)).is_none());
        assert!(machine.step(input_for_tss(36.0, 50_000)).is_none());

        let change = machine.step(input_for_tss(34.0, 60_000)).unwrap();
        assert_eq!(change.to, Phase::Recovering);

        for (tss, at_ms) in [(33.0, 120_000), (32.0, 200_000), (31.0, 300_000)] {
            assert!(machine.step(input_for_tss(tss, at_ms)).is_none());
        }
        let change = machine.step(input_for_tss(30.0, 360_000)).unwrap();
        assert_eq!(change.to, Phase::Normal);
    }
}
