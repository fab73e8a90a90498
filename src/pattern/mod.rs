//! Scores live atmospheric state against the dangerous-pattern catalog and
//! raises graded alerts under threshold and cooldown rules.

pub mod catalog;

use std::collections::HashMap;
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use crate::config::{Category, PatternConfig};
use crate::embedding::AtmosphericVector;
use crate::telemetry::TelemetrySnapshot;
use crate::vector::VectorStore;

/// Active alerts kept for the status surface.
const MAX_ACTIVE_ALERTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertLevel {
    Info,
    Caution,
    Warning,
    Danger,
    Emergency,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Caution => write!(f, "caution"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Danger => write!(f, "danger"),
            AlertLevel::Emergency => write!(f, "emergency"),
        }
    }
}

/// Danger level for a similarity score. Bands are inclusive at the lower
/// edge; anything below caution stays informational and is not emitted.
pub fn level_for(similarity: f32) -> AlertLevel {
    if similarity >= 0.95 {
        AlertLevel::Emergency
    } else if similarity >= 0.88 {
        AlertLevel::Danger
    } else if similarity >= 0.80 {
        AlertLevel::Warning
    } else if similarity >= 0.70 {
        AlertLevel::Caution
    } else {
        AlertLevel::Info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPattern {
    pub pattern_id: String,
    pub label: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternAlert {
    pub id: String,
    pub level: AlertLevel,
    pub title: String,
    pub description: String,
    pub matched_pattern: MatchedPattern,
    pub current_conditions: TelemetrySnapshot,
    pub timestamp_ms: i64,
    pub acknowledged: bool,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_onset: Option<String>,
}

pub struct PatternMatcher {
    store: Arc<VectorStore>,
    config: PatternConfig,
    /// Read-only cadence input, sourced from the emergency phase.
    check_interval_ms: i64,
    last_check_ms: Option<i64>,
    /// pattern id -> last alert time
    cooldowns: HashMap<String, i64>,
    active: Vec<PatternAlert>,
    last_embedding: AtmosphericVector,
    last_match: Option<MatchedPattern>,
    last_match_category: Option<Category>,
}

impl PatternMatcher {
    pub fn new(store: Arc<VectorStore>, config: PatternConfig, check_interval_ms: i64) -> Self {
        Self {
            store,
            config,
            check_interval_ms,
            last_check_ms: None,
            cooldowns: HashMap::new(),
            active: Vec::new(),
            last_embedding: AtmosphericVector::default(),
            last_match: None,
            last_match_category: None,
        }
    }

    /// Upserts the catalog into the store. Safe to repeat; ids are stable.
    pub fn seed_catalog(&self) -> Result<(), crate::vector::VectorStoreError> {
        for pattern in &catalog::CATALOG {
            self.store.put(pattern.as_pattern())?;
        }
        log::info!("pattern - Seeded {} catalog patterns", catalog::CATALOG.len());

        Ok(())
    }

    pub fn set_check_interval(&mut self, check_interval_ms: i64) {
        self.check_interval_ms = check_interval_ms;
    }

    /// The embedding computed for the most recent snapshot, cached for the
    /// divergence capturer.
    pub fn current_embedding(&self) -> AtmosphericVector {
        self.last_embedding
    }

    /// True iff the best current match is in a gale-class category.
    pub fn vibe_confirmed(&self) -> bool {
        self.last_match_category == Some(Category::Gale)
    }

    /// Best catalog match from the most recent check, alert or not.
    pub fn last_match(&self) -> Option<MatchedPattern> {
        self.last_match.clone()
    }

    pub fn ingest(
        &mut self,
        snapshot: &TelemetrySnapshot,
        pressure_trend_hpa_per_hr: Option<f64>,
        now_ms: i64,
    ) -> Option<PatternAlert> {
        let embedding = AtmosphericVector::from_snapshot(snapshot, pressure_trend_hpa_per_hr);
        self.last_embedding = embedding;

        if let Some(last) = self.last_check_ms {
            if now_ms - last < self.check_interval_ms {
                return None;
            }
        }
        self.last_check_ms = Some(now_ms);

        let hits = self.store.query_similar(&embedding, 5, self.config.alert_threshold);
        // Only the best hit counts; a disabled or unknown top match
        // suppresses the alert, never a weaker hit in its place.
        let best = hits.into_iter().next().and_then(|hit| {
            let entry = catalog::find(&hit.pattern.id)?;
            self.config.enabled_categories.contains(&entry.category).then(|| (hit, entry))
        });

        let (hit, entry) = match best {
            Some(found) => found,
            None => {
                self.last_match = None;
                self.last_match_category = None;
                return None;
            }
        };
        self.last_match = Some(MatchedPattern {
            pattern_id: entry.id.to_string(),
            label: entry.label.to_string(),
            similarity: hit.similarity,
        });
        self.last_match_category = Some(entry.category);

        let level = level_for(hit.similarity);
        if level == AlertLevel::Info {
            return None;
        }

        if let Some(last_alert) = self.cooldowns.get(entry.id) {
            if now_ms - last_alert < self.config.alert_cooldown_ms {
                log::debug!("pattern - `{}` suppressed by cooldown", entry.id);
                return None;
            }
        }
        self.cooldowns.insert(entry.id.to_string(), now_ms);

        let alert = PatternAlert {
            id: format!("{}-{}", entry.id, now_ms),
            level,
            title: entry.label.to_string(),
            description: format!(
                "Current conditions match `{}` at {:.0}% similarity. {}",
                entry.label,
                hit.similarity * 100.0,
                entry.outcome
            ),
            matched_pattern: MatchedPattern {
                pattern_id: entry.id.to_string(),
                label: entry.label.to_string(),
                similarity: hit.similarity,
            },
            current_conditions: snapshot.clone(),
            timestamp_ms: now_ms,
            acknowledged: false,
            recommendations: entry.recommendations.iter().map(|r| r.to_string()).collect(),
            estimated_onset: Some(entry.estimated_onset.to_string()),
        };

        log::warn!("pattern - {} `{}` ({:.2})", alert.level, alert.title, hit.similarity);
        if self.active.len() == MAX_ACTIVE_ALERTS {
            self.active.remove(0);
        }
        self.active.push(alert.clone());

        Some(alert)
    }

    pub fn active_alerts(&self) -> Vec<PatternAlert> {
        self.active.clone()
    }

    pub fn acknowledge(&mut self, alert_id: &str) -> bool {
        match self.active.iter_mut().find(|alert| alert.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;

    fn snapshot(barometer_hpa: f64, wind_kts: Option<f64>) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp_ms: 1_000,
            lat: 14.0,
            lon: -58.0,
            heading_deg_true: Some(250.0),
            sog_kts: Some(6.5),
            true_wind_speed_kts: wind_kts,
            true_wind_angle_deg: wind_kts.map(|_| 0.0),
            apparent_wind_speed_kts: None,
            apparent_wind_angle_deg: None,
            barometer_hpa: Some(barometer_hpa),
            temperature_c: None,
            humidity_pct: None,
            wave_height_m: None,
            wave_period_s: None,
        }
    }

    fn gale_snapshot() -> (TelemetrySnapshot, Option<f64>) {
        let mut snapshot = snapshot(998.0, Some(20.0));
        snapshot.wave_height_m = Some(5.0);
        snapshot.wave_period_s = Some(5.0);
        (snapshot, Some(-9.0))
    }

    fn matcher(config: PatternConfig) -> PatternMatcher {
        let store = Arc::new(VectorStore::in_memory());
        let matcher = PatternMatcher::new(store, config, 0);
        matcher.seed_catalog().unwrap();
        matcher
    }

    #[test]
    fn similarity_bands_are_inclusive_at_the_edges() {
        assert_eq!(level_for(0.95), AlertLevel::Emergency);
        assert_eq!(level_for(0.88), AlertLevel::Danger);
        assert_eq!(level_for(0.80), AlertLevel::Warning);
        assert_eq!(level_for(0.70), AlertLevel::Caution);
        assert_eq!(level_for(0.6999), AlertLevel::Info);
        assert_eq!(level_for(0.94999), AlertLevel::Danger);
    }

    #[test]
    fn gale_conditions_raise_a_gale_alert() {
        let mut matcher = matcher(PatternConfig::default());
        let (snapshot, trend) = gale_snapshot();

        let alert = matcher.ingest(&snapshot, trend, 10_000).unwrap();

        assert_eq!(alert.matched_pattern.pattern_id, "gale_development");
        assert!(alert.level >= AlertLevel::Warning);
        assert!(!alert.recommendations.is_empty());
        assert_eq!(alert.estimated_onset.as_deref(), Some("4\u{2013}8 hours"));
        assert!(matcher.vibe_confirmed());
    }

    #[test]
    fn calm_conditions_raise_nothing() {
        let mut matcher = matcher(PatternConfig::default());

        let alert = matcher.ingest(&snapshot(1015.0, Some(8.0)), Some(0.3), 10_000);

        assert!(alert.is_none());
        assert!(!matcher.vibe_confirmed());
    }

    #[test]
    fn cooldown_suppresses_repeat_alerts_for_fifteen_minutes() {
        let mut matcher = matcher(PatternConfig::default());
        let (snapshot, trend) = gale_snapshot();

        assert!(matcher.ingest(&snapshot, trend, 0).is_some());
        assert!(matcher.ingest(&snapshot, trend, 60_000).is_none());
        assert!(matcher.ingest(&snapshot, trend, 899_999).is_none());
        assert!(matcher.ingest(&snapshot, trend, 900_000).is_some());
    }

    #[test]
    fn disabled_categories_never_alert() {
        let config = PatternConfig {
            enabled_categories: [Category::ConvergenceZone].into_iter().collect(),
            ..PatternConfig::default()
        };
        let mut matcher = matcher(config);
        let (snapshot, trend) = gale_snapshot();

        assert!(matcher.ingest(&snapshot, trend, 0).is_none());
        assert!(!matcher.vibe_confirmed());
    }

    #[test]
    fn disabled_best_hit_suppresses_weaker_enabled_hits() {
        // A saturated pressure fall with no wind reading matches
        // rapid_pressure_drop well above gale_development. With the former
        // disabled the alert is suppressed outright, not rerouted to the
        // weaker gale hit.
        let mut enabled = Category::all();
        enabled.remove(&Category::RapidPressureDrop);
        let config = PatternConfig { enabled_categories: enabled, ..PatternConfig::default() };
        let mut matcher = matcher(config);

        let snapshot = snapshot(1006.0, None);
        assert!(matcher.ingest(&snapshot, Some(-10.5), 0).is_none());
        assert!(matcher.last_match().is_none());
        assert!(!matcher.vibe_confirmed());

        // The same conditions alert on the rapid fall once it is enabled,
        // confirming it really is the best hit.
        let mut matcher = self::matcher(PatternConfig::default());
        let alert = matcher.ingest(&snapshot, Some(-10.5), 0).unwrap();
        assert_eq!(alert.matched_pattern.pattern_id, "rapid_pressure_drop");
    }

    #[test]
    fn check_interval_spaces_pattern_checks() {
        let config = PatternConfig { alert_cooldown_ms: 0, ..PatternConfig::default() };
        let mut matcher = matcher(config);
        matcher.set_check_interval(30_000);
        let (snapshot, trend) = gale_snapshot();

        assert!(matcher.ingest(&snapshot, trend, 0).is_some());
        assert!(matcher.ingest(&snapshot, trend, 10_000).is_none());
        assert!(matcher.ingest(&snapshot, trend, 30_000).is_some());
    }

    #[test]
    fn acknowledge_marks_the_alert() {
        let mut matcher = matcher(PatternConfig::default());
        let (snapshot, trend) = gale_snapshot();
        let alert = matcher.ingest(&snapshot, trend, 0).unwrap();

        assert!(matcher.acknowledge(&alert.id));
        assert!(matcher.active_alerts()[0].acknowledged);
        assert!(!matcher.acknowledge("missing-id"));
    }

    #[test]
    fn embedding_is_cached_even_between_checks() {
        let config = PatternConfig { alert_cooldown_ms: 0, ..PatternConfig::default() };
        let mut matcher = matcher(config);
        matcher.set_check_interval(60_000);
        let (snapshot, trend) = gale_snapshot();

        matcher.ingest(&snapshot, trend, 0);
        matcher.ingest(&self::snapshot(1013.0, None), None, 1_000);

        // The cached embedding follows the latest snapshot even though the
        // similarity check was skipped.
        assert_eq!(matcher.current_embedding().components()[crate::embedding::IDX_PRESSURE], 0.0);
    }
}
