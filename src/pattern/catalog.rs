//! Closed catalog of dangerous atmospheric patterns seeded into the vector
//! store at startup. Embedding components follow the contract in
//! `crate::embedding`: [temperature, pressure, humidity, windU, windV,
//! pressureTrend, cloudCover, waveHeight, wavePeriod].

use crate::config::Category;
use crate::embedding::{AtmosphericVector, WIDTH};
use crate::vector::{AtmosphericPattern, PatternSource};

pub struct DangerousPattern {
    pub id: &'static str,
    pub label: &'static str,
    pub outcome: &'static str,
    pub category: Category,
    pub components: [f32; 9],
    pub recommendations: &'static [&'static str],
    pub estimated_onset: &'static str,
}

impl DangerousPattern {
    pub fn vector(&self) -> AtmosphericVector {
        let mut components = [0.0f32; WIDTH];
        components[..9].copy_from_slice(&self.components);

        AtmosphericVector(components)
    }

    pub fn as_pattern(&self) -> AtmosphericPattern {
        AtmosphericPattern {
            id: self.id.to_string(),
            embedding: self.vector(),
            timestamp_ms: 0,
            lat: 0.0,
            lon: 0.0,
            label: Some(self.label.to_string()),
            outcome: Some(self.outcome.to_string()),
            source: PatternSource::Historical,
        }
    }
}

pub const CATALOG: [DangerousPattern; 6] = [
    DangerousPattern {
        id: "pre_squall_tropical",
        label: "Pre-Squall (Tropical)",
        outcome: "Squall line with gusts to 40kt, heavy rain, rapid wind shift",
        category: Category::Squall,
        components: [0.45, -0.1, 0.88, 0.0, -0.18, -0.35, 0.75, 0.15, 0.12],
        recommendations: &[
            "Reef early; squall gusts arrive before the rain",
            "Close hatches and secure loose deck gear",
            "Note the cloud line bearing and track its movement",
            "Expect a 90-degree-plus wind shift with the gust front",
        ],
        estimated_onset: "15\u{2013}45 minutes",
    },
    DangerousPattern {
        id: "gale_development",
        label: "Gale Development",
        outcome: "Sustained 34-47kt winds, seas building above 4m",
        category: Category::Gale,
        components: [0.0, -0.5, 0.15, 0.0, -0.25, -0.9, 0.35, 0.35, 0.2],
        recommendations: &[
            "Deep-reef or switch to storm canvas now, while it is easy",
            "Plot the nearest protected anchorage and a bail-out route",
            "Prepare the crew: meals, rest rotation, harnesses on deck",
            "Log barometer hourly; a continued fall confirms the system",
        ],
        estimated_onset: "4\u{2013}8 hours",
    },
    DangerousPattern {
        id: "rapid_pressure_drop",
        label: "Rapid Pressure Drop",
        outcome: "Explosive deepening nearby; violent conditions possible",
        category: Category::RapidPressureDrop,
        components: [0.0, -0.25, 0.0, 0.0, 0.0, -1.0, 0.3, 0.0, 0.0],
        recommendations: &[
            "Treat as a developing storm regardless of present conditions",
            "Run downwind of the low's projected track if sea room allows",
            "Rig storm gear and check jackline attachment points",
            "Shorten the watch cycle; conditions can change in minutes",
        ],
        estimated_onset: "2\u{2013}6 hours to peak",
    },
    DangerousPattern {
        id: "rogue_wave_conditions",
        label: "Rogue Wave Conditions",
        outcome: "Isolated waves to twice significant height reported",
        category: Category::RogueWave,
        components: [0.0, -0.2, 0.0, 0.0, 0.55, -0.2, 0.4, 0.6, 0.14],
        recommendations: &[
            "Avoid beam-on exposure to the dominant wave train",
            "Clip on; keep companionway boards in",
            "Reduce speed to keep the bow under control in troughs",
        ],
        estimated_onset: "unpredictable",
    },
    DangerousPattern {
        id: "itcz_convergence",
        label: "ITCZ Convergence",
        outcome: "Doldrums convection: violent isolated squalls and lightning",
        category: Category::ConvergenceZone,
        components: [0.8, 0.0, 1.0, 0.0, -0.05, 0.0, 0.85, 0.1, 0.08],
        recommendations: &[
            "Expect squalls with little warning; reef before nightfall",
            "Disconnect sensitive electronics during nearby lightning",
            "Use engine windows between cells to keep way on",
        ],
        estimated_onset: "minutes to hours",
    },
    DangerousPattern {
        id: "lee_shore_trap",
        label: "Lee Shore Trap",
        outcome: "Onshore gale pinning the vessel against the coast",
        category: Category::Gale,
        components: [0.1, -0.35, 0.4, 0.3, 0.3, -0.55, 0.5, 0.3, 0.16],
        recommendations: &[
            "Gain sea room immediately; distance is the only protection",
            "Identify the windward-most achievable waypoint and commit",
            "Do not attempt an unfamiliar harbor entrance in onshore gale",
        ],
        estimated_onset: "1\u{2013}4 hours",
    },
];

pub fn find(id: &str) -> Option<&'static DangerousPattern> {
    CATALOG.iter().find(|pattern| pattern.id == id)
}
