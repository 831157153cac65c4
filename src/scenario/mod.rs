//! Geometric event engine.
//!
//! A scenario turns the per-frame detection list into stateful business events:
//! line crossings, zone intrusions, queue and shelf occupancy, defect tallies.
//! Each scenario instance is owned by exactly one transform thread; other
//! threads only ever see `ScenarioSnapshot` copies.
//!
//! `has_new_event` follows rising-edge semantics: it is set by `update()` when a
//! qualifying transition happens and stays set until the consumer clears it.

mod config;
pub mod geometry;
pub mod history;
mod line;
pub mod tracker;
mod zone;

pub use config::{normalize_threshold, BoxSpec, LineSpec, ScenarioSettings, ZoneSpec};
pub use history::{DetectionHistory, DetectionOutcome, HistoryCounts};
pub use line::{CountingLine, DefectLine, Direction};
pub use zone::ZoneScenario;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::frame::{ObjectMeta, ScenarioEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    CountingLine,
    DangerZone,
    QueueZone,
    ShelfZone,
    DefectLine,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 5] = [
        ScenarioKind::CountingLine,
        ScenarioKind::DangerZone,
        ScenarioKind::QueueZone,
        ScenarioKind::ShelfZone,
        ScenarioKind::DefectLine,
    ];

    /// Registry name of the transform that runs this scenario.
    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioKind::CountingLine => "counting_line",
            ScenarioKind::DangerZone => "danger_zone",
            ScenarioKind::QueueZone => "queue_zone",
            ScenarioKind::ShelfZone => "shelf_zone",
            ScenarioKind::DefectLine => "defect_line",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Scenario: Send {
    fn kind(&self) -> ScenarioKind;

    /// Feed one frame's (already filtered) detections. Returns the events raised on this frame.
    fn update(&mut self, objects: &[ObjectMeta]) -> Vec<ScenarioEvent>;

    /// Headline counter per line or zone id.
    fn counters(&self) -> BTreeMap<String, i64>;

    /// Per line or zone id, a finer split of the headline counter.
    fn breakdown(&self) -> BTreeMap<String, BTreeMap<String, i64>>;

    fn has_new_event(&self) -> bool;

    fn clear_new_event(&mut self);

    fn reset_metrics(&mut self);
}

/// Eventually consistent copy of a scenario, published after every frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ScenarioSnapshot {
    pub scenario: String,
    pub counters: BTreeMap<String, i64>,
    pub breakdown: BTreeMap<String, BTreeMap<String, i64>>,
    pub detections: HistoryCounts,
    pub last_frame_id: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Build the scenario engine for `kind`. Invalid lines and zones are logged and skipped.
pub fn build_scenario(
    kind: ScenarioKind,
    settings: &ScenarioSettings,
    node: &str,
) -> Box<dyn Scenario> {
    match kind {
        ScenarioKind::CountingLine => {
            let lines = line::activate_lines(&settings.lines, node);
            if lines.is_empty() {
                log::warn!("{}: no active counting lines", node);
            }
            Box::new(CountingLine::new(lines, settings))
        }
        ScenarioKind::DefectLine => {
            let lines = line::activate_lines(&settings.lines, node);
            if lines.is_empty() {
                log::warn!("{}: no active defect lines", node);
            }
            Box::new(DefectLine::new(lines, settings))
        }
        ScenarioKind::DangerZone | ScenarioKind::QueueZone | ScenarioKind::ShelfZone => {
            let zones = zone::activate_zones(&settings.zones, node);
            if zones.is_empty() {
                log::warn!("{}: no active zones", node);
            }
            Box::new(ZoneScenario::new(kind, zones, settings))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_registry_names() {
        for kind in ScenarioKind::ALL {
            assert_eq!(ScenarioKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ScenarioKind::parse("filter_transform"), None);
    }

    #[test]
    fn builder_picks_engine_by_kind() {
        let settings = ScenarioSettings {
            zones: vec![ZoneSpec {
                id: Some("z".into()),
                bounds: Some(BoxSpec {
                    x1: 0.0,
                    y1: 0.0,
                    x2: 1.0,
                    y2: 1.0,
                }),
                polygon: None,
            }],
            ..ScenarioSettings::default()
        };
        let scenario = build_scenario(ScenarioKind::QueueZone, &settings, "q");
        assert_eq!(scenario.kind(), ScenarioKind::QueueZone);
        assert_eq!(scenario.counters().get("z"), Some(&0));
    }
}
