//! Zone occupancy scenarios.
//!
//! All three share one engine: count the objects overlapping each zone, evaluate
//! a per-zone condition, and raise an event only on the frame where the
//! condition goes from false to true.

use std::collections::BTreeMap;

use crate::frame::{ObjectMeta, ScenarioEvent};

use super::config::{ScenarioSettings, ZoneSpec};
use super::geometry::{BoxZone, Polygon, ZoneShape};
use super::{Scenario, ScenarioKind};

#[derive(Clone, Debug)]
pub(super) struct ActiveZone {
    pub id: String,
    pub shape: ZoneShape,
}

/// Build the usable zones. Invalid geometry is logged once here and left out.
pub(super) fn activate_zones(specs: &[ZoneSpec], node: &str) -> Vec<ActiveZone> {
    specs
        .iter()
        .enumerate()
        .filter_map(|(index, spec)| {
            let id = spec
                .id
                .clone()
                .unwrap_or_else(|| format!("zone-{}", index));
            let shape = if let Some(points) = &spec.polygon {
                if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
                    Err("non-finite vertex".to_string())
                } else {
                    Polygon::new(points.clone()).map(ZoneShape::Polygon)
                }
            } else if let Some(b) = &spec.bounds {
                if [b.x1, b.y1, b.x2, b.y2].iter().all(|c| c.is_finite()) {
                    Ok(ZoneShape::Box(BoxZone::new(b.x1, b.y1, b.x2, b.y2)))
                } else {
                    Err("non-finite corner".to_string())
                }
            } else {
                Err("neither box nor polygon given".to_string())
            };
            match shape {
                Ok(shape) => Some(ActiveZone { id, shape }),
                Err(reason) => {
                    log::warn!("{}: zone '{}' is invalid ({}); inactive", node, id, reason);
                    None
                }
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    /// Occupancy reaches at least this many objects.
    AtLeast(usize),
    Empty,
}

impl Trigger {
    fn holds(self, occupancy: usize) -> bool {
        match self {
            Trigger::AtLeast(min) => occupancy >= min,
            Trigger::Empty => occupancy == 0,
        }
    }
}

pub struct ZoneScenario {
    kind: ScenarioKind,
    event_kind: &'static str,
    trigger: Trigger,
    zones: Vec<ActiveZone>,
    occupancy: Vec<usize>,
    condition: Vec<bool>,
    triggered: Vec<i64>,
    new_event: bool,
}

impl ZoneScenario {
    pub(super) fn new(
        kind: ScenarioKind,
        zones: Vec<ActiveZone>,
        settings: &ScenarioSettings,
    ) -> Self {
        let (event_kind, trigger) = match kind {
            ScenarioKind::QueueZone => {
                ("queue_full", Trigger::AtLeast(settings.max_occupancy.max(1)))
            }
            ScenarioKind::ShelfZone => ("out_of_stock", Trigger::Empty),
            _ => ("intrusion", Trigger::AtLeast(settings.min_occupancy.max(1))),
        };
        let count = zones.len();
        Self {
            kind,
            event_kind,
            trigger,
            zones,
            occupancy: vec![0; count],
            condition: vec![false; count],
            triggered: vec![0; count],
            new_event: false,
        }
    }

    /// Danger zones report cumulative intrusions; the others report live occupancy.
    fn counter_value(&self, index: usize) -> i64 {
        match self.kind {
            ScenarioKind::DangerZone => self.triggered[index],
            _ => self.occupancy[index] as i64,
        }
    }
}

impl Scenario for ZoneScenario {
    fn kind(&self) -> ScenarioKind {
        self.kind
    }

    fn update(&mut self, objects: &[ObjectMeta]) -> Vec<ScenarioEvent> {
        let mut events = Vec::new();
        for (index, zone) in self.zones.iter().enumerate() {
            let inside: Vec<&ObjectMeta> = objects
                .iter()
                .filter(|object| zone.shape.overlaps(&object.bbox))
                .collect();
            let occupancy = inside.len();
            let holds = self.trigger.holds(occupancy);
            if holds && !self.condition[index] {
                self.triggered[index] += 1;
                self.new_event = true;
                log::debug!("zone '{}': {} (occupancy {})", zone.id, self.event_kind, occupancy);
                events.push(ScenarioEvent {
                    kind: self.event_kind.to_string(),
                    target: zone.id.clone(),
                    track_id: None,
                    direction: None,
                    label: inside.first().map(|o| o.label.clone()),
                });
            }
            self.condition[index] = holds;
            self.occupancy[index] = occupancy;
        }
        events
    }

    fn counters(&self) -> BTreeMap<String, i64> {
        self.zones
            .iter()
            .enumerate()
            .map(|(index, zone)| (zone.id.clone(), self.counter_value(index)))
            .collect()
    }

    fn breakdown(&self) -> BTreeMap<String, BTreeMap<String, i64>> {
        self.zones
            .iter()
            .enumerate()
            .map(|(index, zone)| {
                let mut inner = BTreeMap::new();
                inner.insert("occupancy".to_string(), self.occupancy[index] as i64);
                inner.insert("events".to_string(), self.triggered[index]);
                (zone.id.clone(), inner)
            })
            .collect()
    }

    fn has_new_event(&self) -> bool {
        self.new_event
    }

    fn clear_new_event(&mut self) {
        self.new_event = false;
    }

    /// Event tallies go to zero. Live occupancy and the edge state are kept so a
    /// condition that still holds does not fire again.
    fn reset_metrics(&mut self) {
        self.triggered.iter_mut().for_each(|n| *n = 0);
        self.new_event = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Bbox;
    use crate::scenario::config::BoxSpec;
    use crate::scenario::geometry::Point;

    fn box_zone(id: &str, x1: f64, y1: f64, x2: f64, y2: f64) -> ZoneSpec {
        ZoneSpec {
            id: Some(id.to_string()),
            bounds: Some(BoxSpec { x1, y1, x2, y2 }),
            polygon: None,
        }
    }

    fn obj(l: f64, t: f64) -> ObjectMeta {
        ObjectMeta::new("person", 0.9, Bbox::new(l, t, 0.1, 0.1))
    }

    fn build(kind: ScenarioKind, specs: &[ZoneSpec], settings: &ScenarioSettings) -> ZoneScenario {
        ZoneScenario::new(kind, activate_zones(specs, "test"), settings)
    }

    #[test]
    fn danger_zone_fires_on_rising_edge_only() {
        let settings = ScenarioSettings::default();
        let pit = box_zone("pit", 0.0, 0.0, 0.3, 0.3);
        let mut zone = build(ScenarioKind::DangerZone, &[pit], &settings);
        let mut fired = 0;
        for _ in 0..10 {
            fired += zone.update(&[obj(0.1, 0.1)]).len();
        }
        assert_eq!(fired, 1);
        zone.update(&[obj(0.8, 0.8)]);
        fired += zone.update(&[obj(0.2, 0.2)]).len();
        assert_eq!(fired, 2);
        assert_eq!(zone.counters()["pit"], 2);
    }

    #[test]
    fn queue_zone_fires_when_reaching_max_occupancy() {
        let settings = ScenarioSettings {
            max_occupancy: 3,
            ..ScenarioSettings::default()
        };
        let till = box_zone("till", 0.0, 0.0, 0.5, 0.5);
        let mut zone = build(ScenarioKind::QueueZone, &[till], &settings);
        assert!(zone.update(&[obj(0.1, 0.1), obj(0.2, 0.2)]).is_empty());
        let events = zone.update(&[obj(0.1, 0.1), obj(0.2, 0.2), obj(0.3, 0.3)]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "queue_full");
        assert_eq!(zone.counters()["till"], 3);
        let crowd = [obj(0.1, 0.1), obj(0.2, 0.2), obj(0.3, 0.3), obj(0.0, 0.0)];
        assert!(zone.update(&crowd).is_empty());
    }

    #[test]
    fn shelf_zone_fires_when_emptied() {
        let settings = ScenarioSettings::default();
        let shelf = box_zone("shelf", 0.5, 0.5, 1.0, 1.0);
        let mut zone = build(ScenarioKind::ShelfZone, &[shelf], &settings);
        assert!(zone.update(&[obj(0.6, 0.6)]).is_empty());
        let events = zone.update(&[]);
        assert_eq!(events[0].kind, "out_of_stock");
        assert!(zone.update(&[]).is_empty());
        assert_eq!(zone.counters()["shelf"], 0);
    }

    #[test]
    fn invalid_polygon_is_treated_as_no_zone() {
        let bowtie = ZoneSpec {
            id: Some("bad".into()),
            bounds: None,
            polygon: Some(vec![
                Point::new(0.0, 0.0),
                Point::new(0.2, 0.2),
                Point::new(0.2, 0.0),
                Point::new(0.0, 0.1),
            ]),
        };
        let zones = activate_zones(&[bowtie, box_zone("ok", 0.0, 0.0, 0.1, 0.1)], "test");
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].id, "ok");
    }

    #[test]
    fn reset_keeps_edge_state() {
        let settings = ScenarioSettings::default();
        let pit = box_zone("pit", 0.0, 0.0, 0.3, 0.3);
        let mut zone = build(ScenarioKind::DangerZone, &[pit], &settings);
        zone.update(&[obj(0.1, 0.1)]);
        zone.reset_metrics();
        assert!(zone.update(&[obj(0.1, 0.1)]).is_empty());
        assert_eq!(zone.counters()["pit"], 0);
    }
}
