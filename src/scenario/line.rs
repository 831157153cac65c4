//! Line-crossing scenarios: directional counting and pass/fail tallies.

use std::collections::{BTreeMap, HashMap};

use crate::frame::{ObjectMeta, ScenarioEvent};

use super::config::{LineSpec, ScenarioSettings};
use super::geometry::{Point, Segment};
use super::tracker::Tracker;
use super::{Scenario, ScenarioKind};

#[derive(Clone, Debug)]
pub(super) struct ActiveLine {
    pub id: String,
    pub segment: Segment,
}

/// Build the usable lines. Degenerate or non-finite lines are logged once here and left out.
pub(super) fn activate_lines(specs: &[LineSpec], node: &str) -> Vec<ActiveLine> {
    specs
        .iter()
        .enumerate()
        .filter_map(|(index, spec)| {
            let id = spec
                .id
                .clone()
                .unwrap_or_else(|| format!("line-{}", index));
            let coords = [spec.x1, spec.y1, spec.x2, spec.y2];
            if coords.iter().any(|c| !c.is_finite()) {
                log::warn!("{}: line '{}' has non-finite coordinates; inactive", node, id);
                return None;
            }
            match Segment::new(Point::new(spec.x1, spec.y1), Point::new(spec.x2, spec.y2)) {
                Some(segment) => Some(ActiveLine { id, segment }),
                None => {
                    log::warn!("{}: line '{}' has zero length; inactive", node, id);
                    None
                }
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Right side to left side of start->end.
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Crossing {
    line: usize,
    track_id: u64,
    object_index: usize,
    direction: Direction,
}

/// Tracks objects and reports side flips whose path actually passes through a segment.
struct CrossingDetector {
    lines: Vec<ActiveLine>,
    tracker: Tracker,
    /// Last non-zero side per `(track, line)` and where the track was when it was seen.
    last_side: HashMap<(u64, usize), (i8, Point)>,
}

impl CrossingDetector {
    fn new(lines: Vec<ActiveLine>, settings: &ScenarioSettings) -> Self {
        Self {
            lines,
            tracker: Tracker::new(settings.tracker),
            last_side: HashMap::new(),
        }
    }

    fn observe(&mut self, objects: &[ObjectMeta]) -> Vec<Crossing> {
        let update = self.tracker.update(objects);
        if !update.expired.is_empty() {
            self.last_side
                .retain(|(track, _), _| !update.expired.contains(track));
        }

        let mut crossings = Vec::new();
        for observation in &update.observations {
            for (line_idx, line) in self.lines.iter().enumerate() {
                let side = line.segment.side(observation.current);
                if side == 0 {
                    continue;
                }
                let key = (observation.track_id, line_idx);
                if let Some((previous_side, anchor)) = self.last_side.get(&key) {
                    if *previous_side != side
                        && line.segment.crossed_by(*anchor, observation.current)
                    {
                        crossings.push(Crossing {
                            line: line_idx,
                            track_id: observation.track_id,
                            object_index: observation.object_index,
                            direction: if side > 0 { Direction::In } else { Direction::Out },
                        });
                    }
                }
                self.last_side.insert(key, (side, observation.current));
            }
        }
        crossings
    }

    fn line_ids(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|line| line.id.as_str())
    }
}

fn zeroed(
    ids: impl Iterator<Item = String>,
    keys: &[&str],
) -> BTreeMap<String, BTreeMap<String, i64>> {
    ids.map(|id| {
        let inner = keys.iter().map(|k| (k.to_string(), 0)).collect();
        (id, inner)
    })
    .collect()
}

pub struct CountingLine {
    detector: CrossingDetector,
    totals: BTreeMap<String, i64>,
    directions: BTreeMap<String, BTreeMap<String, i64>>,
    new_event: bool,
}

impl CountingLine {
    pub(super) fn new(lines: Vec<ActiveLine>, settings: &ScenarioSettings) -> Self {
        let mut scenario = Self {
            detector: CrossingDetector::new(lines, settings),
            totals: BTreeMap::new(),
            directions: BTreeMap::new(),
            new_event: false,
        };
        scenario.reset_metrics();
        scenario
    }
}

impl Scenario for CountingLine {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::CountingLine
    }

    fn update(&mut self, objects: &[ObjectMeta]) -> Vec<ScenarioEvent> {
        let crossings = self.detector.observe(objects);
        let mut events = Vec::with_capacity(crossings.len());
        for crossing in crossings {
            let id = self.detector.lines[crossing.line].id.clone();
            *self.totals.entry(id.clone()).or_insert(0) += 1;
            *self
                .directions
                .entry(id.clone())
                .or_default()
                .entry(crossing.direction.as_str().to_string())
                .or_insert(0) += 1;
            self.new_event = true;
            log::debug!(
                "track {} crossed line '{}' ({})",
                crossing.track_id,
                id,
                crossing.direction.as_str()
            );
            events.push(ScenarioEvent {
                kind: "line_crossing".to_string(),
                target: id,
                track_id: Some(crossing.track_id),
                direction: Some(crossing.direction.as_str().to_string()),
                label: objects.get(crossing.object_index).map(|o| o.label.clone()),
            });
        }
        events
    }

    fn counters(&self) -> BTreeMap<String, i64> {
        self.totals.clone()
    }

    fn breakdown(&self) -> BTreeMap<String, BTreeMap<String, i64>> {
        self.directions.clone()
    }

    fn has_new_event(&self) -> bool {
        self.new_event
    }

    fn clear_new_event(&mut self) {
        self.new_event = false;
    }

    fn reset_metrics(&mut self) {
        let ids: Vec<String> = self.detector.line_ids().map(str::to_string).collect();
        self.totals = ids.iter().map(|id| (id.clone(), 0)).collect();
        self.directions = zeroed(ids.into_iter(), &["in", "out"]);
        self.new_event = false;
    }
}

/// Objects crossing a line are tallied as pass, or fail when their label is a defect label.
pub struct DefectLine {
    detector: CrossingDetector,
    defect_labels: Vec<String>,
    totals: BTreeMap<String, i64>,
    tallies: BTreeMap<String, BTreeMap<String, i64>>,
    new_event: bool,
}

impl DefectLine {
    pub(super) fn new(lines: Vec<ActiveLine>, settings: &ScenarioSettings) -> Self {
        let mut scenario = Self {
            detector: CrossingDetector::new(lines, settings),
            defect_labels: settings.defect_labels.clone(),
            totals: BTreeMap::new(),
            tallies: BTreeMap::new(),
            new_event: false,
        };
        scenario.reset_metrics();
        scenario
    }
}

impl Scenario for DefectLine {
    fn kind(&self) -> ScenarioKind {
        ScenarioKind::DefectLine
    }

    fn update(&mut self, objects: &[ObjectMeta]) -> Vec<ScenarioEvent> {
        let crossings = self.detector.observe(objects);
        let mut events = Vec::with_capacity(crossings.len());
        for crossing in crossings {
            let id = self.detector.lines[crossing.line].id.clone();
            let label = objects
                .get(crossing.object_index)
                .map(|o| o.label.clone())
                .unwrap_or_default();
            let verdict = if self.defect_labels.contains(&label) {
                "fail"
            } else {
                "pass"
            };
            *self.totals.entry(id.clone()).or_insert(0) += 1;
            *self
                .tallies
                .entry(id.clone())
                .or_default()
                .entry(verdict.to_string())
                .or_insert(0) += 1;
            self.new_event = true;
            events.push(ScenarioEvent {
                kind: verdict.to_string(),
                target: id,
                track_id: Some(crossing.track_id),
                direction: Some(crossing.direction.as_str().to_string()),
                label: Some(label),
            });
        }
        events
    }

    fn counters(&self) -> BTreeMap<String, i64> {
        self.totals.clone()
    }

    fn breakdown(&self) -> BTreeMap<String, BTreeMap<String, i64>> {
        self.tallies.clone()
    }

    fn has_new_event(&self) -> bool {
        self.new_event
    }

    fn clear_new_event(&mut self) {
        self.new_event = false;
    }

    fn reset_metrics(&mut self) {
        let ids: Vec<String> = self.detector.line_ids().map(str::to_string).collect();
        self.totals = ids.iter().map(|id| (id.clone(), 0)).collect();
        self.tallies = zeroed(ids.into_iter(), &["pass", "fail"]);
        self.new_event = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Bbox;

    fn vertical_line(id: &str, x: f64) -> LineSpec {
        LineSpec {
            id: Some(id.to_string()),
            x1: x,
            y1: 0.0,
            x2: x,
            y2: 1.0,
        }
    }

    fn at(label: &str, cx: f64, cy: f64) -> ObjectMeta {
        ObjectMeta::new(label, 0.9, Bbox::new(cx - 0.025, cy - 0.025, 0.05, 0.05))
    }

    fn counting(specs: &[LineSpec]) -> CountingLine {
        let settings = ScenarioSettings::default();
        CountingLine::new(activate_lines(specs, "test"), &settings)
    }

    #[test]
    fn monotonic_track_counts_once() {
        let mut scenario = counting(&[vertical_line("door", 0.5)]);
        let mut events = 0;
        for step in 0..100 {
            let x = 0.125 + step as f64 * 0.008;
            events += scenario.update(&[at("person", x, 0.5)]).len();
        }
        assert_eq!(events, 1);
        assert_eq!(scenario.counters()["door"], 1);
        assert_eq!(scenario.breakdown()["door"]["out"], 1);
        assert_eq!(scenario.breakdown()["door"]["in"], 0);
        assert!(scenario.has_new_event());
    }

    #[test]
    fn sitting_on_the_line_does_not_double_count() {
        let mut scenario = counting(&[vertical_line("door", 0.5)]);
        for x in [0.45, 0.5, 0.5, 0.55, 0.5, 0.56] {
            scenario.update(&[at("person", x, 0.5)]);
        }
        assert_eq!(scenario.counters()["door"], 1);
    }

    #[test]
    fn flip_beyond_segment_end_is_not_a_crossing() {
        let short = LineSpec {
            id: Some("short".into()),
            x1: 0.5,
            y1: 0.0,
            x2: 0.5,
            y2: 0.3,
        };
        let mut scenario = counting(&[short]);
        for step in 0..20 {
            scenario.update(&[at("person", 0.4 + step as f64 * 0.01, 0.8)]);
        }
        assert_eq!(scenario.counters()["short"], 0);
        assert!(!scenario.has_new_event());
    }

    #[test]
    fn back_and_forth_counts_both_directions() {
        let mut scenario = counting(&[vertical_line("door", 0.5)]);
        for x in [0.45, 0.55, 0.45] {
            scenario.update(&[at("person", x, 0.5)]);
        }
        let breakdown = scenario.breakdown();
        assert_eq!(breakdown["door"]["out"], 1);
        assert_eq!(breakdown["door"]["in"], 1);
        assert_eq!(scenario.counters()["door"], 2);
    }

    #[test]
    fn degenerate_line_is_inactive() {
        let broken = LineSpec {
            id: Some("dot".into()),
            x1: 0.2,
            y1: 0.2,
            x2: 0.2,
            y2: 0.2,
        };
        let lines = activate_lines(&[broken, vertical_line("ok", 0.5)], "test");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, "ok");
    }

    #[test]
    fn reset_zeroes_counters_but_keeps_lines() {
        let mut scenario = counting(&[vertical_line("door", 0.5)]);
        scenario.update(&[at("person", 0.45, 0.5)]);
        scenario.update(&[at("person", 0.55, 0.5)]);
        scenario.reset_metrics();
        assert_eq!(scenario.counters()["door"], 0);
        assert!(!scenario.has_new_event());
    }

    #[test]
    fn defect_line_splits_pass_and_fail() {
        let settings = ScenarioSettings {
            defect_labels: vec!["scratch".into()],
            ..ScenarioSettings::default()
        };
        let belt = activate_lines(&[vertical_line("belt", 0.5)], "t");
        let mut scenario = DefectLine::new(belt, &settings);
        scenario.update(&[at("bottle", 0.45, 0.2), at("scratch", 0.45, 0.8)]);
        let events = scenario.update(&[at("bottle", 0.55, 0.2), at("scratch", 0.55, 0.8)]);
        assert_eq!(events.len(), 2);
        assert_eq!(scenario.breakdown()["belt"]["pass"], 1);
        assert_eq!(scenario.breakdown()["belt"]["fail"], 1);
        assert_eq!(scenario.counters()["belt"], 2);
    }
}
