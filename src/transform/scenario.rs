//! Scenario transforms: `counting_line`, `defect_line` and the zone family.
//!
//! One element type wraps every scenario engine and publishes its state to
//! the runtime's scenario board.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use crate::context::ScenarioSlot;
use crate::element::{Flow, Transform};
use crate::frame::{Frame, ScenarioInsight};
use crate::graph::NodeContext;
use crate::scenario::{
    build_scenario, DetectionHistory, DetectionOutcome, Scenario, ScenarioKind, ScenarioSettings,
    ScenarioSnapshot,
};

/// Runs one scenario engine over the frame's detections.
///
/// Per frame, in order: record the detection outcome, drop objects below the
/// threshold or outside `labels`, update the engine, attach its state to the
/// frame, publish a snapshot, then apply any pending reset.
pub struct ScenarioTransform {
    node: String,
    settings: ScenarioSettings,
    scenario: Box<dyn Scenario>,
    history: DetectionHistory,
    slot: Arc<ScenarioSlot>,
}

impl ScenarioTransform {
    pub fn new(
        node: &str,
        kind: ScenarioKind,
        settings: ScenarioSettings,
        slot: Arc<ScenarioSlot>,
    ) -> Self {
        let scenario = build_scenario(kind, &settings, node);
        let history = DetectionHistory::new(settings.history_capacity);
        let transform = Self {
            node: node.to_string(),
            settings,
            scenario,
            history,
            slot,
        };
        transform.publish(None);
        transform
    }

    pub fn from_node(ctx: &NodeContext<'_>, kind: ScenarioKind) -> Result<Self> {
        let settings = ScenarioSettings::from_params(&ctx.params())?;
        let slot = ctx.runtime.scenarios.register(ctx.cascade, ctx.id());
        Ok(Self::new(ctx.id(), kind, settings, slot))
    }

    fn wanted(&self, label: &str) -> bool {
        self.settings.labels.is_empty() || self.settings.labels.iter().any(|l| l == label)
    }

    fn publish(&self, frame_id: Option<u64>) {
        self.slot.publish(ScenarioSnapshot {
            scenario: self.scenario.kind().as_str().to_string(),
            counters: self.scenario.counters(),
            breakdown: self.scenario.breakdown(),
            detections: self.history.counts(),
            last_frame_id: frame_id,
            updated_at: frame_id.map(|_| Utc::now()),
        });
    }
}

impl Transform for ScenarioTransform {
    fn process(&mut self, frame: &mut Frame) -> Result<Flow> {
        let threshold = self.settings.confidence_threshold;
        self.history
            .record(DetectionOutcome::classify(&frame.insights.objects, threshold));

        let mut objects = std::mem::take(&mut frame.insights.objects);
        objects.retain(|object| object.confidence >= threshold && self.wanted(&object.label));
        frame.insights.objects = objects;

        let events = self.scenario.update(&frame.insights.objects);
        for event in &events {
            log::info!(
                "{}: {} on {} (frame {})",
                self.node,
                event.kind,
                event.target,
                frame.frame_id
            );
        }

        let new_event = self.scenario.has_new_event();
        if new_event {
            self.scenario.clear_new_event();
        }
        frame.insights.scenario = Some(ScenarioInsight {
            scenario: self.scenario.kind().as_str().to_string(),
            counters: self.scenario.counters(),
            new_event,
            events,
        });

        self.publish(Some(frame.frame_id));

        if self.slot.take_reset() {
            log::info!("{}: metrics reset", self.node);
            self.scenario.reset_metrics();
            self.history.clear();
            self.publish(Some(frame.frame_id));
        }
        Ok(Flow::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ScenarioBoard;
    use crate::frame::{Bbox, Image, ObjectMeta};
    use crate::scenario::LineSpec;

    fn counting(board: &ScenarioBoard, threshold: f64) -> ScenarioTransform {
        let settings = ScenarioSettings {
            lines: vec![LineSpec {
                id: Some("door".into()),
                x1: 0.5,
                y1: 0.0,
                x2: 0.5,
                y2: 1.0,
            }],
            confidence_threshold: threshold,
            ..ScenarioSettings::default()
        };
        ScenarioTransform::new(
            "count",
            ScenarioKind::CountingLine,
            settings,
            board.register("lobby", "count"),
        )
    }

    fn frame_at(id: u64, l: f64, confidence: f64) -> Frame {
        let mut frame = Frame::new(Image::synthetic(2, 2, id), id);
        frame
            .insights
            .objects
            .push(ObjectMeta::new("person", confidence, Bbox::new(l, 0.4, 0.05, 0.05)));
        frame
    }

    #[test]
    fn crossing_sets_new_event_once_and_publishes() {
        let board = ScenarioBoard::default();
        let mut transform = counting(&board, 0.3);
        let mut flags = Vec::new();
        for (id, l) in [0.40, 0.45, 0.50, 0.55].into_iter().enumerate() {
            let mut frame = frame_at(id as u64, l, 0.9);
            transform.process(&mut frame).expect("process");
            let insight = frame.insights.scenario.expect("scenario attached");
            flags.push(insight.new_event);
        }
        assert_eq!(flags, vec![false, false, true, false]);

        let snapshot = board.get("lobby", "count").expect("published");
        assert_eq!(snapshot.scenario, "counting_line");
        assert_eq!(snapshot.counters.get("door"), Some(&1));
        assert_eq!(snapshot.detections.success, 4);
        assert_eq!(snapshot.last_frame_id, Some(3));
    }

    #[test]
    fn low_confidence_objects_are_recorded_then_removed() {
        let board = ScenarioBoard::default();
        let mut transform = counting(&board, 0.5);
        let mut frame = frame_at(0, 0.3, 0.2);
        transform.process(&mut frame).expect("process");
        assert!(frame.insights.objects.is_empty());
        let snapshot = board.get("lobby", "count").expect("published");
        assert_eq!(snapshot.detections.unidentified, 1);
    }

    #[test]
    fn reset_request_zeroes_counters() {
        let board = ScenarioBoard::default();
        let mut transform = counting(&board, 0.3);
        for (id, l) in [0.40, 0.45, 0.50].into_iter().enumerate() {
            transform.process(&mut frame_at(id as u64, l, 0.9)).expect("process");
        }
        let door = board.get("lobby", "count").and_then(|s| s.counters.get("door").copied());
        assert_eq!(door, Some(1));
        board.request_reset_all();
        transform.process(&mut frame_at(3, 0.55, 0.9)).expect("process");
        let snapshot = board.get("lobby", "count").expect("published");
        assert_eq!(snapshot.counters.get("door"), Some(&0));
        assert_eq!(snapshot.detections.success, 0);
    }

    #[test]
    fn empty_frames_keep_earlier_detection_tallies() {
        let board = ScenarioBoard::default();
        let mut transform = counting(&board, 0.3);
        for id in 0..3 {
            transform.process(&mut frame_at(id, 0.2, 0.9)).expect("process");
        }
        for id in 3..10_003 {
            let mut empty = Frame::new(Image::synthetic(2, 2, id), id);
            transform.process(&mut empty).expect("process");
        }
        let snapshot = board.get("lobby", "count").expect("published");
        assert_eq!(snapshot.detections.success, 3);
        assert_eq!(snapshot.detections.nothing, 10_000);
    }
}
