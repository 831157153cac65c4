//! Fixed-capacity detection history.

use serde::Serialize;
use std::collections::VecDeque;

use crate::frame::ObjectMeta;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionOutcome {
    /// At least one detection at or above the threshold.
    Success,
    /// Detections present, all below the threshold.
    Unidentified,
    Nothing,
}

impl DetectionOutcome {
    pub fn classify(objects: &[ObjectMeta], threshold: f64) -> Self {
        if objects.iter().any(|o| o.confidence >= threshold) {
            DetectionOutcome::Success
        } else if objects.is_empty() {
            DetectionOutcome::Nothing
        } else {
            DetectionOutcome::Unidentified
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HistoryCounts {
    pub success: u64,
    pub unidentified: u64,
    /// Empty frames seen since the last reset. Not part of the ring.
    pub nothing: u64,
    pub capacity: u64,
}

/// Ring of the most recent success/unidentified outcomes plus running tallies.
/// When full, the oldest entry's tally is decremented before the new one is
/// incremented. Empty frames only bump `nothing`, so an idle camera never
/// evicts real detections.
#[derive(Clone, Debug)]
pub struct DetectionHistory {
    capacity: usize,
    ring: VecDeque<DetectionOutcome>,
    counts: HistoryCounts,
}

impl Default for DetectionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl DetectionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: VecDeque::with_capacity(capacity),
            counts: HistoryCounts {
                capacity: capacity as u64,
                ..HistoryCounts::default()
            },
        }
    }

    pub fn record(&mut self, outcome: DetectionOutcome) {
        if outcome == DetectionOutcome::Nothing {
            self.counts.nothing += 1;
            return;
        }
        if self.ring.len() == self.capacity {
            if let Some(oldest) = self.ring.pop_front() {
                *self.tally(oldest) -= 1;
            }
        }
        *self.tally(outcome) += 1;
        self.ring.push_back(outcome);
    }

    fn tally(&mut self, outcome: DetectionOutcome) -> &mut u64 {
        match outcome {
            DetectionOutcome::Success => &mut self.counts.success,
            DetectionOutcome::Unidentified => &mut self.counts.unidentified,
            DetectionOutcome::Nothing => &mut self.counts.nothing,
        }
    }

    pub fn counts(&self) -> HistoryCounts {
        self.counts
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.counts = HistoryCounts {
            capacity: self.capacity as u64,
            ..HistoryCounts::default()
        };
    }
}
