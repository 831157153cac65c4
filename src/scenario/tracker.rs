//! Greedy nearest-centroid association.
//!
//! Every frame, candidate pairs `(track, detection)` with the same label and a
//! centroid distance within `max_distance` are sorted by
//! `(distance, track id, detection index)` and accepted greedily. Unmatched
//! detections open new tracks; tracks unmatched for more than `max_missed`
//! frames expire. The same input sequence always yields the same ids.

use crate::frame::ObjectMeta;

use super::geometry::Point;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    pub max_distance: f64,
    pub max_missed: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_distance: 0.1,
            max_missed: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: u64,
    pub label: String,
    pub center: Point,
    pub missed: u32,
}

/// Where a tracked object was last frame and where it is now.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub track_id: u64,
    pub object_index: usize,
    pub label: String,
    pub previous: Option<Point>,
    pub current: Point,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackUpdate {
    /// In detection order.
    pub observations: Vec<Observation>,
    pub expired: Vec<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 0;
    }

    pub fn update(&mut self, objects: &[ObjectMeta]) -> TrackUpdate {
        let centers: Vec<Point> = objects.iter().map(|o| Point::from(o.bbox.center())).collect();

        let mut candidates: Vec<(f64, u64, usize, usize)> = Vec::new();
        for (t_idx, track) in self.tracks.iter().enumerate() {
            for (d_idx, object) in objects.iter().enumerate() {
                if object.label != track.label {
                    continue;
                }
                let distance = track.center.distance(&centers[d_idx]);
                if distance <= self.config.max_distance {
                    candidates.push((distance, track.id, t_idx, d_idx));
                }
            }
        }
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.3.cmp(&b.3))
        });

        let mut track_taken = vec![false; self.tracks.len()];
        let mut detection_track: Vec<Option<usize>> = vec![None; objects.len()];
        for (_, _, t_idx, d_idx) in candidates {
            if track_taken[t_idx] || detection_track[d_idx].is_some() {
                continue;
            }
            track_taken[t_idx] = true;
            detection_track[d_idx] = Some(t_idx);
        }

        let mut observations = Vec::with_capacity(objects.len());
        let mut opened = Vec::new();
        for (d_idx, object) in objects.iter().enumerate() {
            let current = centers[d_idx];
            match detection_track[d_idx] {
                Some(t_idx) => {
                    let track = &mut self.tracks[t_idx];
                    let previous = track.center;
                    track.center = current;
                    track.missed = 0;
                    observations.push(Observation {
                        track_id: track.id,
                        object_index: d_idx,
                        label: object.label.clone(),
                        previous: Some(previous),
                        current,
                    });
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    opened.push(Track {
                        id,
                        label: object.label.clone(),
                        center: current,
                        missed: 0,
                    });
                    observations.push(Observation {
                        track_id: id,
                        object_index: d_idx,
                        label: object.label.clone(),
                        previous: None,
                        current,
                    });
                }
            }
        }

        let mut expired = Vec::new();
        let max_missed = self.config.max_missed;
        let mut idx = 0;
        self.tracks.retain_mut(|track| {
            let matched = track_taken[idx];
            idx += 1;
            if matched {
                return true;
            }
            track.missed += 1;
            if track.missed > max_missed {
                expired.push(track.id);
                false
            } else {
                true
            }
        });
        self.tracks.extend(opened);

        TrackUpdate {
            observations,
            expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Bbox;

    fn obj(label: &str, cx: f64, cy: f64) -> ObjectMeta {
        ObjectMeta::new(label, 0.9, Bbox::new(cx - 0.025, cy - 0.025, 0.05, 0.05))
    }

    #[test]
    fn steady_motion_keeps_track_id() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let mut ids = Vec::new();
        for step in 0..20 {
            let update = tracker.update(&[obj("person", 0.1 + step as f64 * 0.04, 0.5)]);
            ids.push(update.observations[0].track_id);
        }
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn jump_beyond_distance_opens_new_track() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let first = tracker.update(&[obj("person", 0.1, 0.1)]);
        let second = tracker.update(&[obj("person", 0.8, 0.8)]);
        assert_ne!(first.observations[0].track_id, second.observations[0].track_id);
        assert_eq!(second.observations[0].previous, None);
    }

    #[test]
    fn labels_never_share_a_track() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        tracker.update(&[obj("person", 0.5, 0.5)]);
        let update = tracker.update(&[obj("car", 0.5, 0.5)]);
        assert_eq!(update.observations[0].track_id, 1);
    }

    #[test]
    fn closest_pair_wins() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        tracker.update(&[obj("person", 0.30, 0.5), obj("person", 0.40, 0.5)]);
        // Both detections drift right; each must stay with its own track.
        let update = tracker.update(&[obj("person", 0.43, 0.5), obj("person", 0.33, 0.5)]);
        assert_eq!(update.observations[0].track_id, 1);
        assert_eq!(update.observations[1].track_id, 0);
    }

    #[test]
    fn unmatched_tracks_expire_after_max_missed() {
        let mut tracker = Tracker::new(TrackerConfig {
            max_distance: 0.1,
            max_missed: 2,
        });
        tracker.update(&[obj("person", 0.5, 0.5)]);
        assert!(tracker.update(&[]).expired.is_empty());
        assert!(tracker.update(&[]).expired.is_empty());
        assert_eq!(tracker.update(&[]).expired, vec![0]);
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn identical_inputs_give_identical_ids() {
        let frames: Vec<Vec<ObjectMeta>> = (0..10)
            .map(|i| {
                vec![
                    obj("person", 0.2 + i as f64 * 0.03, 0.3),
                    obj("person", 0.8 - i as f64 * 0.03, 0.3),
                ]
            })
            .collect();
        let run = || {
            let mut tracker = Tracker::new(TrackerConfig::default());
            frames
                .iter()
                .map(|f| {
                    tracker
                        .update(f)
                        .observations
                        .iter()
                        .map(|o| o.track_id)
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
