// Multi-object tracker
//
// Greedy IoU association between constant-velocity predictions and the
// current frame's detections. Tracks are kept in creation order, which makes
// matching deterministic for a given input sequence.

use crate::config::TrackerConfig;
use crate::pipeline::types::{Detection, Point, TrackedObject};
use std::collections::VecDeque;
use tracing::Span;

/// Below this speed (pixels/frame) the heading is left unchanged
const MIN_SPEED_FOR_DIRECTION: f32 = 0.1;

pub trait Tracker: Send {
    /// Advance one frame and return the confirmed tracks
    fn update(&mut self, detections: &[Detection], timestamp: u64) -> Vec<TrackedObject>;

    /// Every live track, confirmed or not
    fn tracks(&self) -> &[TrackedObject];

    fn reset(&mut self);

    /// Applies from the next `update`; existing tracks are not reclassified
    fn set_max_age(&mut self, max_age: u32);

    fn set_min_hits(&mut self, min_hits: u32);
}

pub struct IouTracker {
    max_age: u32,
    min_hits: u32,
    iou_threshold: f32,
    history_length: usize,
    next_id: u64,
    tracks: Vec<TrackedObject>,
    span: Span,
}

impl IouTracker {
    pub fn new(config: &TrackerConfig, history_length: usize, span: Span) -> Self {
        Self {
            max_age: config.max_age,
            min_hits: config.min_hits.max(1),
            iou_threshold: config.iou_threshold,
            history_length: history_length.max(2),
            next_id: 1,
            tracks: Vec::new(),
            span,
        }
    }

    /// Move every track with enough history one velocity step ahead and count a miss.
    /// Matched tracks have the miss cleared again in `apply_match`.
    fn predict(&mut self) {
        for track in &mut self.tracks {
            if track.trajectory.len() >= 2 {
                let predicted = track.position() + track.velocity;
                track.detection.bbox = track.detection.bbox.centered_at(predicted);
            }
            track.consecutive_misses += 1;
        }
    }

    /// Pairs of (track index, detection index)
    fn associate(&self, detections: &[Detection]) -> Vec<(usize, usize)> {
        let mut used = vec![false; detections.len()];
        let mut matches = Vec::new();

        for (track_idx, track) in self.tracks.iter().enumerate() {
            let mut best: Option<(usize, f32)> = None;
            for (det_idx, detection) in detections.iter().enumerate() {
                if used[det_idx] {
                    continue;
                }
                let iou = track.detection.bbox.iou(&detection.bbox);
                if iou > self.iou_threshold && best.map_or(true, |(_, b)| iou > b) {
                    best = Some((det_idx, iou));
                }
            }

            if let Some((det_idx, _)) = best {
                used[det_idx] = true;
                matches.push((track_idx, det_idx));
            }
        }

        matches
    }

    fn apply_match(&mut self, track_idx: usize, detection: &Detection, timestamp: u64) {
        let history_length = self.history_length;
        let min_hits = self.min_hits;
        let track = &mut self.tracks[track_idx];

        track.detection = detection.clone();
        track.last_updated = timestamp;
        track.consecutive_misses = 0;
        track.age += 1;

        let center = detection.center();
        track.trajectory.push_back(center);
        while track.trajectory.len() > history_length {
            track.trajectory.pop_front();
        }

        if track.trajectory.len() >= 2 {
            let n = track.trajectory.len();
            let velocity = track.trajectory[n - 1] - track.trajectory[n - 2];
            track.acceleration = velocity - track.velocity;
            track.velocity = velocity;
            track.speed = velocity.norm();
            if track.speed > MIN_SPEED_FOR_DIRECTION {
                track.direction = velocity.angle_deg();
            }
        }

        if !track.is_confirmed && track.age >= min_hits {
            track.is_confirmed = true;
            let track_id = track.track_id;
            tracing::debug!(parent: &self.span, track_id, "Track confirmed");
        }
    }

    fn spawn(&mut self, detection: &Detection, timestamp: u64) {
        let track_id = self.next_id;
        self.next_id += 1;

        let mut trajectory = VecDeque::with_capacity(self.history_length);
        trajectory.push_back(detection.center());

        self.tracks.push(TrackedObject {
            track_id,
            detection: detection.clone(),
            trajectory,
            velocity: Point::default(),
            acceleration: Point::default(),
            speed: 0.0,
            direction: 0.0,
            age: 1,
            consecutive_misses: 0,
            is_confirmed: false,
            first_seen: timestamp,
            last_updated: timestamp,
        });
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: &[Detection], timestamp: u64) -> Vec<TrackedObject> {
        self.predict();

        let matches = self.associate(detections);
        let mut matched_detections = vec![false; detections.len()];
        for (track_idx, det_idx) in matches {
            self.apply_match(track_idx, &detections[det_idx], timestamp);
            matched_detections[det_idx] = true;
        }

        for (det_idx, detection) in detections.iter().enumerate() {
            if !matched_detections[det_idx] {
                self.spawn(detection, timestamp);
            }
        }

        let max_age = self.max_age;
        let before = self.tracks.len();
        self.tracks.retain(|t| t.consecutive_misses <= max_age);
        let removed = before - self.tracks.len();
        if removed > 0 {
            tracing::debug!(parent: &self.span, removed, "Dropped stale tracks");
        }

        self.tracks
            .iter()
            .filter(|t| t.is_confirmed)
            .cloned()
            .collect()
    }

    fn tracks(&self) -> &[TrackedObject] {
        &self.tracks
    }

    fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }

    fn set_max_age(&mut self, max_age: u32) {
        self.max_age = max_age;
    }

    fn set_min_hits(&mut self, min_hits: u32) {
        self.min_hits = min_hits.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{BBox, ObjectClass};

    fn tracker(max_age: u32, min_hits: u32) -> IouTracker {
        let config = TrackerConfig {
            max_age,
            min_hits,
            iou_threshold: 0.3,
        };
        IouTracker::new(&config, 30, Span::none())
    }

    fn det(x: f32, y: f32) -> Detection {
        Detection::new(
            ObjectClass::Pedestrian,
            0.9,
            BBox::new(x, y, 40.0, 80.0),
            0,
        )
    }

    #[test]
    fn test_track_confirms_after_min_hits() {
        let mut t = tracker(30, 3);
        assert!(t.update(&[det(100.0, 100.0)], 0).is_empty());
        assert!(t.update(&[det(102.0, 100.0)], 33).is_empty());
        let confirmed = t.update(&[det(104.0, 100.0)], 66);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].track_id, 1);
        assert_eq!(confirmed[0].age, 3);
        assert_eq!(confirmed[0].trajectory.len(), 3);
        assert_eq!(confirmed[0].first_seen, 0);
        assert_eq!(confirmed[0].last_updated, 66);
    }

    #[test]
    fn test_confirmation_is_sticky() {
        let mut t = tracker(30, 2);
        t.update(&[det(100.0, 100.0)], 0);
        t.update(&[det(100.0, 100.0)], 1);
        // Misses do not revoke confirmation
        t.update(&[], 2);
        assert!(t.tracks()[0].is_confirmed);
        let out = t.update(&[det(100.0, 100.0)], 3);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let mut t = tracker(30, 1);
        t.update(&[det(0.0, 0.0), det(300.0, 0.0), det(600.0, 0.0)], 0);
        let ids: Vec<u64> = t.tracks().iter().map(|o| o.track_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        t.update(&[det(0.0, 300.0)], 1);
        let ids: Vec<u64> = t.tracks().iter().map(|o| o.track_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_spawned_track_is_unconfirmed_even_with_min_hits_one() {
        let mut t = tracker(30, 1);
        assert!(t.update(&[det(100.0, 100.0)], 0).is_empty());
        assert!(!t.tracks()[0].is_confirmed);

        // The first successful match confirms it
        let out = t.update(&[det(101.0, 100.0)], 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].age, 2);
    }

    #[test]
    fn test_threshold_changes_apply_to_later_updates_only() {
        let config = TrackerConfig {
            max_age: 1,
            min_hits: 5,
            iou_threshold: 0.3,
        };
        let mut t: Box<dyn Tracker> = Box::new(IouTracker::new(&config, 30, Span::none()));
        t.update(&[det(100.0, 100.0)], 0);
        t.update(&[det(100.0, 100.0)], 1);
        assert!(!t.tracks()[0].is_confirmed);

        t.set_min_hits(2);
        assert!(!t.tracks()[0].is_confirmed, "lowering min_hits is not retroactive");
        let out = t.update(&[det(100.0, 100.0)], 2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 1);

        // One miss already counted against max_age = 1
        t.update(&[], 3);
        assert_eq!(t.tracks()[0].consecutive_misses, 1);
        t.set_max_age(3);
        t.update(&[], 4);
        t.update(&[], 5);
        assert_eq!(t.tracks().len(), 1, "raised max_age keeps the missing track");
        t.update(&[], 6);
        assert!(t.tracks().is_empty());
    }

    #[test]
    fn test_track_survives_max_age_misses_then_drops() {
        let mut t = tracker(2, 1);
        t.update(&[det(100.0, 100.0)], 0);
        t.update(&[], 1);
        t.update(&[], 2);
        assert_eq!(t.tracks().len(), 1, "exactly max_age misses keeps the track");
        t.update(&[], 3);
        assert!(t.tracks().is_empty(), "max_age + 1 misses removes it");
    }

    #[test]
    fn test_velocity_acceleration_and_direction() {
        let mut t = tracker(30, 1);
        t.update(&[det(100.0, 100.0)], 0);
        t.update(&[det(104.0, 100.0)], 1);
        let out = t.update(&[det(110.0, 100.0)], 2);
        let track = &out[0];
        assert_eq!(track.velocity, Point::new(6.0, 0.0));
        assert_eq!(track.acceleration, Point::new(2.0, 0.0));
        assert!((track.speed - 6.0).abs() < 1e-6);
        assert!(track.direction.abs() < 1e-6);

        // Stationary update keeps the previous heading
        let out = t.update(&[det(110.0, 100.0)], 3);
        assert_eq!(out[0].speed, 0.0);
        assert!(out[0].direction.abs() < 1e-6);
    }

    #[test]
    fn test_trajectory_is_capped() {
        let config = TrackerConfig {
            max_age: 30,
            min_hits: 1,
            iou_threshold: 0.3,
        };
        let mut t = IouTracker::new(&config, 4, Span::none());
        for i in 0..10 {
            t.update(&[det(100.0 + i as f32, 100.0)], i);
        }
        let track = &t.tracks()[0];
        assert_eq!(track.trajectory.len(), 4);
        assert_eq!(track.trajectory.back().map(|p| p.x), Some(129.0));
    }

    #[test]
    fn test_greedy_matching_is_deterministic() {
        let run = || {
            let mut t = tracker(30, 1);
            t.update(&[det(100.0, 100.0), det(120.0, 100.0)], 0);
            let out = t.update(&[det(118.0, 100.0), det(102.0, 100.0)], 1);
            out.iter()
                .map(|o| (o.track_id, o.detection.bbox.x as i32))
                .collect::<Vec<_>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert_eq!(first, vec![(1, 102), (2, 118)]);
    }

    #[test]
    fn test_low_overlap_spawns_new_track() {
        let mut t = tracker(30, 1);
        t.update(&[det(100.0, 100.0)], 0);
        // Shifted by most of its width: IoU well below 0.3
        let out = t.update(&[det(135.0, 100.0)], 1);
        assert_eq!(t.tracks().len(), 2);
        assert!(out.is_empty(), "neither track has been matched yet");
        assert_eq!(t.tracks()[0].consecutive_misses, 1);
        assert_eq!(t.tracks()[1].track_id, 2);
    }

    #[test]
    fn test_reset_restarts_ids() {
        let mut t = tracker(30, 1);
        t.update(&[det(0.0, 0.0)], 0);
        t.reset();
        assert!(t.tracks().is_empty());
        t.update(&[det(0.0, 0.0)], 1);
        assert_eq!(t.tracks()[0].track_id, 1);
    }
}
