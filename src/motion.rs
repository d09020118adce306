//! Per-track motion history and instantaneous behavior classification.
//!
//! One `MotionHistoryStore` belongs to one scene. Tracks are keyed by
//! `TrackIdentity`; synthetic identities are accepted but only give
//! frame-local continuity.

use std::collections::{HashMap, VecDeque};

use crate::config::BehaviorSettings;
use crate::{distance, Status, TrackIdentity};

/// Interior rectangle of a frame. Positions outside it are "at the wall".
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SafeZone {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl SafeZone {
    pub fn inset(width: u32, height: u32, margin: f32) -> Self {
        Self {
            x1: margin,
            y1: margin,
            x2: width as f32 - margin,
            y2: height as f32 - margin,
        }
    }

    /// Boundary counts as inside.
    pub fn contains(&self, (x, y): (f32, f32)) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }
}

#[derive(Clone, Debug)]
pub struct Track {
    positions: VecDeque<(f32, f32)>,
    capacity: usize,
    last_seen: f64,
}

impl Track {
    fn new(capacity: usize) -> Self {
        Self {
            positions: VecDeque::with_capacity(capacity),
            capacity,
            last_seen: 0.0,
        }
    }

    fn push(&mut self, position: (f32, f32), now: f64) {
        if self.positions.len() == self.capacity {
            self.positions.pop_front();
        }
        self.positions.push_back(position);
        self.last_seen = now;
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn last_seen(&self) -> f64 {
        self.last_seen
    }

    /// Sum of Euclidean deltas between consecutive samples, in pixels.
    pub fn path_length(&self) -> f32 {
        self.positions
            .iter()
            .zip(self.positions.iter().skip(1))
            .map(|(a, b)| distance(*a, *b))
            .sum()
    }
}

/// Pure decision policy over a track's accumulated history.
#[derive(Clone, Debug)]
pub struct BehaviorClassifier {
    settings: BehaviorSettings,
}

impl BehaviorClassifier {
    pub fn new(settings: BehaviorSettings) -> Self {
        Self { settings }
    }

    /// Speed over the buffered history in body lengths per second.
    pub fn normalized_speed(&self, track: &Track, box_dims: (f32, f32), fps: f32) -> f32 {
        let s = &self.settings;
        let fps = if fps.is_finite() && fps > 0.0 {
            fps
        } else {
            s.default_fps
        };
        let span_secs = track.len().max(1) as f32 / fps;
        let speed = (track.path_length() / s.pixels_per_unit) / span_secs;
        let body_length = (box_dims.0.max(box_dims.1) / s.pixels_per_unit).max(s.body_length_floor);
        speed / body_length
    }

    pub fn classify(
        &self,
        track: &Track,
        position: (f32, f32),
        box_dims: (f32, f32),
        zone: &SafeZone,
        fps: f32,
    ) -> Status {
        if track.len() < self.settings.min_samples {
            return Status::Analyzing;
        }
        if self.normalized_speed(track, box_dims, fps) > self.settings.activity_threshold {
            return Status::Normal;
        }
        if !zone.contains(position) {
            // Resting against the wall is not distress.
            return Status::Normal;
        }
        Status::Floater
    }
}

pub struct MotionHistoryStore {
    settings: BehaviorSettings,
    classifier: BehaviorClassifier,
    tracks: HashMap<TrackIdentity, Track>,
}

impl MotionHistoryStore {
    pub fn new(settings: BehaviorSettings) -> Self {
        Self {
            classifier: BehaviorClassifier::new(settings.clone()),
            settings,
            tracks: HashMap::new(),
        }
    }

    /// Appends `position` to the track's history and classifies it.
    pub fn update(
        &mut self,
        track: TrackIdentity,
        position: (f32, f32),
        box_dims: (f32, f32),
        zone: &SafeZone,
        fps: f32,
        now: f64,
    ) -> Status {
        let capacity = self.settings.history_capacity;
        let entry = self
            .tracks
            .entry(track)
            .or_insert_with(|| Track::new(capacity));
        entry.push(position, now);
        self.classifier.classify(entry, position, box_dims, zone, fps)
    }

    /// Drops tracks unseen for longer than the configured TTL.
    pub fn prune(&mut self, now: f64) -> usize {
        let ttl = self.settings.track_ttl_secs;
        let before = self.tracks.len();
        self.tracks.retain(|_, track| now - track.last_seen() <= ttl);
        before - self.tracks.len()
    }

    pub fn track(&self, id: &TrackIdentity) -> Option<&Track> {
        self.tracks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: SafeZone = SafeZone {
        x1: 100.0,
        y1: 100.0,
        x2: 540.0,
        y2: 380.0,
    };

    fn store() -> MotionHistoryStore {
        MotionHistoryStore::new(BehaviorSettings::default())
    }

    #[test]
    fn short_history_is_analyzing_regardless_of_motion() {
        let mut store = store();
        let id = TrackIdentity::Stable(1);
        for i in 0..9 {
            // Large jumps every frame: would be Normal if classified.
            let status = store.update(id, (i as f32 * 50.0, 240.0), (40.0, 40.0), &ZONE, 30.0, 0.0);
            assert_eq!(status, Status::Analyzing);
        }
        let status = store.update(id, (320.0, 240.0), (40.0, 40.0), &ZONE, 30.0, 0.0);
        assert_ne!(status, Status::Analyzing);
    }

    #[test]
    fn stationary_central_track_is_floater() {
        let mut store = store();
        let id = TrackIdentity::Stable(1);
        let mut status = Status::Analyzing;
        for _ in 0..12 {
            status = store.update(id, (320.0, 240.0), (40.0, 40.0), &ZONE, 30.0, 0.0);
        }
        assert_eq!(status, Status::Floater);
    }

    #[test]
    fn stationary_track_at_wall_is_normal() {
        let mut store = store();
        let id = TrackIdentity::Stable(1);
        let mut status = Status::Analyzing;
        for _ in 0..12 {
            status = store.update(id, (50.0, 240.0), (40.0, 40.0), &ZONE, 30.0, 0.0);
        }
        assert_eq!(status, Status::Normal);
    }

    #[test]
    fn fast_central_track_is_normal() {
        let mut store = store();
        let id = TrackIdentity::Stable(1);
        let mut status = Status::Analyzing;
        for i in 0..12 {
            let x = 300.0 + if i % 2 == 0 { 0.0 } else { 20.0 };
            status = store.update(id, (x, 240.0), (40.0, 40.0), &ZONE, 30.0, 0.0);
        }
        // 220px path over 0.4s = 22 u/s, body length 1.6u -> ~13.8 BL/s.
        assert_eq!(status, Status::Normal);
    }

    #[test]
    fn history_is_bounded() {
        let mut store = store();
        let id = TrackIdentity::Synthetic(0);
        for i in 0..200 {
            store.update(id, (i as f32, 0.0), (10.0, 10.0), &ZONE, 30.0, 0.0);
        }
        assert_eq!(store.track(&id).unwrap().len(), 60);
    }

    #[test]
    fn tiny_boxes_use_the_body_length_floor() {
        let classifier = BehaviorClassifier::new(BehaviorSettings::default());
        let mut track = Track::new(60);
        track.push((0.0, 0.0), 0.0);
        track.push((25.0, 0.0), 0.0);
        // 1 unit over 2 samples at 30 fps = 15 u/s; floor 0.1 -> 150 BL/s.
        let speed = classifier.normalized_speed(&track, (0.0, 0.0), 30.0);
        assert!((speed - 150.0).abs() < 1e-3);
    }

    #[test]
    fn prune_drops_stale_tracks() {
        let mut store = store();
        store.update(TrackIdentity::Stable(1), (1.0, 1.0), (1.0, 1.0), &ZONE, 30.0, 0.0);
        store.update(TrackIdentity::Stable(2), (1.0, 1.0), (1.0, 1.0), &ZONE, 30.0, 25.0);
        assert_eq!(store.prune(40.0), 1);
        assert!(store.track(&TrackIdentity::Stable(1)).is_none());
        assert_eq!(store.len(), 1);
    }
}
