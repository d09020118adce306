//! Long-term stationarity ("nest") detection.
//!
//! Continuity is re-derived from spatial proximity in map coordinates rather
//! than trusted from the upstream tracker, whose identities may churn over an
//! hour of footage.

use crate::config::NestSettings;
use crate::{distance, BBox, Detection};

/// Ground point of a box projected to 0..100 map units on both axes.
pub fn map_position(bbox: &BBox, width: u32, height: u32) -> (f32, f32) {
    let (cx, bottom) = bbox.bottom_center();
    let w = width.max(1) as f32;
    let h = height.max(1) as f32;
    (cx / w * 100.0, bottom / h * 100.0)
}

#[derive(Clone, Debug, PartialEq)]
pub struct NestTrack {
    pub id: u64,
    pub start_pos: (f32, f32),
    pub last_pos: (f32, f32),
    pub first_seen: f64,
    pub last_seen: f64,
    pub is_nest: bool,
}

impl NestTrack {
    fn new(id: u64, pos: (f32, f32), timestamp: f64) -> Self {
        Self {
            id,
            start_pos: pos,
            last_pos: pos,
            first_seen: timestamp,
            last_seen: timestamp,
            is_nest: false,
        }
    }

    pub fn displacement(&self) -> f32 {
        distance(self.start_pos, self.last_pos)
    }

    pub fn duration(&self) -> f64 {
        self.last_seen - self.first_seen
    }
}

pub struct NestDetector {
    settings: NestSettings,
    tracks: Vec<NestTrack>,
    next_id: u64,
}

impl NestDetector {
    pub fn new(settings: NestSettings) -> Self {
        Self {
            settings,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn tracks(&self) -> &[NestTrack] {
        &self.tracks
    }

    pub fn nests(&self) -> impl Iterator<Item = &NestTrack> {
        self.tracks.iter().filter(|track| track.is_nest)
    }

    /// Associates a single detection; see [`NestDetector::associate_frame`].
    pub fn associate(&mut self, detection: Detection, width: u32, height: u32, timestamp: f64) -> Detection {
        self.collect_garbage(timestamp);
        let mut claimed = vec![false; self.tracks.len()];
        self.associate_one(detection, width, height, timestamp, &mut claimed)
    }

    /// Matches every watched-class detection of one frame to a track and
    /// returns the detections with confirmed nests retyped.
    ///
    /// A track is claimed by at most one detection per frame. Stale tracks
    /// are collected before matching so they never absorb a new entity.
    pub fn associate_frame(
        &mut self,
        detections: Vec<Detection>,
        width: u32,
        height: u32,
        timestamp: f64,
    ) -> Vec<Detection> {
        self.collect_garbage(timestamp);
        let mut claimed = vec![false; self.tracks.len()];
        let mut surfaced = Vec::with_capacity(detections.len());
        for detection in detections {
            surfaced.push(self.associate_one(detection, width, height, timestamp, &mut claimed));
        }
        surfaced
    }

    fn associate_one(
        &mut self,
        mut detection: Detection,
        width: u32,
        height: u32,
        timestamp: f64,
        claimed: &mut Vec<bool>,
    ) -> Detection {
        if detection.class != self.settings.watched_class {
            return detection;
        }
        let pos = map_position(&detection.bbox, width, height);
        let index = match self.nearest_unclaimed(pos, claimed) {
            Some(index) => {
                self.update_track(index, pos, timestamp);
                index
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.tracks.push(NestTrack::new(id, pos, timestamp));
                claimed.push(false);
                self.tracks.len() - 1
            }
        };
        claimed[index] = true;
        if self.tracks[index].is_nest {
            detection.class = self.settings.nest_label.clone();
        }
        detection
    }

    /// Drops tracks unseen for longer than the inactivity window.
    pub fn collect_garbage(&mut self, now: f64) -> usize {
        let limit = self.settings.inactivity_secs;
        let before = self.tracks.len();
        self.tracks.retain(|track| {
            let keep = now - track.last_seen <= limit;
            if !keep && track.is_nest {
                log::info!("nest track {} expired after inactivity", track.id);
            }
            keep
        });
        before - self.tracks.len()
    }

    fn nearest_unclaimed(&self, pos: (f32, f32), claimed: &[bool]) -> Option<usize> {
        self.tracks
            .iter()
            .enumerate()
            .filter(|(index, _)| !claimed[*index])
            .map(|(index, track)| (index, distance(track.last_pos, pos)))
            .filter(|(_, d)| *d < self.settings.match_radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(index, _)| index)
    }

    fn update_track(&mut self, index: usize, pos: (f32, f32), timestamp: f64) {
        let settings = &self.settings;
        let track = &mut self.tracks[index];
        track.last_pos = pos;
        track.last_seen = timestamp;

        if track.displacement() > settings.movement_limit {
            if track.is_nest {
                log::info!("nest track {} resumed moving; demoted", track.id);
            }
            // Stationarity must be re-earned from here.
            track.is_nest = false;
            track.start_pos = pos;
            track.first_seen = timestamp;
        } else if !track.is_nest && track.duration() >= settings.stationary_secs {
            track.is_nest = true;
            log::info!(
                "nest track {} promoted after {:.0}s stationary at ({:.1}, {:.1})",
                track.id,
                track.duration(),
                track.start_pos.0,
                track.start_pos.1
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrackIdentity;

    fn settings() -> NestSettings {
        NestSettings {
            stationary_secs: 60.0,
            ..NestSettings::default()
        }
    }

    // 1000x1000 frame: one map unit is 10px.
    fn turtle_at(x: f32, y: f32) -> Detection {
        Detection {
            bbox: BBox::new(x - 20.0, y - 40.0, x + 20.0, y),
            class: "turtle".to_string(),
            score: 0.9,
            source: "species".to_string(),
            track: TrackIdentity::Synthetic(0),
        }
    }

    #[test]
    fn map_position_uses_bottom_center() {
        let pos = map_position(&BBox::new(100.0, 100.0, 200.0, 300.0), 1000, 600);
        assert!((pos.0 - 15.0).abs() < 1e-4);
        assert!((pos.1 - 50.0).abs() < 1e-4);
    }

    #[test]
    fn stationary_turtle_becomes_nest() {
        let mut detector = NestDetector::new(settings());
        for t in 0..60 {
            let out = detector.associate(turtle_at(500.0, 500.0), 1000, 1000, t as f64);
            assert_eq!(out.class, "turtle");
        }
        let out = detector.associate(turtle_at(500.0, 500.0), 1000, 1000, 60.0);
        assert_eq!(out.class, "nest");
        assert_eq!(detector.nests().count(), 1);
    }

    #[test]
    fn displacement_violation_resets_and_requires_full_duration() {
        let mut detector = NestDetector::new(settings());
        for t in 0..=60 {
            detector.associate(turtle_at(500.0, 500.0), 1000, 1000, t as f64);
        }
        assert_eq!(detector.nests().count(), 1);

        // 3 map units (> limit 2, < radius 5): demoted, re-seeded.
        let out = detector.associate(turtle_at(530.0, 500.0), 1000, 1000, 61.0);
        assert_eq!(out.class, "turtle");
        assert_eq!(detector.nests().count(), 0);

        // Back near the old spot: still not a nest until a full duration passes.
        for t in 62..121 {
            let out = detector.associate(turtle_at(515.0, 500.0), 1000, 1000, t as f64);
            assert_eq!(out.class, "turtle", "promoted early at t={}", t);
        }
        let out = detector.associate(turtle_at(515.0, 500.0), 1000, 1000, 121.0);
        assert_eq!(out.class, "nest");
        assert_eq!(detector.tracks().len(), 1);
    }

    #[test]
    fn inactive_tracks_are_collected() {
        let mut detector = NestDetector::new(settings());
        detector.associate(turtle_at(500.0, 500.0), 1000, 1000, 0.0);
        detector.associate(turtle_at(500.0, 500.0), 1000, 1000, 10.0);
        // The first track expired (unseen 10s > 5s) before matching.
        assert_eq!(detector.tracks().len(), 1);
        assert_eq!(detector.tracks()[0].id, 2);
    }

    #[test]
    fn two_turtles_in_one_frame_get_two_tracks() {
        let mut detector = NestDetector::new(settings());
        let frame = vec![turtle_at(500.0, 500.0), turtle_at(510.0, 500.0)];
        detector.associate_frame(frame.clone(), 1000, 1000, 0.0);
        assert_eq!(detector.tracks().len(), 2);
        detector.associate_frame(frame, 1000, 1000, 1.0);
        assert_eq!(detector.tracks().len(), 2);
    }

    #[test]
    fn other_classes_pass_through() {
        let mut detector = NestDetector::new(settings());
        let mut det = turtle_at(500.0, 500.0);
        det.class = "predator".to_string();
        let out = detector.associate(det.clone(), 1000, 1000, 0.0);
        assert_eq!(out, det);
        assert!(detector.tracks().is_empty());
    }
}
