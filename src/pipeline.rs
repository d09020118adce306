//! One scene's analytics stages wired together.
//!
//! A `ScenePipeline` is owned by exactly one worker; nothing in it is shared
//! with other scenes except the `AlertManager`.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::alerts::AlertManager;
use crate::config::SentinelConfig;
use crate::confirm::{AlertRequest, ConfirmationAggregator};
use crate::dedupe::CrossSourceDeduplicator;
use crate::motion::{MotionHistoryStore, SafeZone};
use crate::nest::{NestDetector, NestTrack};
use crate::threat::ThreatMonitor;
use crate::{Detection, FrameDetections, SceneState, Status, TrackIdentity};

/// Everything produced by one processed frame.
#[derive(Clone, Debug)]
pub struct FrameReport {
    pub state: SceneState,
    /// Deduplicated detections, with confirmed nests retyped.
    pub detections: Vec<Detection>,
    /// Instantaneous behavior per detection, in `detections` order.
    pub statuses: Vec<(TrackIdentity, Status)>,
    pub alerts_emitted: usize,
}

pub struct ScenePipeline {
    scene_id: String,
    wall_margin: f32,
    default_fps: f32,
    dedupe: CrossSourceDeduplicator,
    motion: MotionHistoryStore,
    confirm: ConfirmationAggregator,
    nests: NestDetector,
    threats: ThreatMonitor,
    alerts: Arc<AlertManager>,
    state: SceneState,
    degraded: bool,
    frame_skip: u64,
    frames_offered: u64,
}

impl ScenePipeline {
    pub fn new(scene_id: &str, config: &SentinelConfig, alerts: Arc<AlertManager>) -> Self {
        Self {
            scene_id: scene_id.to_string(),
            wall_margin: config.behavior.wall_margin,
            default_fps: config.behavior.default_fps,
            dedupe: CrossSourceDeduplicator::new(config.dedupe_iou_threshold),
            motion: MotionHistoryStore::new(config.behavior.clone()),
            confirm: ConfirmationAggregator::new(config.confirmation.clone()),
            nests: NestDetector::new(config.nest.clone()),
            threats: ThreatMonitor::new(config.threat.clone()),
            alerts,
            state: SceneState::initializing(scene_id),
            degraded: false,
            frame_skip: u64::from(config.pipeline.frame_skip.max(1)),
            frames_offered: 0,
        }
    }

    pub fn state(&self) -> &SceneState {
        &self.state
    }

    pub fn nest_tracks(&self) -> &[NestTrack] {
        self.nests.tracks()
    }

    /// Frames handed to `offer`, processed or skipped.
    pub fn frames_offered(&self) -> u64 {
        self.frames_offered
    }

    /// Processes every Kth offered frame (`pipeline.frame_skip`).
    ///
    /// Skipped frames touch no state, so the confirmation window still
    /// counts processed frames only.
    pub fn offer(&mut self, frame: &FrameDetections) -> Option<FrameReport> {
        let admit = self.frames_offered % self.frame_skip == 0;
        self.frames_offered += 1;
        if admit {
            Some(self.process_frame(frame))
        } else {
            None
        }
    }

    pub fn process_frame(&mut self, frame: &FrameDetections) -> FrameReport {
        let fps = if frame.fps.is_finite() && frame.fps > 0.0 {
            frame.fps
        } else {
            self.default_fps
        };

        let detections = self.dedupe.dedupe(frame.detections());
        if !self.degraded && detections.iter().any(|d| !d.track.is_stable()) {
            self.degraded = true;
            log::warn!(
                "scene {}: detections without tracker ids; using frame-local ids (no track continuity)",
                self.scene_id
            );
        }

        let zone = SafeZone::inset(frame.width, frame.height, self.wall_margin);
        let mut species = BTreeSet::new();
        let mut statuses = Vec::with_capacity(detections.len());
        for detection in &detections {
            let status = self.motion.update(
                detection.track,
                detection.bbox.center(),
                (detection.bbox.width(), detection.bbox.height()),
                &zone,
                fps,
                frame.timestamp,
            );
            statuses.push((detection.track, status));
            species.insert(detection.class.clone());
        }
        self.motion.prune(frame.timestamp);

        let frame_statuses: Vec<Status> = statuses.iter().map(|(_, status)| *status).collect();
        let update = self.confirm.observe(species, &frame_statuses);
        let mut alerts_emitted = self.raise(&update.alerts);

        let surfaced = self
            .nests
            .associate_frame(detections, frame.width, frame.height, frame.timestamp);
        let nests: Vec<NestTrack> = self.nests.nests().cloned().collect();
        let threats = self
            .threats
            .observe(&surfaced, &nests, frame.width, frame.height, frame.timestamp);
        alerts_emitted += self.raise(&threats);

        self.state = SceneState {
            scene_id: self.scene_id.clone(),
            status: update.status,
            health: update.health,
            species: update.species_label(),
            confirmed_species: if update.confirmed {
                update.species.clone()
            } else {
                Vec::new()
            },
            error: None,
            frames_processed: self.state.frames_processed + 1,
            nests: nests.len(),
        };

        FrameReport {
            state: self.state.clone(),
            detections: surfaced,
            statuses,
            alerts_emitted,
        }
    }

    fn raise(&self, requests: &[AlertRequest]) -> usize {
        requests
            .iter()
            .filter(|request| {
                self.alerts
                    .trigger(&self.scene_id, request.kind, &request.message)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertKind, ManualClock};
    use crate::{BBox, Health, RawDetection};
    use std::time::Duration;

    fn pipeline(config: &SentinelConfig) -> (ScenePipeline, Arc<AlertManager>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
        let alerts = Arc::new(AlertManager::with_clock(&config.alerts, clock));
        (ScenePipeline::new("tankA", config, alerts.clone()), alerts)
    }

    fn frame(t: f64, detections: Vec<RawDetection>) -> FrameDetections {
        FrameDetections {
            timestamp: t,
            fps: 30.0,
            width: 640,
            height: 480,
            detections,
        }
    }

    fn raw(bbox: [f32; 4], class: &str, score: f32, track_id: Option<u64>) -> RawDetection {
        RawDetection {
            bbox: BBox::from(bbox),
            class: class.to_string(),
            score,
            track_id,
            source: None,
        }
    }

    #[test]
    fn overlapping_sources_feed_one_track() {
        let config = SentinelConfig::default();
        let (mut pipeline, _alerts) = pipeline(&config);
        let report = pipeline.process_frame(&frame(
            0.0,
            vec![
                raw([300.0, 220.0, 340.0, 260.0], "turtle", 0.9, Some(1)),
                raw([302.0, 221.0, 341.0, 261.0], "turtle", 0.6, Some(2)),
            ],
        ));
        assert_eq!(report.detections.len(), 1);
        assert_eq!(report.statuses, vec![(TrackIdentity::Stable(1), Status::Analyzing)]);
        assert_eq!(report.state.status, Status::Analyzing);
        assert_eq!(report.state.species, "turtle");
    }

    #[test]
    fn empty_frames_settle_to_normal_none() {
        let mut config = SentinelConfig::default();
        config.confirmation.window = 5;
        let (mut pipeline, alerts) = pipeline(&config);
        let mut report = None;
        for i in 0..5 {
            report = Some(pipeline.process_frame(&frame(i as f64, Vec::new())));
        }
        let state = report.unwrap().state;
        assert_eq!(state.status, Status::Normal);
        assert_eq!(state.health, Health::Healthy);
        assert_eq!(state.species, "None");
        assert_eq!(state.frames_processed, 5);
        assert!(alerts.recent().is_empty());
    }

    #[test]
    fn mixed_species_raise_one_species_alert() {
        let mut config = SentinelConfig::default();
        config.confirmation.window = 10;
        let (mut pipeline, alerts) = pipeline(&config);
        // Both resting at the wall, so no behavior alert competes.
        for i in 0..15 {
            pipeline.process_frame(&frame(
                i as f64 / 30.0,
                vec![
                    raw([50.0, 50.0, 90.0, 90.0], "turtle", 0.9, Some(1)),
                    raw([560.0, 300.0, 600.0, 340.0], "tilapia", 0.8, Some(2)),
                ],
            ));
        }
        let recent = alerts.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, AlertKind::Species);
        assert_eq!(recent[0].message, "Mixed Species: tilapia, turtle");
        assert_eq!(
            pipeline.state().confirmed_species,
            vec!["tilapia".to_string(), "turtle".to_string()]
        );
    }

    #[test]
    fn frame_skip_keeps_window_in_processed_frames() {
        let mut config = SentinelConfig::default();
        config.confirmation.window = 10;
        config.pipeline.frame_skip = 2;
        let (mut pipeline, _alerts) = pipeline(&config);
        let at_wall = || vec![raw([50.0, 50.0, 90.0, 90.0], "turtle", 0.9, Some(1))];

        for i in 0..20u32 {
            let report = pipeline.offer(&frame(i as f64 / 30.0, at_wall()));
            if i % 2 == 1 {
                assert!(report.is_none(), "frame {} should be skipped", i);
                continue;
            }
            let state = report.expect("even frames are processed").state;
            let processed = u64::from(i / 2 + 1);
            assert_eq!(state.frames_processed, processed);
            if processed < 10 {
                assert_eq!(state.status, Status::Analyzing, "frame {}", i);
                assert!(state.confirmed_species.is_empty());
            } else {
                assert_eq!(state.status, Status::Normal, "frame {}", i);
                assert_eq!(state.health, Health::Healthy);
                assert_eq!(state.confirmed_species, vec!["turtle".to_string()]);
            }
        }
        assert_eq!(pipeline.frames_offered(), 20);
        assert_eq!(pipeline.state().frames_processed, 10);
    }
}
