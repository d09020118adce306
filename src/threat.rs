//! Threat proximity: predators or people lingering next to a confirmed nest.

use std::collections::HashMap;

use crate::alerts::AlertKind;
use crate::config::ThreatSettings;
use crate::confirm::AlertRequest;
use crate::nest::{map_position, NestTrack};
use crate::{distance, Detection};

#[derive(Clone, Debug, PartialEq)]
struct Episode {
    started: f64,
    last_seen: f64,
    alerted: bool,
}

/// Tracks `(nest, class)` proximity episodes for one scene.
pub struct ThreatMonitor {
    settings: ThreatSettings,
    episodes: HashMap<(u64, String), Episode>,
}

impl ThreatMonitor {
    pub fn new(settings: ThreatSettings) -> Self {
        Self {
            settings,
            episodes: HashMap::new(),
        }
    }

    pub fn active_episodes(&self) -> usize {
        self.episodes.len()
    }

    /// Extends episodes for threat-class detections within `radius` of a nest
    /// and returns one alert per episode that reaches the dwell time.
    pub fn observe(
        &mut self,
        detections: &[Detection],
        nests: &[NestTrack],
        width: u32,
        height: u32,
        timestamp: f64,
    ) -> Vec<AlertRequest> {
        let mut alerts = Vec::new();
        for detection in detections {
            if !self.settings.classes.iter().any(|c| *c == detection.class) {
                continue;
            }
            let pos = map_position(&detection.bbox, width, height);
            for nest in nests.iter().filter(|nest| nest.is_nest) {
                if distance(pos, nest.last_pos) >= self.settings.radius {
                    continue;
                }
                let episode = self
                    .episodes
                    .entry((nest.id, detection.class.clone()))
                    .or_insert(Episode {
                        started: timestamp,
                        last_seen: timestamp,
                        alerted: false,
                    });
                episode.last_seen = timestamp;
                let dwell = timestamp - episode.started;
                if !episode.alerted && dwell >= self.settings.dwell_secs {
                    episode.alerted = true;
                    alerts.push(AlertRequest {
                        kind: AlertKind::Threat,
                        message: format!(
                            "{} near nest {} for {:.0}s",
                            detection.class, nest.id, dwell
                        ),
                    });
                }
            }
        }

        let stale = self.settings.stale_secs;
        self.episodes
            .retain(|_, episode| timestamp - episode.last_seen <= stale);
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BBox, TrackIdentity};

    fn nest() -> NestTrack {
        NestTrack {
            id: 7,
            start_pos: (50.0, 50.0),
            last_pos: (50.0, 50.0),
            first_seen: 0.0,
            last_seen: 0.0,
            is_nest: true,
        }
    }

    // 100x100 frame: pixels are map units.
    fn at(class: &str, x: f32, y: f32) -> Detection {
        Detection {
            bbox: BBox::new(x - 5.0, y - 10.0, x + 5.0, y),
            class: class.to_string(),
            score: 0.8,
            source: class.to_string(),
            track: TrackIdentity::Synthetic(0),
        }
    }

    #[test]
    fn lingering_predator_alerts_once() {
        let mut monitor = ThreatMonitor::new(ThreatSettings::default());
        let nests = [nest()];
        let mut total = Vec::new();
        for t in 0..=200 {
            total.extend(monitor.observe(&[at("predator", 55.0, 50.0)], &nests, 100, 100, t as f64));
        }
        assert_eq!(total.len(), 1);
        assert_eq!(total[0].kind, AlertKind::Threat);
        assert!(total[0].message.starts_with("predator near nest 7"));
    }

    #[test]
    fn far_or_non_threat_classes_are_ignored() {
        let mut monitor = ThreatMonitor::new(ThreatSettings::default());
        let nests = [nest()];
        for t in 0..=200 {
            let dets = [at("predator", 80.0, 50.0), at("turtle", 50.0, 50.0)];
            assert!(monitor.observe(&dets, &nests, 100, 100, t as f64).is_empty());
        }
        assert_eq!(monitor.active_episodes(), 0);
    }

    #[test]
    fn unconfirmed_nests_are_not_guarded() {
        let mut monitor = ThreatMonitor::new(ThreatSettings::default());
        let mut candidate = nest();
        candidate.is_nest = false;
        monitor.observe(&[at("human", 50.0, 50.0)], &[candidate], 100, 100, 0.0);
        assert_eq!(monitor.active_episodes(), 0);
    }

    #[test]
    fn stale_episode_restarts_the_dwell_clock() {
        let mut monitor = ThreatMonitor::new(ThreatSettings::default());
        let nests = [nest()];
        for t in 0..100 {
            monitor.observe(&[at("human", 50.0, 50.0)], &nests, 100, 100, t as f64);
        }
        // Gone for 20s: episode dropped.
        assert!(monitor.observe(&[], &nests, 100, 100, 119.0).is_empty());
        assert_eq!(monitor.active_episodes(), 0);
        // Back at 120s: a fresh episode, no alert yet.
        assert!(monitor
            .observe(&[at("human", 50.0, 50.0)], &nests, 100, 100, 120.0)
            .is_empty());
    }
}
