//! Sliding-window confirmation of species and behavior per scene.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::alerts::AlertKind;
use crate::config::ConfirmationSettings;
use crate::{Health, Status};

/// An alert the aggregator wants raised; throttling happens downstream.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertRequest {
    pub kind: AlertKind,
    pub message: String,
}

/// Result of observing one processed frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneUpdate {
    pub status: Status,
    pub health: Health,
    /// Confirmed species once the window is full, otherwise this frame's raw species.
    pub species: Vec<String>,
    pub confirmed: bool,
    pub alerts: Vec<AlertRequest>,
}

impl SceneUpdate {
    /// Display form used by scene state queries.
    pub fn species_label(&self) -> String {
        match (self.species.is_empty(), self.confirmed) {
            (false, _) => self.species.join(", "),
            (true, true) => "None".to_string(),
            (true, false) => "Detecting...".to_string(),
        }
    }
}

/// Frame status is the worst case over the frame's detections.
pub fn frame_status(statuses: &[Status]) -> Status {
    if statuses.iter().any(|s| *s == Status::Floater) {
        Status::Floater
    } else {
        Status::Normal
    }
}

pub struct ConfirmationAggregator {
    settings: ConfirmationSettings,
    species: VecDeque<BTreeSet<String>>,
    statuses: VecDeque<Status>,
}

impl ConfirmationAggregator {
    pub fn new(settings: ConfirmationSettings) -> Self {
        let window = settings.window;
        Self {
            settings,
            species: VecDeque::with_capacity(window),
            statuses: VecDeque::with_capacity(window),
        }
    }

    pub fn is_full(&self) -> bool {
        self.statuses.len() >= self.settings.window
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Records one processed frame and recomputes the scene verdict.
    ///
    /// Before the window fills the update is interim: raw species and
    /// `Analyzing`. Afterwards every frame yields a recomputed verdict over
    /// the trailing window; the window is never reset.
    pub fn observe(&mut self, frame_species: BTreeSet<String>, frame_statuses: &[Status]) -> SceneUpdate {
        let window = self.settings.window;
        if self.statuses.len() == window {
            self.statuses.pop_front();
            self.species.pop_front();
        }
        self.statuses.push_back(frame_status(frame_statuses));
        self.species.push_back(frame_species);

        if !self.is_full() {
            let raw = self.species.back().cloned().unwrap_or_default();
            return SceneUpdate {
                status: Status::Analyzing,
                health: Health::Unknown,
                species: raw.into_iter().collect(),
                confirmed: false,
                alerts: Vec::new(),
            };
        }
        self.verdict()
    }

    fn verdict(&self) -> SceneUpdate {
        let total = self.statuses.len() as f32;
        let mut alerts = Vec::new();

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for frame in &self.species {
            for species in frame {
                *counts.entry(species.as_str()).or_default() += 1;
            }
        }
        let species_cutoff = total * self.settings.species_ratio;
        let confirmed: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count as f32 > species_cutoff)
            .map(|(species, _)| species.to_string())
            .collect();
        if confirmed.len() > 1 {
            alerts.push(AlertRequest {
                kind: AlertKind::Species,
                message: format!("Mixed Species: {}", confirmed.join(", ")),
            });
        }

        let floaters = self
            .statuses
            .iter()
            .filter(|s| **s == Status::Floater)
            .count();
        let (status, health) = if floaters as f32 > total * self.settings.behavior_ratio {
            alerts.push(AlertRequest {
                kind: AlertKind::Behavior,
                message: "Abnormal behavior (Floater)".to_string(),
            });
            (Status::Floater, Health::Critical)
        } else {
            (Status::Normal, Health::Healthy)
        };

        SceneUpdate {
            status,
            health,
            species: confirmed,
            confirmed: true,
            alerts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(window: usize) -> ConfirmationSettings {
        ConfirmationSettings {
            window,
            ..ConfirmationSettings::default()
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn interim_updates_until_window_full() {
        let mut agg = ConfirmationAggregator::new(settings(10));
        for _ in 0..9 {
            let update = agg.observe(set(&["turtle"]), &[Status::Floater]);
            assert!(!update.confirmed);
            assert_eq!(update.status, Status::Analyzing);
            assert_eq!(update.species_label(), "turtle");
        }
        let update = agg.observe(set(&["turtle"]), &[Status::Floater]);
        assert!(update.confirmed);
        assert_eq!(update.status, Status::Floater);
        assert_eq!(update.health, Health::Critical);
    }

    #[test]
    fn empty_interim_frame_reads_detecting() {
        let mut agg = ConfirmationAggregator::new(settings(5));
        let update = agg.observe(BTreeSet::new(), &[]);
        assert_eq!(update.species_label(), "Detecting...");
    }

    #[test]
    fn species_ratio_boundary() {
        // window 10, cutoff 3.0: present in 3 frames is excluded, 4 is included.
        let mut agg = ConfirmationAggregator::new(settings(10));
        let mut update = None;
        for i in 0..10 {
            let mut species = set(&["turtle"]);
            if i < 3 {
                species.insert("tilapia".to_string());
            }
            if i < 4 {
                species.insert("koi".to_string());
            }
            update = Some(agg.observe(species, &[Status::Normal]));
        }
        let update = update.unwrap();
        assert_eq!(update.species, vec!["koi", "turtle"]);
        assert_eq!(update.status, Status::Normal);
        assert_eq!(update.health, Health::Healthy);
        assert_eq!(update.alerts.len(), 1);
        assert_eq!(update.alerts[0].kind, AlertKind::Species);
        assert_eq!(update.alerts[0].message, "Mixed Species: koi, turtle");
    }

    #[test]
    fn empty_frames_count_as_normal_with_no_species() {
        let mut agg = ConfirmationAggregator::new(settings(4));
        let mut update = None;
        for _ in 0..4 {
            update = Some(agg.observe(BTreeSet::new(), &[]));
        }
        let update = update.unwrap();
        assert!(update.confirmed);
        assert_eq!(update.status, Status::Normal);
        assert_eq!(update.species_label(), "None");
        assert!(update.alerts.is_empty());
    }

    #[test]
    fn window_slides_without_reset() {
        let mut agg = ConfirmationAggregator::new(settings(4));
        for _ in 0..4 {
            agg.observe(set(&["turtle"]), &[Status::Floater]);
        }
        // Two normal frames: 2 floaters of 4 is not > 50%.
        agg.observe(set(&["turtle"]), &[Status::Normal]);
        let update = agg.observe(set(&["turtle"]), &[Status::Normal]);
        assert_eq!(update.status, Status::Normal);
        assert_eq!(agg.len(), 4);
    }

    #[test]
    fn any_floater_marks_the_frame() {
        assert_eq!(frame_status(&[Status::Normal, Status::Floater]), Status::Floater);
        assert_eq!(frame_status(&[Status::Analyzing, Status::Normal]), Status::Normal);
        assert_eq!(frame_status(&[]), Status::Normal);
    }
}
