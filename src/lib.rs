//! Hatchery Sentinel
//!
//! This crate turns per-frame object detections from hatchery tanks and beach
//! cameras into stable facts an operator can act on.
//!
//! # Architecture
//!
//! An external vision model produces, per frame, a list of boxes with class
//! labels, confidence scores and (optionally) tracker identities. The kernel
//! keeps the temporal state that a single frame cannot carry:
//!
//! 1. **Cross-source dedupe**: overlapping boxes from independent models collapse
//!    to the most confident one before anything touches a track.
//! 2. **Motion history**: bounded per-track position buffers feed an instantaneous
//!    behavior status (`Normal`, `Floater`, `Analyzing`).
//! 3. **Confirmation window**: per-scene sliding vote over species and worst-case
//!    status, producing a debounced scene state.
//! 4. **Nest detection**: spatial re-association of watched-class detections to
//!    flag entities that stay put for a long time.
//! 5. **Threat proximity**: predators or people lingering next to a nest.
//! 6. **Alerts**: per (scene, type) cooldown, bounded ring, best-effort sink.
//!
//! # Module Structure
//!
//! - `detect`: detection sources (replay files, synthetic stub) and their registry
//! - `dedupe`, `motion`, `confirm`, `nest`, `threat`: the analytics stages
//! - `pipeline`: one scene's stages wired together
//! - `scene`: runtime registry of scenes, one worker thread per scene
//! - `alerts`: alert manager and external sinks
//! - `api`: loopback HTTP status surface
//! - `config`: layered file + environment configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub mod alerts;
pub mod api;
pub mod config;
pub mod confirm;
pub mod dedupe;
pub mod detect;
pub mod motion;
pub mod nest;
pub mod pipeline;
pub mod scene;
pub mod threat;

pub use alerts::{Alert, AlertKind, AlertManager, AlertSink, Clock, ManualClock, SystemClock};
pub use config::SentinelConfig;
pub use confirm::{ConfirmationAggregator, SceneUpdate};
pub use dedupe::CrossSourceDeduplicator;
pub use detect::{DetectionSource, ReplaySource, SourceRegistry, StubSource};
pub use motion::{BehaviorClassifier, MotionHistoryStore, SafeZone};
pub use nest::{NestDetector, NestTrack};
pub use pipeline::{FrameReport, ScenePipeline};
pub use scene::{RegistrationError, SceneRegistration, SceneRegistry};
pub use threat::ThreatMonitor;

// -------------------- Geometry --------------------

/// Axis-aligned box in pixel coordinates, serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Ground contact point; used for map projection of beach cameras.
    pub fn bottom_center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, self.y2)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// Intersection over union. Degenerate or non-finite boxes yield 0.
    pub fn iou(&self, other: &BBox) -> f32 {
        if !self.is_finite() || !other.is_finite() {
            return 0.0;
        }
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

pub(crate) fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

// -------------------- Detections --------------------

/// Where a track's identity came from.
///
/// `Synthetic` ids are frame-local indices used when the upstream tracker gave
/// none. They carry NO continuity guarantee across frames: index 0 in one frame
/// and index 0 in the next may be different animals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TrackIdentity {
    Stable(u64),
    Synthetic(usize),
}

impl TrackIdentity {
    pub fn is_stable(&self) -> bool {
        matches!(self, TrackIdentity::Stable(_))
    }
}

/// One validated detection inside a processing cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class: String,
    pub score: f32,
    /// Model that produced the box (e.g. "species", "predator", "human").
    pub source: String,
    pub track: TrackIdentity,
}

/// Detection as delivered by the detector adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: BBox,
    #[serde(alias = "type")]
    pub class: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl RawDetection {
    fn is_well_formed(&self) -> bool {
        self.bbox.is_finite()
            && self.bbox.x2 >= self.bbox.x1
            && self.bbox.y2 >= self.bbox.y1
            && self.score.is_finite()
            && (0.0..=1.0).contains(&self.score)
            && !self.class.trim().is_empty()
    }
}

/// All detections for one frame plus the frame's timing and geometry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameDetections {
    /// Frame time in seconds (stream-relative or epoch, monotonic per scene).
    pub timestamp: f64,
    /// Source frame rate. Zero means "unknown"; consumers fall back to config.
    #[serde(default)]
    pub fps: f32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

impl FrameDetections {
    pub fn empty(timestamp: f64, fps: f32, width: u32, height: u32) -> Self {
        Self {
            timestamp,
            fps,
            width,
            height,
            detections: Vec::new(),
        }
    }

    /// Validated detections for this frame.
    ///
    /// Malformed entries are dropped. Detections without an upstream identity
    /// get `TrackIdentity::Synthetic(index)` where `index` is the position in
    /// the raw list.
    pub fn detections(&self) -> Vec<Detection> {
        self.detections
            .iter()
            .enumerate()
            .filter(|(_, raw)| raw.is_well_formed())
            .map(|(index, raw)| Detection {
                bbox: raw.bbox,
                class: raw.class.trim().to_string(),
                score: raw.score,
                source: raw.source.clone().unwrap_or_else(|| "default".to_string()),
                track: match raw.track_id {
                    Some(id) => TrackIdentity::Stable(id),
                    None => TrackIdentity::Synthetic(index),
                },
            })
            .collect()
    }
}

// -------------------- Scene State --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Initializing,
    Analyzing,
    Normal,
    Floater,
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    Unknown,
    Healthy,
    Critical,
}

/// Externally visible state of one monitored scene.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneState {
    pub scene_id: String,
    pub status: Status,
    pub health: Health,
    /// Display string: confirmed species, or raw species while analyzing.
    pub species: String,
    #[serde(default)]
    pub confirmed_species: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub frames_processed: u64,
    #[serde(default)]
    pub nests: usize,
}

impl SceneState {
    pub fn initializing(scene_id: &str) -> Self {
        Self {
            scene_id: scene_id.to_string(),
            status: Status::Initializing,
            health: Health::Unknown,
            species: "Detecting...".to_string(),
            confirmed_species: Vec::new(),
            error: None,
            frames_processed: 0,
            nests: 0,
        }
    }

    pub fn offline(scene_id: &str, error: Option<String>) -> Self {
        Self {
            scene_id: scene_id.to_string(),
            status: Status::Offline,
            health: Health::Unknown,
            species: "Unknown".to_string(),
            confirmed_species: Vec::new(),
            error,
            frames_processed: 0,
            nests: 0,
        }
    }
}

/// A conforming scene id is a short local identifier such as `tankA` or
/// `beach-zone_b`: ASCII letters, digits, `_` and `-`, at most 64 characters.
pub fn validate_scene_id(scene_id: &str) -> Result<()> {
    static SCENE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = SCENE_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("static scene id pattern")
    });
    if !re.is_match(scene_id) {
        return Err(anyhow!(
            "scene_id must match ^[A-Za-z0-9][A-Za-z0-9_-]{{0,63}}$"
        ));
    }
    Ok(())
}
