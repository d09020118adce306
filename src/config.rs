use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::scene::SceneRegistration;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8790";

const DEFAULT_HISTORY_CAPACITY: usize = 60;
const DEFAULT_MIN_SAMPLES: usize = 10;
const DEFAULT_PIXELS_PER_UNIT: f32 = 25.0;
const DEFAULT_WALL_MARGIN: f32 = 100.0;
const DEFAULT_ACTIVITY_THRESHOLD: f32 = 0.5;
const DEFAULT_BODY_LENGTH_FLOOR: f32 = 0.1;
const DEFAULT_FPS: f32 = 30.0;
const DEFAULT_TRACK_TTL_SECS: f64 = 30.0;

const DEFAULT_CONFIRMATION_WINDOW: usize = 45;
const DEFAULT_SPECIES_RATIO: f32 = 0.3;
const DEFAULT_BEHAVIOR_RATIO: f32 = 0.5;

const DEFAULT_WATCHED_CLASS: &str = "turtle";
const DEFAULT_NEST_LABEL: &str = "nest";
const DEFAULT_MATCH_RADIUS: f32 = 5.0;
const DEFAULT_STATIONARY_SECS: f64 = 3600.0;
const DEFAULT_MOVEMENT_LIMIT: f32 = 2.0;
const DEFAULT_INACTIVITY_SECS: f64 = 5.0;

const DEFAULT_THREAT_CLASSES: [&str; 2] = ["predator", "human"];
const DEFAULT_THREAT_RADIUS: f32 = 10.0;
const DEFAULT_THREAT_DWELL_SECS: f64 = 120.0;
const DEFAULT_THREAT_STALE_SECS: f64 = 10.0;

const DEFAULT_IOU_THRESHOLD: f32 = 0.5;

const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 10;
const DEFAULT_ALERT_CAPACITY: usize = 50;
const DEFAULT_SINK_TIMEOUT_MS: u64 = 2000;

const DEFAULT_FRAME_SKIP: u32 = 1;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    api: Option<ApiConfigFile>,
    behavior: Option<BehaviorConfigFile>,
    confirmation: Option<ConfirmationConfigFile>,
    nest: Option<NestConfigFile>,
    threat: Option<ThreatConfigFile>,
    dedupe: Option<DedupeConfigFile>,
    alerts: Option<AlertConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    scenes: Option<Vec<SceneRegistration>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BehaviorConfigFile {
    history_capacity: Option<usize>,
    min_samples: Option<usize>,
    pixels_per_unit: Option<f32>,
    wall_margin: Option<f32>,
    activity_threshold: Option<f32>,
    body_length_floor: Option<f32>,
    default_fps: Option<f32>,
    track_ttl_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfirmationConfigFile {
    window: Option<usize>,
    species_ratio: Option<f32>,
    behavior_ratio: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct NestConfigFile {
    watched_class: Option<String>,
    nest_label: Option<String>,
    match_radius: Option<f32>,
    stationary_secs: Option<f64>,
    movement_limit: Option<f32>,
    inactivity_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ThreatConfigFile {
    classes: Option<Vec<String>>,
    radius: Option<f32>,
    dwell_secs: Option<f64>,
    stale_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DedupeConfigFile {
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    cooldown_secs: Option<u64>,
    capacity: Option<usize>,
    sink: Option<String>,
    sink_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    frame_skip: Option<u32>,
    realtime: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub api_addr: String,
    pub behavior: BehaviorSettings,
    pub confirmation: ConfirmationSettings,
    pub nest: NestSettings,
    pub threat: ThreatSettings,
    pub dedupe_iou_threshold: f32,
    pub alerts: AlertSettings,
    pub pipeline: PipelineSettings,
    pub scenes: Vec<SceneRegistration>,
}

/// Motion history and behavior classification thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorSettings {
    pub history_capacity: usize,
    /// Below this many samples a track is `Analyzing`.
    pub min_samples: usize,
    pub pixels_per_unit: f32,
    /// Inset from every frame edge; positions inside the band are "at the wall".
    pub wall_margin: f32,
    /// Body lengths per second.
    pub activity_threshold: f32,
    pub body_length_floor: f32,
    pub default_fps: f32,
    pub track_ttl_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationSettings {
    pub window: usize,
    pub species_ratio: f32,
    pub behavior_ratio: f32,
}

/// Nest association runs in map coordinates (0..100 on both axes).
#[derive(Debug, Clone, PartialEq)]
pub struct NestSettings {
    pub watched_class: String,
    pub nest_label: String,
    pub match_radius: f32,
    pub stationary_secs: f64,
    pub movement_limit: f32,
    pub inactivity_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreatSettings {
    pub classes: Vec<String>,
    pub radius: f32,
    pub dwell_secs: f64,
    pub stale_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertSettings {
    pub cooldown: Duration,
    pub capacity: usize,
    pub sink: Option<String>,
    pub sink_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Process every Kth frame.
    pub frame_skip: u32,
    /// Sleep to the source frame interval between cycles.
    pub realtime: bool,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            min_samples: DEFAULT_MIN_SAMPLES,
            pixels_per_unit: DEFAULT_PIXELS_PER_UNIT,
            wall_margin: DEFAULT_WALL_MARGIN,
            activity_threshold: DEFAULT_ACTIVITY_THRESHOLD,
            body_length_floor: DEFAULT_BODY_LENGTH_FLOOR,
            default_fps: DEFAULT_FPS,
            track_ttl_secs: DEFAULT_TRACK_TTL_SECS,
        }
    }
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_CONFIRMATION_WINDOW,
            species_ratio: DEFAULT_SPECIES_RATIO,
            behavior_ratio: DEFAULT_BEHAVIOR_RATIO,
        }
    }
}

impl Default for NestSettings {
    fn default() -> Self {
        Self {
            watched_class: DEFAULT_WATCHED_CLASS.to_string(),
            nest_label: DEFAULT_NEST_LABEL.to_string(),
            match_radius: DEFAULT_MATCH_RADIUS,
            stationary_secs: DEFAULT_STATIONARY_SECS,
            movement_limit: DEFAULT_MOVEMENT_LIMIT,
            inactivity_secs: DEFAULT_INACTIVITY_SECS,
        }
    }
}

impl Default for ThreatSettings {
    fn default() -> Self {
        Self {
            classes: DEFAULT_THREAT_CLASSES.iter().map(|c| c.to_string()).collect(),
            radius: DEFAULT_THREAT_RADIUS,
            dwell_secs: DEFAULT_THREAT_DWELL_SECS,
            stale_secs: DEFAULT_THREAT_STALE_SECS,
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(DEFAULT_ALERT_COOLDOWN_SECS),
            capacity: DEFAULT_ALERT_CAPACITY,
            sink: None,
            sink_timeout: Duration::from_millis(DEFAULT_SINK_TIMEOUT_MS),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            frame_skip: DEFAULT_FRAME_SKIP,
            realtime: true,
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            behavior: BehaviorSettings::default(),
            confirmation: ConfirmationSettings::default(),
            nest: NestSettings::default(),
            threat: ThreatSettings::default(),
            dedupe_iou_threshold: DEFAULT_IOU_THRESHOLD,
            alerts: AlertSettings::default(),
            pipeline: PipelineSettings::default(),
            scenes: Vec::new(),
        }
    }
}

impl SentinelConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Self {
        let defaults = Self::default();

        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or(defaults.api_addr);

        let b = file.behavior.unwrap_or_default();
        let d = defaults.behavior;
        let behavior = BehaviorSettings {
            history_capacity: b.history_capacity.unwrap_or(d.history_capacity),
            min_samples: b.min_samples.unwrap_or(d.min_samples),
            pixels_per_unit: b.pixels_per_unit.unwrap_or(d.pixels_per_unit),
            wall_margin: b.wall_margin.unwrap_or(d.wall_margin),
            activity_threshold: b.activity_threshold.unwrap_or(d.activity_threshold),
            body_length_floor: b.body_length_floor.unwrap_or(d.body_length_floor),
            default_fps: b.default_fps.unwrap_or(d.default_fps),
            track_ttl_secs: b.track_ttl_secs.unwrap_or(d.track_ttl_secs),
        };

        let c = file.confirmation.unwrap_or_default();
        let d = defaults.confirmation;
        let confirmation = ConfirmationSettings {
            window: c.window.unwrap_or(d.window),
            species_ratio: c.species_ratio.unwrap_or(d.species_ratio),
            behavior_ratio: c.behavior_ratio.unwrap_or(d.behavior_ratio),
        };

        let n = file.nest.unwrap_or_default();
        let d = defaults.nest;
        let nest = NestSettings {
            watched_class: n.watched_class.unwrap_or(d.watched_class),
            nest_label: n.nest_label.unwrap_or(d.nest_label),
            match_radius: n.match_radius.unwrap_or(d.match_radius),
            stationary_secs: n.stationary_secs.unwrap_or(d.stationary_secs),
            movement_limit: n.movement_limit.unwrap_or(d.movement_limit),
            inactivity_secs: n.inactivity_secs.unwrap_or(d.inactivity_secs),
        };

        let t = file.threat.unwrap_or_default();
        let d = defaults.threat;
        let threat = ThreatSettings {
            classes: t.classes.unwrap_or(d.classes),
            radius: t.radius.unwrap_or(d.radius),
            dwell_secs: t.dwell_secs.unwrap_or(d.dwell_secs),
            stale_secs: t.stale_secs.unwrap_or(d.stale_secs),
        };

        let dedupe_iou_threshold = file
            .dedupe
            .and_then(|dedupe| dedupe.iou_threshold)
            .unwrap_or(defaults.dedupe_iou_threshold);

        let a = file.alerts.unwrap_or_default();
        let d = defaults.alerts;
        let alerts = AlertSettings {
            cooldown: a.cooldown_secs.map(Duration::from_secs).unwrap_or(d.cooldown),
            capacity: a.capacity.unwrap_or(d.capacity),
            sink: a.sink.filter(|sink| !sink.trim().is_empty()),
            sink_timeout: a
                .sink_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.sink_timeout),
        };

        let p = file.pipeline.unwrap_or_default();
        let d = defaults.pipeline;
        let pipeline = PipelineSettings {
            frame_skip: p.frame_skip.unwrap_or(d.frame_skip),
            realtime: p.realtime.unwrap_or(d.realtime),
        };

        Self {
            api_addr,
            behavior,
            confirmation,
            nest,
            threat,
            dedupe_iou_threshold,
            alerts,
            pipeline,
            scenes: file.scenes.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SENTINEL_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(sink) = std::env::var("SENTINEL_ALERT_SINK") {
            if !sink.trim().is_empty() {
                self.alerts.sink = Some(sink.trim().to_string());
            }
        }
        if let Ok(cooldown) = std::env::var("SENTINEL_ALERT_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("SENTINEL_ALERT_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.alerts.cooldown = Duration::from_secs(seconds);
        }
        if let Ok(window) = std::env::var("SENTINEL_CONFIRMATION_WINDOW") {
            self.confirmation.window = window
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_CONFIRMATION_WINDOW must be a positive integer"))?;
        }
        if let Ok(skip) = std::env::var("SENTINEL_FRAME_SKIP") {
            self.pipeline.frame_skip = skip
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_FRAME_SKIP must be a positive integer"))?;
        }
        if let Ok(scenes) = std::env::var("SENTINEL_SCENES") {
            let parsed = split_csv(&scenes)
                .into_iter()
                .map(|entry| parse_scene_entry(&entry))
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.scenes = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let b = &self.behavior;
        if b.history_capacity == 0 {
            return Err(anyhow!("behavior.history_capacity must be greater than zero"));
        }
        if b.min_samples == 0 || b.min_samples > b.history_capacity {
            return Err(anyhow!(
                "behavior.min_samples must be between 1 and history_capacity ({})",
                b.history_capacity
            ));
        }
        require_positive("behavior.pixels_per_unit", b.pixels_per_unit)?;
        require_positive("behavior.body_length_floor", b.body_length_floor)?;
        require_positive("behavior.default_fps", b.default_fps)?;
        require_positive("behavior.track_ttl_secs", b.track_ttl_secs as f32)?;
        if !b.wall_margin.is_finite() || b.wall_margin < 0.0 {
            return Err(anyhow!("behavior.wall_margin must be zero or positive"));
        }
        if !b.activity_threshold.is_finite() || b.activity_threshold < 0.0 {
            return Err(anyhow!("behavior.activity_threshold must be zero or positive"));
        }

        let c = &self.confirmation;
        if c.window == 0 {
            return Err(anyhow!("confirmation.window must be greater than zero"));
        }
        require_ratio("confirmation.species_ratio", c.species_ratio)?;
        require_ratio("confirmation.behavior_ratio", c.behavior_ratio)?;

        let n = &self.nest;
        if n.watched_class.trim().is_empty() || n.nest_label.trim().is_empty() {
            return Err(anyhow!("nest.watched_class and nest.nest_label must not be empty"));
        }
        require_positive("nest.match_radius", n.match_radius)?;
        require_positive("nest.stationary_secs", n.stationary_secs as f32)?;
        require_positive("nest.inactivity_secs", n.inactivity_secs as f32)?;
        if !n.movement_limit.is_finite() || n.movement_limit < 0.0 {
            return Err(anyhow!("nest.movement_limit must be zero or positive"));
        }

        let t = &mut self.threat;
        t.classes = t
            .classes
            .iter()
            .map(|class| class.trim().to_string())
            .filter(|class| !class.is_empty())
            .collect();
        require_positive("threat.radius", t.radius)?;
        require_positive("threat.dwell_secs", t.dwell_secs as f32)?;
        require_positive("threat.stale_secs", t.stale_secs as f32)?;

        require_ratio("dedupe.iou_threshold", self.dedupe_iou_threshold)?;

        if self.alerts.capacity == 0 {
            return Err(anyhow!("alerts.capacity must be greater than zero"));
        }
        if let Some(sink) = self.alerts.sink.as_deref() {
            crate::alerts::sink::validate_locator(sink)?;
        }

        if self.pipeline.frame_skip == 0 {
            return Err(anyhow!("pipeline.frame_skip must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for scene in &self.scenes {
            let (scene_id, _) = scene.validate()?;
            if !seen.insert(scene_id.clone()) {
                return Err(anyhow!("duplicate scene id in config: {}", scene_id));
            }
        }
        Ok(())
    }
}

fn require_positive(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(anyhow!("{} must be greater than zero", name));
    }
    Ok(())
}

fn require_ratio(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value >= 1.0 {
        return Err(anyhow!("{} must be between 0 and 1 (exclusive)", name));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// `tankA=replay:///data/tank_a.jsonl`
fn parse_scene_entry(entry: &str) -> Result<SceneRegistration> {
    let (scene_id, source) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("SENTINEL_SCENES entries must look like id=locator: {}", entry))?;
    Ok(SceneRegistration {
        scene_id: Some(scene_id.trim().to_string()),
        source: Some(source.trim().to_string()),
    })
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let mut cfg = SentinelConfig::from_file(SentinelConfigFile::default());
        cfg.validate().unwrap();
        assert_eq!(cfg.api_addr, DEFAULT_API_ADDR);
        assert_eq!(cfg.confirmation.window, 45);
        assert_eq!(cfg.behavior.history_capacity, 60);
        assert_eq!(cfg.alerts.cooldown, Duration::from_secs(10));
        assert_eq!(cfg.threat.classes, vec!["predator", "human"]);
        assert!(cfg.scenes.is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let file: SentinelConfigFile = serde_json::from_str(
            r#"{"behavior": {"wall_margin": 40.0}, "confirmation": {"window": 30}}"#,
        )
        .unwrap();
        let cfg = SentinelConfig::from_file(file);
        assert_eq!(cfg.behavior.wall_margin, 40.0);
        assert_eq!(cfg.behavior.min_samples, DEFAULT_MIN_SAMPLES);
        assert_eq!(cfg.confirmation.window, 30);
        assert_eq!(cfg.confirmation.species_ratio, DEFAULT_SPECIES_RATIO);
    }

    #[test]
    fn toml_sections_parse() {
        let file: SentinelConfigFile = toml::from_str(
            r#"
            [nest]
            stationary_secs = 600.0

            [[scenes]]
            scene_id = "tankA"
            source = "stub://tankA"
            "#,
        )
        .unwrap();
        let cfg = SentinelConfig::from_file(file);
        assert_eq!(cfg.nest.stationary_secs, 600.0);
        assert_eq!(cfg.scenes.len(), 1);
    }

    #[test]
    fn validation_rejects_bad_thresholds() {
        let mut cfg = SentinelConfig::default();
        cfg.confirmation.species_ratio = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = SentinelConfig::default();
        cfg.behavior.min_samples = 61;
        assert!(cfg.validate().is_err());

        let mut cfg = SentinelConfig::default();
        cfg.pipeline.frame_skip = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SentinelConfig::default();
        cfg.alerts.sink = Some("ftp://example".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scene_entries_parse() {
        let scene = parse_scene_entry("tankA = stub://tankA").unwrap();
        assert_eq!(scene.scene_id.as_deref(), Some("tankA"));
        assert_eq!(scene.source.as_deref(), Some("stub://tankA"));
        assert!(parse_scene_entry("tankA").is_err());
    }
}
