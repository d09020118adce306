//! Runtime registry of monitored scenes.
//!
//! Each registered scene gets one worker thread that owns its source and its
//! `ScenePipeline`. The worker publishes a `SceneState` snapshot after every
//! processed frame; readers only ever take that snapshot's lock briefly, so
//! status queries never wait on frame processing.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::alerts::{AlertKind, AlertManager};
use crate::config::{PipelineSettings, SentinelConfig};
use crate::detect::{DetectionSource, SourceRegistry};
use crate::pipeline::ScenePipeline;
use crate::{SceneState, Status};

const PACING_SLICE: Duration = Duration::from_millis(50);

/// Request to start monitoring a scene. Both fields are required; they are
/// optional here so a missing one can be reported precisely.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneRegistration {
    #[serde(default)]
    pub scene_id: Option<String>,
    #[serde(default, alias = "source_locator")]
    pub source: Option<String>,
}

impl SceneRegistration {
    pub fn new(scene_id: &str, source: &str) -> Self {
        Self {
            scene_id: Some(scene_id.to_string()),
            source: Some(source.to_string()),
        }
    }

    /// Returns `(scene_id, source)` or a `RegistrationError`.
    pub fn validate(&self) -> Result<(String, String)> {
        let scene_id = non_empty(self.scene_id.as_deref())
            .ok_or_else(|| RegistrationError::missing_field("scene_id"))?;
        let source = non_empty(self.source.as_deref())
            .ok_or_else(|| RegistrationError::missing_field("source"))?;
        crate::validate_scene_id(scene_id)
            .map_err(|e| RegistrationError::new("invalid_scene_id", &e.to_string()))?;
        Ok((scene_id.to_string(), source.to_string()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Registration failure the API maps to a status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationError {
    pub code: &'static str,
    pub message: String,
}

impl RegistrationError {
    pub fn new(code: &'static str, message: &str) -> anyhow::Error {
        anyhow::Error::new(Self {
            code,
            message: message.to_string(),
        })
    }

    fn missing_field(field: &str) -> anyhow::Error {
        Self::new("missing_field", &format!("missing required field: {}", field))
    }

    fn duplicate(scene_id: &str) -> anyhow::Error {
        Self::new(
            "duplicate_scene",
            &format!("scene already registered: {}", scene_id),
        )
    }

    fn unknown(scene_id: &str) -> anyhow::Error {
        Self::new("unknown_scene", &format!("unknown scene: {}", scene_id))
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RegistrationError {}

struct SceneWorker {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl SceneWorker {
    fn stop(self, scene_id: &str, state: &RwLock<SceneState>) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(panic) = self.join.join() {
            let message = format!("scene worker panicked: {}", panic_message(panic.as_ref()));
            log::error!("scene {}: {}", scene_id, message);
            mark_offline(state, message);
        }
    }
}

struct SceneEntry {
    source: String,
    state: Arc<RwLock<SceneState>>,
    worker: Option<SceneWorker>,
}

/// Explicit map of scene id to owned scene state, built at registration.
pub struct SceneRegistry {
    config: Arc<SentinelConfig>,
    sources: Arc<SourceRegistry>,
    alerts: Arc<AlertManager>,
    scenes: Mutex<HashMap<String, SceneEntry>>,
}

impl SceneRegistry {
    pub fn new(config: Arc<SentinelConfig>, sources: Arc<SourceRegistry>, alerts: Arc<AlertManager>) -> Self {
        Self {
            config,
            sources,
            alerts,
            scenes: Mutex::new(HashMap::new()),
        }
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Validates the request and starts the scene's worker.
    ///
    /// A source that cannot be opened does not fail registration: the scene
    /// is registered and reports `Offline` with the error.
    pub fn register(&self, registration: &SceneRegistration) -> Result<SceneState> {
        let (scene_id, source) = registration.validate()?;
        let mut scenes = self.lock()?;
        if scenes.contains_key(&scene_id) {
            return Err(RegistrationError::duplicate(&scene_id));
        }

        let state = Arc::new(RwLock::new(SceneState::initializing(&scene_id)));
        let worker = self.spawn_worker(&scene_id, &source, state.clone())?;
        let snapshot = read_state(&state);
        scenes.insert(
            scene_id.clone(),
            SceneEntry {
                source: source.clone(),
                state,
                worker: Some(worker),
            },
        );
        log::info!("scene {} registered (source {})", scene_id, source);
        Ok(snapshot)
    }

    /// Registers every entry, logging failures instead of stopping.
    pub fn register_all(&self, registrations: &[SceneRegistration]) -> usize {
        registrations
            .iter()
            .filter(|registration| match self.register(registration) {
                Ok(_) => true,
                Err(err) => {
                    log::warn!("scene registration failed: {}", err);
                    false
                }
            })
            .count()
    }

    /// Stops the worker and releases the source. The last state stays readable.
    pub fn stop(&self, scene_id: &str) -> Result<SceneState> {
        let (worker, state) = {
            let mut scenes = self.lock()?;
            let entry = scenes
                .get_mut(scene_id)
                .ok_or_else(|| RegistrationError::unknown(scene_id))?;
            (entry.worker.take(), entry.state.clone())
        };
        if let Some(worker) = worker {
            worker.stop(scene_id, &state);
            log::info!("scene {} stopped", scene_id);
        }
        Ok(read_state(&state))
    }

    /// Stops the scene if needed and forgets it.
    pub fn remove(&self, scene_id: &str) -> Result<SceneState> {
        let entry = self
            .lock()?
            .remove(scene_id)
            .ok_or_else(|| RegistrationError::unknown(scene_id))?;
        if let Some(worker) = entry.worker {
            worker.stop(scene_id, &entry.state);
        }
        self.alerts.forget_scene(scene_id);
        log::info!("scene {} removed", scene_id);
        Ok(read_state(&entry.state))
    }

    pub fn state(&self, scene_id: &str) -> Option<SceneState> {
        let state = self.lock().ok()?.get(scene_id).map(|entry| entry.state.clone())?;
        Some(read_state(&state))
    }

    /// Snapshots of all scenes, ordered by id.
    pub fn states(&self) -> Vec<SceneState> {
        let handles: Vec<Arc<RwLock<SceneState>>> = match self.lock() {
            Ok(scenes) => scenes.values().map(|entry| entry.state.clone()).collect(),
            Err(_) => return Vec::new(),
        };
        let mut states: Vec<SceneState> = handles.iter().map(read_state).collect();
        states.sort_by(|a, b| a.scene_id.cmp(&b.scene_id));
        states
    }

    pub fn source_of(&self, scene_id: &str) -> Option<String> {
        self.lock()
            .ok()?
            .get(scene_id)
            .map(|entry| entry.source.clone())
    }

    pub fn is_running(&self, scene_id: &str) -> bool {
        self.lock()
            .ok()
            .and_then(|scenes| {
                scenes
                    .get(scene_id)
                    .and_then(|entry| entry.worker.as_ref())
                    .map(|worker| !worker.join.is_finished())
            })
            .unwrap_or(false)
    }

    /// Stops every worker. Scenes stay registered with their last state.
    pub fn shutdown(&self) {
        let workers: Vec<(String, SceneWorker, Arc<RwLock<SceneState>>)> = match self.lock() {
            Ok(mut scenes) => scenes
                .iter_mut()
                .filter_map(|(id, entry)| {
                    entry
                        .worker
                        .take()
                        .map(|w| (id.clone(), w, entry.state.clone()))
                })
                .collect(),
            Err(_) => return,
        };
        for (scene_id, worker, state) in workers {
            worker.stop(&scene_id, &state);
            log::info!("scene {} stopped", scene_id);
        }
    }

    fn spawn_worker(
        &self,
        scene_id: &str,
        locator: &str,
        state: Arc<RwLock<SceneState>>,
    ) -> Result<SceneWorker> {
        let stop = Arc::new(AtomicBool::new(false));
        let published = state.clone();
        let id = scene_id.to_string();
        let ctx = WorkerContext {
            scene_id: scene_id.to_string(),
            locator: locator.to_string(),
            sources: self.sources.clone(),
            alerts: self.alerts.clone(),
            pipeline: ScenePipeline::new(scene_id, &self.config, self.alerts.clone()),
            settings: self.config.pipeline.clone(),
            state,
            stop: stop.clone(),
        };
        let join = std::thread::Builder::new()
            .name(format!("scene-{}", scene_id))
            .spawn(move || {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || ctx.run())) {
                    let message =
                        format!("scene worker panicked: {}", panic_message(panic.as_ref()));
                    log::error!("scene {}: {}", id, message);
                    mark_offline(&published, message);
                }
            })
            .with_context(|| format!("spawn worker for scene {}", scene_id))?;
        Ok(SceneWorker { stop, join })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, SceneEntry>>> {
        self.scenes
            .lock()
            .map_err(|_| anyhow!("scene registry lock poisoned"))
    }
}

impl Drop for SceneRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_state(state: &Arc<RwLock<SceneState>>) -> SceneState {
    state.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn publish(state: &RwLock<SceneState>, next: SceneState) {
    *state.write().unwrap_or_else(|e| e.into_inner()) = next;
}

/// Keeps the last published verdict but flags the scene `Offline`.
fn mark_offline(state: &RwLock<SceneState>, message: String) {
    let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
    guard.status = Status::Offline;
    guard.error = Some(message);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct WorkerContext {
    scene_id: String,
    locator: String,
    sources: Arc<SourceRegistry>,
    alerts: Arc<AlertManager>,
    pipeline: ScenePipeline,
    settings: PipelineSettings,
    state: Arc<RwLock<SceneState>>,
    stop: Arc<AtomicBool>,
}

impl WorkerContext {
    fn run(mut self) {
        let mut source = match self.open_source() {
            Ok(source) => source,
            Err(err) => {
                let message = format!("source unavailable: {:#}", err);
                log::warn!("scene {}: {}", self.scene_id, message);
                self.alerts
                    .trigger(&self.scene_id, AlertKind::Source, &message);
                publish(&self.state, SceneState::offline(&self.scene_id, Some(message)));
                return;
            }
        };

        while !self.stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            match source.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(report) = self.pipeline.offer(&frame) {
                        publish(&self.state, report.state);
                    }
                    if !source.is_healthy() {
                        let message = format!("source {} reported unhealthy", source.name());
                        log::warn!("scene {}: {}", self.scene_id, message);
                        mark_offline(&self.state, message);
                        break;
                    }
                }
                Ok(None) => {
                    log::info!(
                        "scene {}: source ended after {} frames",
                        self.scene_id,
                        self.pipeline.frames_offered()
                    );
                    break;
                }
                Err(err) => {
                    let message = format!("source failed: {:#}", err);
                    log::warn!("scene {}: {}", self.scene_id, message);
                    mark_offline(&self.state, message);
                    break;
                }
            }
            if self.settings.realtime {
                if let Some(interval) = source.frame_interval() {
                    self.pace(interval.saturating_sub(started.elapsed()));
                }
            }
        }
        drop(source);
        log::debug!("scene {}: worker exited, source released", self.scene_id);
    }

    fn open_source(&self) -> Result<Box<dyn DetectionSource>> {
        let mut source = self.sources.open(&self.locator)?;
        source.connect()?;
        Ok(source)
    }

    /// Sleeps in short slices so a stop request is honoured promptly.
    fn pace(&self, mut remaining: Duration) {
        while !remaining.is_zero() && !self.stop.load(Ordering::SeqCst) {
            let slice = remaining.min(PACING_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}
