//! Alert throttling and the recent-alert ring.
//!
//! The manager is the only state shared between scene pipelines. Emission is
//! decided under one lock; forwarding to an external sink happens after the
//! lock is released and never fails the emission.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::AlertSettings;

pub mod sink;

pub use sink::{AlertSink, HttpAlertSink, MqttAlertSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Species,
    Behavior,
    Threat,
    Source,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Species => "species",
            AlertKind::Behavior => "behavior",
            AlertKind::Threat => "threat",
            AlertKind::Source => "source",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub scene_id: String,
    /// Milliseconds since the Unix epoch, per the manager's clock.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

/// Time source for cooldown decisions.
pub trait Clock: Send + Sync {
    /// Time since the Unix epoch.
    fn now(&self) -> Duration;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: Duration) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct AlertBook {
    recent: VecDeque<Alert>,
    last_fired: HashMap<(String, AlertKind), Duration>,
}

pub struct AlertManager {
    cooldown: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn AlertSink>>,
    book: Mutex<AlertBook>,
}

impl AlertManager {
    pub fn new(settings: &AlertSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: &AlertSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            cooldown: settings.cooldown,
            capacity: settings.capacity.max(1),
            clock,
            sink: None,
            book: Mutex::new(AlertBook::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn trigger(&self, scene_id: &str, kind: AlertKind, message: &str) -> bool {
        self.trigger_at(scene_id, kind, message, self.clock.now())
    }

    /// Emits unless the same `(scene_id, kind)` fired within the cooldown.
    pub fn trigger_at(&self, scene_id: &str, kind: AlertKind, message: &str, now: Duration) -> bool {
        let alert = {
            let mut book = self.lock();
            let key = (scene_id.to_string(), kind);
            if let Some(last) = book.last_fired.get(&key) {
                if now.saturating_sub(*last) <= self.cooldown {
                    log::debug!("alert {} for {} suppressed by cooldown", kind.as_str(), scene_id);
                    return false;
                }
            }
            let alert = Alert {
                kind,
                message: message.to_string(),
                scene_id: scene_id.to_string(),
                timestamp_ms: now.as_millis() as u64,
            };
            book.recent.push_front(alert.clone());
            book.recent.truncate(self.capacity);
            book.last_fired.insert(key, now);
            alert
        };

        log::info!("alert [{}] {}: {}", alert.kind.as_str(), alert.scene_id, alert.message);
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.forward(&alert) {
                log::warn!("alert sink {} failed: {}", sink.name(), err);
            }
        }
        true
    }

    /// Most recent first.
    pub fn recent(&self) -> Vec<Alert> {
        self.lock().recent.iter().cloned().collect()
    }

    pub fn recent_for(&self, scene_id: &str) -> Vec<Alert> {
        self.lock()
            .recent
            .iter()
            .filter(|alert| alert.scene_id == scene_id)
            .cloned()
            .collect()
    }

    /// Forgets cooldown state for a removed scene. Past alerts stay in the ring.
    pub fn forget_scene(&self, scene_id: &str) {
        self.lock()
            .last_fired
            .retain(|(scene, _), _| scene != scene_id);
    }

    fn lock(&self) -> MutexGuard<'_, AlertBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }
}
