//! External alert sinks.
//!
//! Both sinks hand alerts to a background thread and return immediately; a
//! slow or unreachable endpoint costs at most a dropped alert and a warning.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use url::Url;

use super::Alert;

const SINK_QUEUE_DEPTH: usize = 64;
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTTS_PORT: u16 = 8883;
const DEFAULT_MQTT_TOPIC: &str = "sentinel/alerts";
const MQTT_RETRY_MIN: Duration = Duration::from_millis(100);
const MQTT_RETRY_MAX: Duration = Duration::from_secs(5);

pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Queues `alert` for delivery. Must not block on the network.
    fn forward(&self, alert: &Alert) -> Result<()>;
}

/// Checks a sink locator without connecting.
pub fn validate_locator(locator: &str) -> Result<()> {
    let url = Url::parse(locator).with_context(|| format!("invalid alert sink url {}", locator))?;
    match url.scheme() {
        "http" | "https" | "mqtt" | "mqtts" => {}
        other => return Err(anyhow!("unsupported alert sink scheme: {}", other)),
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(anyhow!("alert sink url must name a host: {}", locator));
    }
    Ok(())
}

/// Builds the sink named by `locator` (`http(s)://...` or `mqtt(s)://host:port/topic`).
pub fn from_locator(locator: &str, timeout: Duration) -> Result<Arc<dyn AlertSink>> {
    validate_locator(locator)?;
    let url = Url::parse(locator)?;
    let sink: Arc<dyn AlertSink> = match url.scheme() {
        "http" | "https" => Arc::new(HttpAlertSink::new(url, timeout)?),
        _ => Arc::new(MqttAlertSink::new(&url)?),
    };
    Ok(sink)
}

/// POSTs alert JSON to a persistence endpoint.
pub struct HttpAlertSink {
    tx: Option<SyncSender<Alert>>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    dropped: AtomicU64,
}

impl HttpAlertSink {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Alert>(SINK_QUEUE_DEPTH);
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_worker = shutdown.clone();
        let worker = std::thread::Builder::new()
            .name("alert-sink-http".to_string())
            .spawn(move || {
                let mut discarded = 0u64;
                for alert in rx {
                    // Once shutting down, queued alerts are discarded unsent.
                    if shutdown_worker.load(Ordering::SeqCst) {
                        discarded += 1;
                        continue;
                    }
                    if let Err(err) = agent.post(url.as_str()).send_json(&alert) {
                        log::warn!("alert POST to {} failed: {}", url, err);
                    }
                }
                if discarded > 0 {
                    log::warn!("http alert sink discarded {} queued alerts at shutdown", discarded);
                }
            })
            .context("spawn http alert sink")?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            shutdown,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AlertSink for HttpAlertSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn forward(&self, alert: &Alert) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("http alert sink is shut down"))?;
        match tx.try_send(alert.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(anyhow!("http alert sink queue full; alert dropped"))
            }
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("http alert sink worker exited")),
        }
    }
}

impl Drop for HttpAlertSink {
    fn drop(&mut self) {
        // Waits for at most the in-flight request; the rest of the queue is discarded.
        self.shutdown.store(true, Ordering::SeqCst);
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Publishes alerts with QoS 1 to `<topic>/<scene_id>`.
pub struct MqttAlertSink {
    client: Client,
    topic: String,
    shutdown: Arc<AtomicBool>,
}

impl MqttAlertSink {
    pub fn new(url: &Url) -> Result<Self> {
        let use_tls = url.scheme() == "mqtts";
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("mqtt sink url must name a host"))?;
        let port = url.port().unwrap_or(if use_tls {
            DEFAULT_MQTTS_PORT
        } else {
            DEFAULT_MQTT_PORT
        });
        let topic = match url.path().trim_matches('/') {
            "" => DEFAULT_MQTT_TOPIC.to_string(),
            path => path.to_string(),
        };

        let client_id = format!("hatchery-sentinel-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        let (client, connection) = Client::new(options, SINK_QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        spawn_connection(connection, shutdown.clone())?;
        log::info!("alert sink publishing to mqtt {}:{} topic {}", host, port, topic);

        Ok(Self {
            client,
            topic,
            shutdown,
        })
    }

    pub fn topic_for(&self, scene_id: &str) -> String {
        format!("{}/{}", self.topic, scene_id)
    }
}

/// Drives the event loop until the sink is dropped.
///
/// Connection errors do not end the loop: the next poll reconnects, and
/// publishes queued in the meantime go out once the broker is back.
fn spawn_connection(mut connection: Connection, shutdown: Arc<AtomicBool>) -> Result<()> {
    std::thread::Builder::new()
        .name("alert-sink-mqtt".to_string())
        .spawn(move || {
            let mut backoff = MQTT_RETRY_MIN;
            for event in connection.iter() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(_) => backoff = MQTT_RETRY_MIN,
                    Err(e) => {
                        if backoff == MQTT_RETRY_MIN {
                            log::warn!("alert sink mqtt connection error: {}", e);
                        } else {
                            log::debug!("alert sink mqtt still unreachable: {}", e);
                        }
                        std::thread::sleep(backoff);
                        backoff = (backoff * 2).min(MQTT_RETRY_MAX);
                    }
                }
            }
            log::debug!("alert sink mqtt event loop exited");
        })
        .context("spawn mqtt alert sink connection")?;
    Ok(())
}

impl AlertSink for MqttAlertSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn forward(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::to_vec(alert)?;
        self.client
            .try_publish(self.topic_for(&alert.scene_id), QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("mqtt alert publish failed: {}", e))
    }
}

impl Drop for MqttAlertSink {
    fn drop(&mut self) {
        // The event loop thread is not joined: it may be inside a connect
        // attempt to an unreachable broker. It exits on its next poll.
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("mqtt alert sink disconnect: {}", e);
        }
    }
}
