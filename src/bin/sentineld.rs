//! sentineld - Hatchery Sentinel daemon
//!
//! This daemon:
//! 1. Loads layered configuration (`SENTINEL_CONFIG` file + env overrides)
//! 2. Builds the alert manager and its optional external sink
//! 3. Registers configured scenes, one worker per scene
//! 4. Serves the loopback status API (scene state, alerts, registration)
//! 5. Stops every scene worker on Ctrl-C

use anyhow::Result;
use std::sync::{mpsc, Arc};

use hatchery_sentinel::{
    alerts::sink,
    api::{ApiConfig, ApiServer},
    AlertManager, SceneRegistry, SentinelConfig, SourceRegistry,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(SentinelConfig::load()?);

    let mut alerts = AlertManager::new(&config.alerts);
    if let Some(locator) = &config.alerts.sink {
        match sink::from_locator(locator, config.alerts.sink_timeout) {
            Ok(sink) => {
                log::info!("forwarding alerts to {} sink at {}", sink.name(), locator);
                alerts = alerts.with_sink(sink);
            }
            Err(err) => log::warn!("alert sink disabled: {:#}", err),
        }
    }
    let alerts = Arc::new(alerts);

    let scenes = Arc::new(SceneRegistry::new(
        config.clone(),
        Arc::new(SourceRegistry::with_defaults()),
        alerts,
    ));
    let started = scenes.register_all(&config.scenes);
    log::info!(
        "sentineld started {} of {} configured scenes",
        started,
        config.scenes.len()
    );

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, scenes.clone()).spawn()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("sentineld waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server and scenes...");
    api_handle.stop()?;
    scenes.shutdown();

    Ok(())
}
