//! sentinel_replay - run a recorded detection stream through one scene pipeline
//!
//! Reads a JSON-lines file of per-frame detections, processes every frame
//! synchronously (no pacing) and prints the final scene state and the alerts
//! raised, as JSON on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hatchery_sentinel::{
    detect::{DetectionSource, ReplayConfig, ReplaySource},
    Alert, AlertManager, ManualClock, ScenePipeline, SceneState, SentinelConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON-lines file of frame detections.
    input: PathBuf,
    /// Scene id to report under.
    #[arg(long, default_value = "replay")]
    scene_id: String,
    /// Override the confirmation window (frames).
    #[arg(long)]
    window: Option<usize>,
    /// Process every Kth frame.
    #[arg(long)]
    frame_skip: Option<u32>,
    /// Drive the alert cooldown from frame timestamps instead of wall time.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    stream_time: bool,
    /// Print each frame's scene state as it is produced.
    #[arg(long)]
    trace: bool,
}

#[derive(Serialize)]
struct ReplaySummary {
    frames_read: u64,
    frames_processed: u64,
    malformed: u64,
    state: SceneState,
    alerts: Vec<Alert>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = SentinelConfig::load()?;
    if let Some(window) = args.window {
        config.confirmation.window = window.max(1);
    }
    if let Some(frame_skip) = args.frame_skip {
        config.pipeline.frame_skip = frame_skip.max(1);
    }

    let clock = Arc::new(ManualClock::new(Duration::ZERO));
    let alerts = if args.stream_time {
        Arc::new(AlertManager::with_clock(&config.alerts, clock.clone()))
    } else {
        Arc::new(AlertManager::new(&config.alerts))
    };
    let mut pipeline = ScenePipeline::new(&args.scene_id, &config, alerts.clone());

    let mut source = ReplaySource::new(ReplayConfig {
        path: args.input.clone(),
        loop_playback: false,
    })?;
    source
        .connect()
        .with_context(|| format!("open {}", args.input.display()))?;

    while let Some(frame) = source.next_frame()? {
        if frame.timestamp.is_finite() && frame.timestamp >= 0.0 {
            clock.set(Duration::from_secs_f64(frame.timestamp));
        }
        if let Some(report) = pipeline.offer(&frame) {
            if args.trace {
                println!("{}", serde_json::to_string(&report.state)?);
            }
        }
    }

    let stats = source.stats();
    let summary = ReplaySummary {
        frames_read: stats.frames_read,
        frames_processed: pipeline.state().frames_processed,
        malformed: stats.malformed,
        state: pipeline.state().clone(),
        alerts: alerts.recent(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
