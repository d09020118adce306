use anyhow::Result;
use std::time::Duration;

use super::source::DetectionSource;
use crate::{BBox, FrameDetections, RawDetection};

const STUB_FPS: f32 = 10.0;
const STUB_WIDTH: u32 = 640;
const STUB_HEIGHT: u32 = 480;

/// Synthetic source (`stub://<name>`) for demos and tests.
///
/// Emits one stationary turtle in the middle of a 640x480 frame with a stable
/// track id, at 10 fps of stream time.
pub struct StubSource {
    name: String,
    frame_count: u64,
    limit: Option<u64>,
    connected: bool,
}

impl StubSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            frame_count: 0,
            limit: None,
            connected: false,
        }
    }

    /// Ends the stream after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frame_count
    }
}

impl DetectionSource for StubSource {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("StubSource: connected to stub://{} (synthetic)", self.name);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<FrameDetections>> {
        if self.limit.map(|limit| self.frame_count >= limit).unwrap_or(false) {
            return Ok(None);
        }
        let timestamp = self.frame_count as f64 / STUB_FPS as f64;
        self.frame_count += 1;

        let mut frame = FrameDetections::empty(timestamp, STUB_FPS, STUB_WIDTH, STUB_HEIGHT);
        frame.detections.push(RawDetection {
            bbox: BBox::new(300.0, 220.0, 340.0, 260.0),
            class: "turtle".to_string(),
            score: 0.9,
            track_id: Some(1),
            source: Some("stub".to_string()),
        });
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn frame_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs_f32(1.0 / STUB_FPS))
    }
}
