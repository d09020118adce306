use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use super::source::DetectionSource;
use crate::FrameDetections;

/// Configuration for a recorded detection stream.
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// JSON-lines file, one `FrameDetections` object per line.
    pub path: PathBuf,
    /// Rewind at end of file instead of ending the stream.
    pub loop_playback: bool,
}

/// Plays back detector output recorded as JSON lines.
///
/// Blank lines and `#` comments are skipped. A line that fails to parse
/// becomes an empty frame, so a corrupt record reads as "nothing detected"
/// rather than ending the stream. When looping, timestamps are shifted so
/// they keep increasing across passes.
pub struct ReplaySource {
    config: ReplayConfig,
    reader: Option<BufReader<File>>,
    line: String,
    line_no: u64,
    frames_read: u64,
    malformed: u64,
    passes: u64,
    first_raw_timestamp: Option<f64>,
    time_offset: f64,
    last: Option<FrameDetections>,
}

/// Statistics for a replay source.
#[derive(Clone, Debug)]
pub struct ReplayStats {
    pub frames_read: u64,
    pub malformed: u64,
    pub passes: u64,
    pub path: PathBuf,
}

impl ReplaySource {
    pub fn new(config: ReplayConfig) -> Result<Self> {
        if config.path.as_os_str().is_empty() {
            return Err(anyhow!("replay source requires a file path"));
        }
        Ok(Self {
            config,
            reader: None,
            line: String::new(),
            line_no: 0,
            frames_read: 0,
            malformed: 0,
            passes: 0,
            first_raw_timestamp: None,
            time_offset: 0.0,
            last: None,
        })
    }

    pub fn stats(&self) -> ReplayStats {
        ReplayStats {
            frames_read: self.frames_read,
            malformed: self.malformed,
            passes: self.passes,
            path: self.config.path.clone(),
        }
    }

    fn interval_secs(&self) -> f64 {
        match &self.last {
            Some(frame) if frame.fps > 0.0 => 1.0 / frame.fps as f64,
            _ => 0.0,
        }
    }

    fn rewind(&mut self) -> Result<bool> {
        if !self.config.loop_playback || self.frames_read == 0 {
            return Ok(false);
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("replay source not connected"))?;
        reader.seek(SeekFrom::Start(0))?;
        self.line_no = 0;
        self.passes += 1;
        if let (Some(first), Some(last)) = (self.first_raw_timestamp, self.last.as_ref()) {
            self.time_offset = last.timestamp + self.interval_secs() - first;
        }
        log::debug!(
            "replay {} rewound (pass {})",
            self.config.path.display(),
            self.passes + 1
        );
        Ok(true)
    }

    fn placeholder_frame(&self) -> FrameDetections {
        match &self.last {
            Some(last) => FrameDetections::empty(
                last.timestamp + self.interval_secs(),
                last.fps,
                last.width,
                last.height,
            ),
            None => FrameDetections::empty(0.0, 0.0, 0, 0),
        }
    }
}

impl DetectionSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn connect(&mut self) -> Result<()> {
        let file = File::open(&self.config.path)
            .with_context(|| format!("open replay file {}", self.config.path.display()))?;
        self.reader = Some(BufReader::new(file));
        log::info!("ReplaySource: connected to {}", self.config.path.display());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<FrameDetections>> {
        loop {
            self.line.clear();
            let reader = self
                .reader
                .as_mut()
                .ok_or_else(|| anyhow!("replay source not connected"))?;
            let read = reader
                .read_line(&mut self.line)
                .with_context(|| format!("read {}", self.config.path.display()))?;
            if read == 0 {
                if self.rewind()? {
                    continue;
                }
                return Ok(None);
            }
            self.line_no += 1;

            let trimmed = self.line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let frame = match serde_json::from_str::<FrameDetections>(trimmed) {
                Ok(mut frame) => {
                    self.first_raw_timestamp.get_or_insert(frame.timestamp);
                    frame.timestamp += self.time_offset;
                    frame
                }
                Err(err) => {
                    self.malformed += 1;
                    log::warn!(
                        "replay {}:{} malformed frame treated as empty: {}",
                        self.config.path.display(),
                        self.line_no,
                        err
                    );
                    self.placeholder_frame()
                }
            };
            self.frames_read += 1;
            self.last = Some(FrameDetections::empty(
                frame.timestamp,
                frame.fps,
                frame.width,
                frame.height,
            ));
            return Ok(Some(frame));
        }
    }

    fn is_healthy(&self) -> bool {
        self.reader.is_some()
    }

    fn frame_interval(&self) -> Option<Duration> {
        let secs = self.interval_secs();
        if secs > 0.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        }
    }
}
