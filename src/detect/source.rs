use anyhow::Result;
use std::time::Duration;

use crate::FrameDetections;

/// Supplier of per-frame detections for one scene.
///
/// Implementations wrap an external detector (or a recording of one). A
/// source is owned by exactly one scene worker; dropping it must release the
/// underlying resource.
pub trait DetectionSource: Send {
    /// Source identifier.
    fn name(&self) -> &'static str;

    /// Open the underlying stream. Called once before the first frame.
    fn connect(&mut self) -> Result<()>;

    /// Next frame of detections, or `None` when the stream has ended.
    fn next_frame(&mut self) -> Result<Option<FrameDetections>>;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Native spacing between frames, when known. Used for realtime pacing.
    fn frame_interval(&self) -> Option<Duration> {
        None
    }
}
