//! Frame ingestion sources.
//!
//! Every source yields validated RGB24 [`Frame`]s:
//! - `stub://` synthetic scenes with a scripted occupancy pattern (testing, demos)
//! - local V4L2 webcams such as `/dev/video0` (feature: ingest-v4l2)
//!
//! A source reports the end of a finite stream with `Ok(None)`. A transient
//! capture failure is an `Err`; the session loop logs it and keeps reading.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::frame::Frame;

pub use synthetic::{SyntheticScript, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// A stream of frames from one camera.
pub trait FrameSource: Send {
    /// Open the underlying device. Must be called before `next_frame`.
    fn connect(&mut self) -> Result<()>;

    /// Next frame, or `None` once a finite stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub frames_captured: u64,
    pub capture_errors: u64,
}

/// Where and how to capture frames.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `stub://<name>[?options]` or a V4L2 device path.
    pub uri: String,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: "stub://webcam".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// Open a source for `config.uri`.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())?));
    }
    if config.uri.starts_with("/dev/video") {
        #[cfg(feature = "ingest-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(config.clone())));
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!(
                "source {} needs the ingest-v4l2 feature",
                config.uri
            ));
        }
    }
    Err(anyhow!(
        "unsupported source '{}': expected stub://<name> or /dev/videoN",
        config.uri
    ))
}
