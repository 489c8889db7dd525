use anyhow::Result;

use crate::detect::result::DetectionEvent;

/// Object detector backend.
///
/// A backend is a black box: RGB24 pixels in, detections out. Each stream
/// session owns its own backend instance, so implementations may keep
/// per-stream state behind `&mut self` without any locking.
///
/// Implementations must treat the pixel slice as borrowed for the duration
/// of the call only.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one interleaved RGB24 frame.
    ///
    /// Bounding boxes are reported in the pixel coordinates of the input frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<DetectionEvent>>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
