use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, DetectionEvent, PERSON_CLASS_ID};

/// Colour the synthetic source paints people with.
pub const PERSON_MARKER_RGB: [u8; 3] = [255, 0, 255];

/// Minimum number of marker pixels before a person is reported.
const MIN_MARKER_PIXELS: u64 = 64;

/// Stub backend for tests and synthetic streams.
///
/// Reports a single person whose box encloses every pixel painted in
/// `PERSON_MARKER_RGB`. No model is involved.
pub struct StubBackend {
    class_id: u32,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            class_id: PERSON_CLASS_ID,
        }
    }

    /// Report marker regions under a different class index.
    pub fn with_class_id(mut self, class_id: u32) -> Self {
        self.class_id = class_id;
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<DetectionEvent>> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected,
                pixels.len()
            ));
        }

        let w = width as usize;
        let mut count = 0u64;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        for (i, px) in pixels.chunks_exact(3).enumerate() {
            if px != PERSON_MARKER_RGB {
                continue;
            }
            let (x, y) = (i % w, i / w);
            count += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        if count < MIN_MARKER_PIXELS {
            return Ok(Vec::new());
        }

        Ok(vec![DetectionEvent {
            class_id: self.class_id,
            bounding_box: BoundingBox::new(min_x as f32, min_y as f32, max_x as f32, max_y as f32),
            confidence: 0.9,
        }])
    }
}
