//! Video frames.
//!
//! A `Frame` is an interleaved RGB24 pixel buffer plus the metadata the
//! occupancy pipeline needs: a per-stream sequence number and the local wall
//! clock time at capture. The buffer length is validated on construction so
//! detectors and the annotator can index it without further checks.

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime};
use image::RgbImage;

/// Bytes per pixel of the interleaved RGB24 layout.
pub const RGB_CHANNELS: usize = 3;

pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Position in the stream, starting at 1.
    pub sequence: u64,
    /// Local wall-clock capture time.
    pub captured_at: NaiveDateTime,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u64,
        captured_at: NaiveDateTime,
    ) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at,
        })
    }

    /// Frame stamped with the current local time.
    pub fn captured_now(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        Self::new(data, width, height, sequence, Local::now().naive_local())
    }

    /// Uniformly filled frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Result<Self> {
        let len = rgb_len(width, height)?;
        let data = rgb.iter().copied().cycle().take(len).collect();
        Self::captured_now(data, width, height, sequence)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Run `draw` on the frame as an owned `RgbImage`, then take the pixels back.
    ///
    /// The buffer is moved, not copied.
    pub fn draw<F>(&mut self, draw: F) -> Result<()>
    where
        F: FnOnce(&mut RgbImage),
    {
        let (width, height) = (self.width, self.height);
        if self.data.len() != rgb_len(width, height)? {
            return Err(anyhow!("frame buffer does not match {}x{}", width, height));
        }
        let data = std::mem::take(&mut self.data);
        let mut img = match RgbImage::from_raw(width, height, data) {
            Some(img) => img,
            None => return Err(anyhow!("frame buffer does not match {}x{}", width, height)),
        };
        draw(&mut img);
        self.data = img.into_raw();
        Ok(())
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
