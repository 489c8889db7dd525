//! Annotated frame output.
//!
//! The occupancy loop hands every annotated frame to a [`FrameSink`]. The
//! daemon runs headless, so the only built-in display is a JPEG snapshot that
//! is rewritten in place every few frames.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::frame::Frame;

pub trait FrameSink: Send {
    fn present(&mut self, frame: &Frame) -> Result<()>;
}

/// Discards frames.
#[derive(Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

/// Writes every Nth frame to a JPEG file.
///
/// The file is written to `<path>.tmp` and renamed, so readers never see a
/// half-written image.
#[derive(Debug)]
pub struct JpegSnapshotSink {
    path: PathBuf,
    every_n: u64,
    quality: u8,
    presented: u64,
    written: u64,
}

impl JpegSnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            every_n: 1,
            quality: 80,
            presented: 0,
            written: 0,
        }
    }

    pub fn every(mut self, n: u64) -> Self {
        self.every_n = n.max(1);
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of snapshots written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameSink for JpegSnapshotSink {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.presented += 1;
        if (self.presented - 1) % self.every_n != 0 {
            return Ok(());
        }
        let jpeg = encode_jpeg(frame, self.quality)?;
        write_atomic(&self.path, &jpeg)
            .with_context(|| format!("write snapshot {}", self.path.display()))?;
        self.written += 1;
        log::debug!(
            "JpegSnapshotSink: frame {} -> {}",
            frame.sequence,
            self.path.display()
        );
        Ok(())
    }
}

/// Encode an RGB frame as baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(
            frame.pixels(),
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )
        .map_err(|err| anyhow!("jpeg encode failed: {}", err))?;
    Ok(out)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = BufWriter::new(File::create(&tmp_path)?);
        file.write_all(data)?;
        file.flush()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sink_writes_decodable_jpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("snap/latest.jpg");
        let mut sink = JpegSnapshotSink::new(&path);
        sink.present(&Frame::filled(32, 16, [10, 200, 30], 1)?)?;

        let bytes = fs::read(&path)?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "JPEG SOI marker");
        let decoded = image::load_from_memory(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[test]
    fn snapshot_sink_skips_between_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = JpegSnapshotSink::new(dir.path().join("s.jpg")).every(3);
        for seq in 1..=7 {
            sink.present(&Frame::filled(8, 8, [0, 0, 0], seq)?)?;
        }
        // frames 1, 4 and 7
        assert_eq!(sink.written(), 3);
        Ok(())
    }

    #[test]
    fn null_sink_accepts_anything() -> Result<()> {
        NullSink.present(&Frame::filled(8, 8, [1, 1, 1], 1)?)
    }
}
