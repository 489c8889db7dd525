//! Synthetic `stub://` source.
//!
//! Produces a gradient background with a moving figure painted in
//! [`PERSON_MARKER_RGB`] whenever the script says someone is present, so the
//! stub detector can find it. URI options:
//!
//! - `absent=N`  frames without a person at the start of each cycle (default 20)
//! - `present=N` frames with a person after that (default 40)
//! - `frames=N`  stop after N frames (default: endless)
//! - `dropout=K` omit the figure on every Kth present frame, simulating a missed detection
//!
//! Example: `stub://lobby?absent=10&present=30&frames=200&dropout=7`.

use anyhow::{anyhow, Context, Result};

use super::{FrameSource, SourceConfig, SourceStats};
use crate::detect::PERSON_MARKER_RGB;
use crate::frame::{rgb_len, Frame};

/// Occupancy pattern parsed from a `stub://` URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyntheticScript {
    pub absent_frames: u64,
    pub present_frames: u64,
    pub total_frames: Option<u64>,
    pub dropout_every: Option<u64>,
}

impl Default for SyntheticScript {
    fn default() -> Self {
        Self {
            absent_frames: 20,
            present_frames: 40,
            total_frames: None,
            dropout_every: None,
        }
    }
}

impl SyntheticScript {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source uri must start with stub://"))?;
        let mut script = Self::default();
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(script);
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed option '{}' in {}", pair, uri))?;
            let value: u64 = value
                .parse()
                .with_context(|| format!("option {} in {} must be an integer", key, uri))?;
            match key {
                "absent" => script.absent_frames = value,
                "present" => script.present_frames = value,
                "frames" => script.total_frames = Some(value),
                "dropout" if value > 0 => script.dropout_every = Some(value),
                "dropout" => script.dropout_every = None,
                other => return Err(anyhow!("unknown option '{}' in {}", other, uri)),
            }
        }
        match script.absent_frames.checked_add(script.present_frames) {
            Some(0) => Err(anyhow!("{}: absent and present cannot both be zero", uri)),
            Some(_) => Ok(script),
            None => Err(anyhow!("{}: absent + present overflows the frame counter", uri)),
        }
    }

    /// Frames per absent/present cycle. Parsed scripts never overflow; the
    /// saturation only guards hand-built ones.
    fn cycle(&self) -> u64 {
        self.absent_frames
            .saturating_add(self.present_frames)
            .max(1)
    }

    /// Whether the scripted person is in view in frame `sequence` (1-based).
    pub fn person_in_scene(&self, sequence: u64) -> bool {
        let position = sequence.saturating_sub(1) % self.cycle();
        position >= self.absent_frames
    }

    /// Whether the figure is drawn, i.e. in scene and not dropped out.
    pub fn person_visible(&self, sequence: u64) -> bool {
        if !self.person_in_scene(sequence) {
            return false;
        }
        let present_index = sequence.saturating_sub(1) % self.cycle() - self.absent_frames + 1;
        match self.dropout_every {
            Some(k) => present_index % k != 0,
            None => true,
        }
    }
}

pub struct SyntheticSource {
    config: SourceConfig,
    script: SyntheticScript,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        rgb_len(config.width, config.height)?;
        if config.width < 8 || config.height < 8 {
            return Err(anyhow!(
                "synthetic frames must be at least 8x8, got {}x{}",
                config.width,
                config.height
            ));
        }
        let script = SyntheticScript::parse(&config.uri)?;
        Ok(Self {
            config,
            script,
            frame_count: 0,
            connected: false,
        })
    }

    pub fn script(&self) -> SyntheticScript {
        self.script
    }

    fn paint(&self, sequence: u64) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                pixels.push((x * 200 / w) as u8);
                pixels.push((y * 200 / h) as u8 + 30);
                pixels.push(96);
            }
        }

        if self.script.person_visible(sequence) {
            let (pw, ph) = ((w / 5).max(4), (h / 2).max(4));
            let travel = w.saturating_sub(pw).max(1);
            let x0 = (sequence as usize * 4) % travel;
            let y0 = h / 3;
            for y in y0..(y0 + ph).min(h) {
                for x in x0..(x0 + pw).min(w) {
                    let i = (y * w + x) * 3;
                    pixels[i..i + 3].copy_from_slice(&PERSON_MARKER_RGB);
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticSource: connected to {} ({}x{} @ {} fps)",
            self.config.uri,
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(anyhow!("synthetic source {} not connected", self.config.uri));
        }
        if let Some(total) = self.script.total_frames {
            if self.frame_count >= total {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        let pixels = self.paint(self.frame_count);
        let frame = Frame::captured_now(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )?;
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            source: self.config.uri.clone(),
            frames_captured: self.frame_count,
            capture_errors: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, PresencePolicy, StubBackend};

    fn config(uri: &str) -> SourceConfig {
        SourceConfig {
            uri: uri.to_string(),
            target_fps: 10,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn parses_script_options() -> Result<()> {
        let script = SyntheticScript::parse("stub://cam?absent=3&present=5&frames=12&dropout=2")?;
        assert_eq!(
            script,
            SyntheticScript {
                absent_frames: 3,
                present_frames: 5,
                total_frames: Some(12),
                dropout_every: Some(2),
            }
        );
        assert_eq!(SyntheticScript::parse("stub://cam")?, SyntheticScript::default());
        Ok(())
    }

    #[test]
    fn huge_cycle_without_overflow() -> Result<()> {
        let script = SyntheticScript::parse("stub://cam?absent=18446744073709551614&present=1")?;
        assert!(!script.person_in_scene(1));
        assert!(!script.person_visible(u64::MAX - 1));
        assert!(script.person_visible(u64::MAX));

        let hand_built = SyntheticScript {
            absent_frames: u64::MAX,
            present_frames: 5,
            total_frames: None,
            dropout_every: None,
        };
        assert!(!hand_built.person_in_scene(u64::MAX));
        Ok(())
    }

    #[test]
    fn rejects_bad_options() {
        assert!(SyntheticScript::parse("stub://cam?absent=x").is_err());
        assert!(SyntheticScript::parse("stub://cam?colour=3").is_err());
        assert!(SyntheticScript::parse("stub://cam?absent").is_err());
        assert!(SyntheticScript::parse("stub://cam?absent=0&present=0").is_err());
        assert!(
            SyntheticScript::parse("stub://cam?absent=18446744073709551615&present=1").is_err()
        );
    }

    #[test]
    fn script_cycles_absent_then_present() -> Result<()> {
        let script = SyntheticScript::parse("stub://cam?absent=2&present=3")?;
        let pattern: Vec<bool> = (1..=10).map(|s| script.person_in_scene(s)).collect();
        assert_eq!(
            pattern,
            vec![false, false, true, true, true, false, false, true, true, true]
        );
        Ok(())
    }

    #[test]
    fn dropout_hides_every_kth_present_frame() -> Result<()> {
        let script = SyntheticScript::parse("stub://cam?absent=1&present=4&dropout=2")?;
        let visible: Vec<bool> = (1..=5).map(|s| script.person_visible(s)).collect();
        assert_eq!(visible, vec![false, true, false, true, false]);
        Ok(())
    }

    #[test]
    fn stub_detector_sees_scripted_person() -> Result<()> {
        let mut source = SyntheticSource::new(config("stub://cam?absent=1&present=1&frames=2"))?;
        source.connect()?;
        let mut detector = StubBackend::new();
        let policy = PresencePolicy::default();

        let empty = source.next_frame()?.ok_or_else(|| anyhow!("frame 1"))?;
        let seen = detector.detect(empty.pixels(), empty.width, empty.height)?;
        assert!(!policy.presence(&seen));

        let occupied = source.next_frame()?.ok_or_else(|| anyhow!("frame 2"))?;
        let seen = detector.detect(occupied.pixels(), occupied.width, occupied.height)?;
        assert!(policy.presence(&seen));

        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn requires_connect() -> Result<()> {
        let mut source = SyntheticSource::new(config("stub://cam"))?;
        assert!(source.next_frame().is_err());
        Ok(())
    }
}
