use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::annotate::AnnotatorStyle;
use crate::detect::{PresencePolicy, DEFAULT_MIN_CONFIDENCE, PERSON_CLASS_ID};
use crate::ingest::SourceConfig;
use crate::session::SessionSettings;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_VACANCY_TIMEOUT_SECS: f64 = 3.0;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_ACTUATOR_LABEL: &str = "AC";
const DEFAULT_STREAM_NAME: &str = "default";
const DEFAULT_SOURCE: &str = "stub://webcam";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_MQTT_PREFIX: &str = "occupancy";

#[derive(Debug, Deserialize, Default)]
struct OccupancydConfigFile {
    api: Option<ApiConfigFile>,
    controller: Option<ControllerConfigFile>,
    detector: Option<DetectorConfigFile>,
    log: Option<LogConfigFile>,
    archive: Option<ArchiveConfigFile>,
    streams: Option<Vec<StreamConfigFile>>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ControllerConfigFile {
    vacancy_timeout_secs: Option<f64>,
    actuator_label: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<String>,
    person_class_id: Option<u32>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct LogConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ArchiveConfigFile {
    db_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamConfigFile {
    name: String,
    source: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct MqttConfigFile {
    broker_addr: String,
    topic_prefix: Option<String>,
}

/// Daemon configuration: config file first, then environment overrides.
#[derive(Debug, Clone)]
pub struct OccupancydConfig {
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub vacancy_timeout_secs: f64,
    pub actuator_label: String,
    pub detector: DetectorSettings,
    pub log_capacity: Option<usize>,
    pub archive_db_path: Option<String>,
    pub streams: Vec<StreamSettings>,
    pub mqtt: Option<MqttBrokerSettings>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<String>,
    pub person_class_id: u32,
    pub min_confidence: f32,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub name: String,
    pub source: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MqttBrokerSettings {
    pub broker_addr: String,
    pub topic_prefix: String,
}

impl OccupancydConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("OCCUPANCY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: OccupancydConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let controller = file.controller.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let streams = match file.streams {
            Some(streams) if !streams.is_empty() => streams
                .into_iter()
                .map(|s| StreamSettings {
                    name: s.name,
                    source: s.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                    target_fps: s.target_fps.unwrap_or(DEFAULT_FPS),
                    width: s.width.unwrap_or(DEFAULT_WIDTH),
                    height: s.height.unwrap_or(DEFAULT_HEIGHT),
                    snapshot_path: s.snapshot_path,
                })
                .collect(),
            _ => vec![StreamSettings::default()],
        };

        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            api_token_path: api.token_path,
            vacancy_timeout_secs: controller
                .vacancy_timeout_secs
                .unwrap_or(DEFAULT_VACANCY_TIMEOUT_SECS),
            actuator_label: controller
                .actuator_label
                .unwrap_or_else(|| DEFAULT_ACTUATOR_LABEL.to_string()),
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: detector.model_path,
                person_class_id: detector.person_class_id.unwrap_or(PERSON_CLASS_ID),
                min_confidence: detector.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            },
            log_capacity: file.log.and_then(|log| log.capacity),
            archive_db_path: file.archive.and_then(|archive| archive.db_path),
            streams,
            mqtt: file.mqtt.map(|mqtt| MqttBrokerSettings {
                broker_addr: mqtt.broker_addr,
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_PREFIX.to_string()),
            }),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("OCCUPANCY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = non_empty_env("OCCUPANCY_API_TOKEN_PATH") {
            self.api_token_path = Some(PathBuf::from(path));
        }
        if let Some(source) = non_empty_env("OCCUPANCY_SOURCE") {
            if let Some(first) = self.streams.first_mut() {
                first.source = source;
            }
        }
        if let Some(raw) = non_empty_env("OCCUPANCY_VACANCY_TIMEOUT_SECS") {
            self.vacancy_timeout_secs = raw.trim().parse().map_err(|_| {
                anyhow!("OCCUPANCY_VACANCY_TIMEOUT_SECS must be a number of seconds")
            })?;
        }
        if let Some(raw) = non_empty_env("OCCUPANCY_PERSON_CLASS_ID") {
            self.detector.person_class_id = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_PERSON_CLASS_ID must be a non-negative integer"))?;
        }
        if let Some(raw) = non_empty_env("OCCUPANCY_MIN_CONFIDENCE") {
            self.detector.min_confidence = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_MIN_CONFIDENCE must be a number"))?;
        }
        if let Some(raw) = non_empty_env("OCCUPANCY_LOG_CAPACITY") {
            let capacity: usize = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("OCCUPANCY_LOG_CAPACITY must be a positive integer"))?;
            self.log_capacity = Some(capacity);
        }
        if let Some(path) = non_empty_env("OCCUPANCY_ARCHIVE_DB") {
            self.archive_db_path = Some(path);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        parse_vacancy_timeout(self.vacancy_timeout_secs)?;
        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(anyhow!("min_confidence must be within [0, 1]"));
        }
        if self.log_capacity == Some(0) {
            return Err(anyhow!("log capacity must be greater than zero"));
        }
        if self.actuator_label.trim().is_empty() {
            return Err(anyhow!("actuator label must not be empty"));
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            validate_stream_name(&stream.name)?;
            if !seen.insert(stream.name.as_str()) {
                return Err(anyhow!("duplicate stream name '{}'", stream.name));
            }
            if stream.target_fps == 0 {
                return Err(anyhow!("stream '{}': target_fps must be > 0", stream.name));
            }
            if stream.width == 0 || stream.height == 0 {
                return Err(anyhow!("stream '{}': frame size must be non-zero", stream.name));
            }
        }
        Ok(())
    }

    pub fn vacancy_timeout(&self) -> Result<Duration> {
        parse_vacancy_timeout(self.vacancy_timeout_secs)
    }

    pub fn presence_policy(&self) -> PresencePolicy {
        PresencePolicy {
            person_class_id: self.detector.person_class_id,
            min_confidence: self.detector.min_confidence,
        }
    }

    pub fn session_settings(&self) -> Result<SessionSettings> {
        Ok(SessionSettings {
            vacancy_timeout: self.vacancy_timeout()?,
            policy: self.presence_policy(),
            log_capacity: self.log_capacity,
            style: AnnotatorStyle {
                actuator_label: self.actuator_label.clone(),
                ..AnnotatorStyle::default()
            },
        })
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_STREAM_NAME.to_string(),
            source: DEFAULT_SOURCE.to_string(),
            target_fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            snapshot_path: None,
        }
    }
}

impl StreamSettings {
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            uri: self.source.clone(),
            target_fps: self.target_fps,
            width: self.width,
            height: self.height,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.target_fps.max(1)
    }
}

/// Seconds to a vacancy timeout. Rejects NaN, negatives and values too
/// large for a `Duration`.
pub fn parse_vacancy_timeout(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| {
        anyhow!(
            "vacancy timeout must be a finite, non-negative number of seconds, got {}: {}",
            secs,
            e
        )
    })
}

/// Stream names: 1..64 of `[a-z0-9_-]`. They appear in API paths and MQTT topics.
pub fn validate_stream_name(name: &str) -> Result<()> {
    static STREAM_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = STREAM_NAME_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());
    if !re.is_match(name) {
        return Err(anyhow!(
            "stream name '{}' must match ^[a-z0-9_-]{{1,64}}$",
            name
        ));
    }
    Ok(())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<OccupancydConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() -> Result<()> {
        let mut cfg = OccupancydConfig::from_file(OccupancydConfigFile::default());
        cfg.validate()?;
        assert_eq!(cfg.api_addr, DEFAULT_API_ADDR);
        assert_eq!(cfg.vacancy_timeout()?, Duration::from_secs(3));
        assert_eq!(cfg.detector.backend, "stub");
        assert_eq!(cfg.streams.len(), 1);
        assert_eq!(cfg.streams[0].name, "default");
        assert_eq!(cfg.streams[0].source, "stub://webcam");
        assert_eq!(cfg.presence_policy(), PresencePolicy::default());
        Ok(())
    }

    #[test]
    fn stream_names_are_restricted() {
        assert!(validate_stream_name("lobby_cam-2").is_ok());
        assert!(validate_stream_name("Lobby").is_err());
        assert!(validate_stream_name("").is_err());
        assert!(validate_stream_name("a/b").is_err());
        assert!(validate_stream_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let base = || OccupancydConfig::from_file(OccupancydConfigFile::default());

        let mut cfg = base();
        cfg.vacancy_timeout_secs = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.vacancy_timeout_secs = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.vacancy_timeout_secs = 1e300;
        assert!(cfg.validate().is_err(), "overflows Duration");

        let mut cfg = base();
        cfg.vacancy_timeout_secs = f64::INFINITY;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.detector.min_confidence = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.log_capacity = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.streams.push(StreamSettings::default());
        assert!(cfg.validate().is_err(), "duplicate names");

        let mut cfg = base();
        cfg.streams[0].target_fps = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn vacancy_timeout_conversion() {
        assert_eq!(
            parse_vacancy_timeout(0.25).ok(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_vacancy_timeout(0.0).ok(), Some(Duration::ZERO));
        assert!(parse_vacancy_timeout(-0.5).is_err());
        assert!(parse_vacancy_timeout(f64::MAX).is_err());
    }

    #[test]
    fn frame_interval_follows_fps() {
        let stream = StreamSettings {
            target_fps: 4,
            ..StreamSettings::default()
        };
        assert_eq!(stream.frame_interval(), Duration::from_millis(250));
    }
}
