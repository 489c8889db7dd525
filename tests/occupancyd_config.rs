use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use occupancy_kernel::config::OccupancydConfig;
use occupancy_kernel::detect::PERSON_CLASS_ID;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "OCCUPANCY_CONFIG",
        "OCCUPANCY_API_ADDR",
        "OCCUPANCY_API_TOKEN_PATH",
        "OCCUPANCY_SOURCE",
        "OCCUPANCY_VACANCY_TIMEOUT_SECS",
        "OCCUPANCY_PERSON_CLASS_ID",
        "OCCUPANCY_MIN_CONFIDENCE",
        "OCCUPANCY_LOG_CAPACITY",
        "OCCUPANCY_ARCHIVE_DB",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = OccupancydConfig::load().expect("load defaults");
    assert_eq!(cfg.api_addr, "127.0.0.1:8800");
    assert_eq!(cfg.vacancy_timeout().unwrap(), Duration::from_secs(3));
    assert_eq!(cfg.detector.backend, "stub");
    assert_eq!(cfg.detector.person_class_id, PERSON_CLASS_ID);
    assert!((cfg.detector.min_confidence - 0.4).abs() < f32::EPSILON);
    assert_eq!(cfg.streams.len(), 1);
    assert_eq!(cfg.streams[0].name, "default");
    assert_eq!(cfg.streams[0].source, "stub://webcam");
    assert!(cfg.mqtt.is_none());
    assert!(cfg.archive_db_path.is_none());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let token_path = file.path().with_extension("token");
    let json = format!(
        r#"{{
            "api": {{
                "addr": "127.0.0.1:9000",
                "token_path": "{}"
            }},
            "controller": {{
                "vacancy_timeout_secs": 5.5,
                "actuator_label": "Lights"
            }},
            "detector": {{
                "backend": "stub",
                "min_confidence": 0.6
            }},
            "log": {{ "capacity": 1000 }},
            "streams": [
                {{ "name": "office", "source": "stub://office", "target_fps": 5 }},
                {{ "name": "lobby", "width": 320, "height": 240 }}
            ],
            "mqtt": {{ "broker_addr": "mqtt://broker.local:1883" }}
        }}"#,
        token_path.display()
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("OCCUPANCY_CONFIG", file.path());
    std::env::set_var("OCCUPANCY_SOURCE", "stub://override");
    std::env::set_var("OCCUPANCY_VACANCY_TIMEOUT_SECS", "10");
    std::env::set_var("OCCUPANCY_ARCHIVE_DB", "sessions.db");

    let cfg = OccupancydConfig::load().expect("load config");

    assert_eq!(cfg.api_addr, "127.0.0.1:9000");
    assert_eq!(cfg.api_token_path.clone().unwrap(), token_path);
    assert_eq!(cfg.vacancy_timeout().unwrap(), Duration::from_secs(10));
    assert_eq!(cfg.actuator_label, "Lights");
    assert!((cfg.detector.min_confidence - 0.6).abs() < f32::EPSILON);
    assert_eq!(cfg.log_capacity, Some(1000));
    assert_eq!(cfg.archive_db_path.as_deref(), Some("sessions.db"));

    assert_eq!(cfg.streams.len(), 2);
    assert_eq!(cfg.streams[0].name, "office");
    assert_eq!(cfg.streams[0].source, "stub://override");
    assert_eq!(cfg.streams[0].target_fps, 5);
    assert_eq!(cfg.streams[1].name, "lobby");
    assert_eq!(cfg.streams[1].source, "stub://webcam");
    assert_eq!(cfg.streams[1].width, 320);

    let mqtt = cfg.mqtt.as_ref().expect("mqtt settings");
    assert_eq!(mqtt.broker_addr, "mqtt://broker.local:1883");
    assert_eq!(mqtt.topic_prefix, "occupancy");

    let settings = cfg.session_settings().unwrap();
    assert_eq!(settings.vacancy_timeout, Duration::from_secs(10));
    assert_eq!(settings.style.actuator_label, "Lights");
    assert_eq!(settings.log_capacity, Some(1000));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[controller]
vacancy_timeout_secs = 0.5

[[streams]]
name = "garage"
source = "stub://garage?absent=5&present=5"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("OCCUPANCY_CONFIG", file.path());

    let cfg = OccupancydConfig::load().expect("load toml config");
    assert_eq!(cfg.vacancy_timeout().unwrap(), Duration::from_millis(500));
    assert_eq!(cfg.streams.len(), 1);
    assert_eq!(cfg.streams[0].name, "garage");
    assert_eq!(cfg.streams[0].frame_interval(), Duration::from_millis(100));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("OCCUPANCY_VACANCY_TIMEOUT_SECS", "-1");
    assert!(OccupancydConfig::load().is_err());
    clear_env();

    std::env::set_var("OCCUPANCY_VACANCY_TIMEOUT_SECS", "soon");
    assert!(OccupancydConfig::load().is_err());
    clear_env();

    std::env::set_var("OCCUPANCY_MIN_CONFIDENCE", "1.5");
    assert!(OccupancydConfig::load().is_err());
    clear_env();

    std::env::set_var("OCCUPANCY_LOG_CAPACITY", "0");
    assert!(OccupancydConfig::load().is_err());
    clear_env();
}

#[test]
fn oversized_vacancy_timeout_is_a_config_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("OCCUPANCY_VACANCY_TIMEOUT_SECS", "1e300");
    let err = OccupancydConfig::load().expect_err("timeout beyond Duration range");
    assert!(err.to_string().contains("vacancy timeout"), "{:#}", err);
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(
        &mut file,
        br#"{ "controller": { "vacancy_timeout_secs": 1.8e19 } }"#,
    )
    .expect("write config");
    std::env::set_var("OCCUPANCY_CONFIG", file.path());
    assert!(OccupancydConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_bad_stream_names() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for streams in [
        r#"[{ "name": "Front Door" }]"#,
        r#"[{ "name": "a" }, { "name": "a" }]"#,
        r#"[{ "name": "ok", "target_fps": 0 }]"#,
    ] {
        let mut file = NamedTempFile::new().expect("temp config");
        let json = format!(r#"{{ "streams": {} }}"#, streams);
        std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
        std::env::set_var("OCCUPANCY_CONFIG", file.path());
        assert!(OccupancydConfig::load().is_err(), "accepted {}", streams);
    }

    clear_env();
}
