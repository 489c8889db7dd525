//! occupancyd - occupancy actuator daemon
//!
//! This daemon:
//! 1. Loads the daemon config (file, then `OCCUPANCY_*` env overrides)
//! 2. Starts one session thread per configured stream
//! 3. Serves session status and CSV activity logs on the loopback API
//! 4. Switches each stream's actuator through the log (and optional MQTT) notifiers
//! 5. Archives finished sessions to SQLite on shutdown

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use occupancy_kernel::{
    api::{ApiConfig, ApiServer},
    config::StreamSettings,
    open_source, ActuatorNotifier, BackendRegistry, FinishedSession, FrameSink, JpegSnapshotSink,
    LogArchive, LogNotifier, MonotonicClock, NullSink, OccupancydConfig, SessionDirectory,
    SqliteLogArchive, StreamContext,
};

enum DaemonEvent {
    Interrupt,
    StreamDone(FinishedSession),
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = OccupancydConfig::load()?;

    let mut registry =
        BackendRegistry::with_builtin(cfg.detector.model_path.as_deref(), cfg.presence_policy());
    registry.set_default(&cfg.detector.backend)?;

    let directory = SessionDirectory::new();
    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        token_path: cfg.api_token_path.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, directory.clone()).spawn()?;
    log::info!("occupancy api listening on {}", api_handle.addr);
    if let Some(path) = &api_handle.token_path {
        log::info!("occupancy api token written to {}", path.display());
    } else {
        log::warn!("occupancy api token (handle securely): {}", api_handle.token);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel::<DaemonEvent>();
    {
        let shutdown = Arc::clone(&shutdown);
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            let _ = tx.send(DaemonEvent::Interrupt);
        })
        .expect("error setting Ctrl-C handler");
    }

    let settings = cfg.session_settings()?;
    let mut workers = Vec::new();
    for stream in &cfg.streams {
        let ctx = StreamContext {
            name: stream.name.clone(),
            source: open_source(&stream.source_config())?,
            detector: registry.create_default()?,
            clock: Box::new(MonotonicClock::new()),
            notifiers: build_notifiers(&cfg, stream)?,
            sink: build_sink(stream),
            settings: settings.clone(),
            frame_interval: Some(stream.frame_interval()),
            shutdown: Arc::clone(&shutdown),
            queries: Some(directory.register(&stream.name)?),
        };
        let tx = tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("stream-{}", stream.name))
            .spawn(move || {
                let finished = occupancy_kernel::run_stream(ctx);
                let _ = tx.send(DaemonEvent::StreamDone(finished));
            })
            .map_err(|e| anyhow!("spawn stream thread {}: {}", stream.name, e))?;
        workers.push(handle);
    }
    drop(tx);

    log::info!(
        "occupancyd running: {} stream(s), detector={}, vacancy_timeout={:?}",
        workers.len(),
        cfg.detector.backend,
        settings.vacancy_timeout
    );

    let mut finished = Vec::with_capacity(workers.len());
    while finished.len() < workers.len() {
        match rx.recv() {
            Ok(DaemonEvent::Interrupt) => {
                log::info!("shutdown requested; stopping streams");
            }
            Ok(DaemonEvent::StreamDone(session)) => {
                directory.unregister(&session.name);
                log::info!("{}", session.summary());
                finished.push(session);
            }
            Err(_) => break,
        }
    }
    for handle in workers {
        if handle.join().is_err() {
            log::error!("stream thread panicked");
        }
    }

    if let Some(db_path) = &cfg.archive_db_path {
        let mut archive = SqliteLogArchive::open(db_path)?;
        for session in &finished {
            archive.archive_session(session)?;
        }
        log::info!("archived {} session(s) to {}", finished.len(), db_path);
    }

    api_handle.stop()?;
    Ok(())
}

fn build_notifiers(
    cfg: &OccupancydConfig,
    stream: &StreamSettings,
) -> Result<Vec<Box<dyn ActuatorNotifier>>> {
    let mut notifiers: Vec<Box<dyn ActuatorNotifier>> = vec![Box::new(LogNotifier)];

    #[cfg(feature = "actuator-mqtt")]
    if let Some(mqtt) = &cfg.mqtt {
        let settings = occupancy_kernel::MqttSettings {
            broker_addr: mqtt.broker_addr.clone(),
            topic_prefix: mqtt.topic_prefix.clone(),
            client_id: "occupancyd".to_string(),
        };
        notifiers.push(Box::new(occupancy_kernel::MqttNotifier::connect(
            &settings,
            &stream.name,
        )?));
    }
    #[cfg(not(feature = "actuator-mqtt"))]
    if cfg.mqtt.is_some() {
        log::warn!(
            "{}: mqtt configured but actuator-mqtt feature is disabled",
            stream.name
        );
    }

    Ok(notifiers)
}

fn build_sink(stream: &StreamSettings) -> Box<dyn FrameSink> {
    match &stream.snapshot_path {
        Some(path) => {
            Box::new(JpegSnapshotSink::new(path).every(u64::from(stream.target_fps.max(1))))
        }
        None => Box::new(NullSink),
    }
}
