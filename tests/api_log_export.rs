use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use occupancy_kernel::api::{ApiConfig, ApiHandle, ApiServer};
use occupancy_kernel::{
    open_source, parse_csv, run_stream, FinishedSession, MonotonicClock, NullSink,
    OccupancySession, SessionDirectory, SessionSettings, SourceConfig, StreamContext,
    StubBackend,
};

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn get(handle: &ApiHandle, path: &str, token: Option<&str>) -> Result<(String, String)> {
    let mut stream = TcpStream::connect(handle.addr)?;
    let auth = token
        .map(|t| format!("Authorization: Bearer {}\r\n", t))
        .unwrap_or_default();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n{}\r\n", path, auth);
    stream.write_all(request.as_bytes())?;
    read_response(&mut stream)
}

struct TestDaemon {
    directory: SessionDirectory,
    shutdown: Arc<AtomicBool>,
    stream: Option<JoinHandle<FinishedSession>>,
    api_handle: Option<ApiHandle>,
}

impl TestDaemon {
    /// One live `lobby` stream where a person is in view almost all the time.
    fn start() -> Result<Self> {
        let directory = SessionDirectory::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let source = open_source(&SourceConfig {
            uri: "stub://lobby?absent=1&present=1000".to_string(),
            target_fps: 100,
            width: 64,
            height: 48,
        })?;
        let ctx = StreamContext {
            name: "lobby".to_string(),
            source,
            detector: Box::new(StubBackend::new()),
            clock: Box::new(MonotonicClock::new()),
            notifiers: Vec::new(),
            sink: Box::new(NullSink),
            settings: SessionSettings::default(),
            frame_interval: Some(Duration::from_millis(5)),
            shutdown: shutdown.clone(),
            queries: Some(directory.register("lobby")?),
        };
        let stream = std::thread::spawn(move || run_stream(ctx));

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, directory.clone()).spawn()?;
        Ok(Self {
            directory,
            shutdown,
            stream: Some(stream),
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn token(&self) -> String {
        self.handle().token.clone()
    }

    fn wait_for_records(&self, min: u64) -> Result<Value> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let (headers, body) = get(self.handle(), "/sessions/lobby/status", Some(&self.token()))?;
            assert!(headers.contains("200 OK"), "{}", headers);
            let status: Value = serde_json::from_str(&body)?;
            if status["log_len"].as_u64().unwrap_or(0) >= min || Instant::now() > deadline {
                return Ok(status);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn stop_stream(&mut self) -> Option<FinishedSession> {
        self.shutdown.store(true, Ordering::SeqCst);
        let finished = self.stream.take().map(|h| h.join().expect("stream thread"));
        self.directory.unregister("lobby");
        finished
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.stop_stream();
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_needs_no_token() -> Result<()> {
    let daemon = TestDaemon::start()?;
    let (headers, body) = get(daemon.handle(), "/health", None)?;
    assert!(headers.contains("200 OK"));
    assert!(body.contains("ok"));
    Ok(())
}

#[test]
fn api_rejects_missing_and_invalid_tokens() -> Result<()> {
    let daemon = TestDaemon::start()?;

    let (headers, body) = get(daemon.handle(), "/sessions", None)?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(body.contains("missing_token"));

    let wrong = "00".repeat(32);
    let (headers, body) = get(daemon.handle(), "/sessions", Some(&wrong))?;
    assert!(headers.contains("401 Unauthorized"));
    assert!(body.contains("invalid_token"));

    let path = format!("/sessions?token={}", daemon.token());
    let (headers, _) = get(daemon.handle(), &path, None)?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn lists_sessions_and_reports_status() -> Result<()> {
    let daemon = TestDaemon::start()?;
    let (headers, body) = get(daemon.handle(), "/sessions", Some(&daemon.token()))?;
    assert!(headers.contains("200 OK"));
    let list: Value = serde_json::from_str(&body)?;
    assert_eq!(list["sessions"], serde_json::json!(["lobby"]));

    let status = daemon.wait_for_records(5)?;
    assert_eq!(status["name"], "lobby");
    assert_eq!(status["state"], "ON");
    assert!(status["stats"]["frames_processed"].as_u64().unwrap_or(0) >= 5);

    let (headers, body) = get(daemon.handle(), "/sessions/attic/status", Some(&daemon.token()))?;
    assert!(headers.contains("404"));
    assert!(body.contains("unknown_session"));
    Ok(())
}

#[test]
fn serves_recent_log_records() -> Result<()> {
    let daemon = TestDaemon::start()?;
    daemon.wait_for_records(5)?;

    let (headers, body) = get(daemon.handle(), "/sessions/lobby/log?limit=3", Some(&daemon.token()))?;
    assert!(headers.contains("200 OK"));
    let records: Value = serde_json::from_str(&body)?;
    let records = records.as_array().expect("array of records");
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.get("timestamp").is_some() && r.get("AC_status").is_some()));

    let (headers, body) = get(daemon.handle(), "/sessions/lobby/log?limit=0", Some(&daemon.token()))?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body.contains("invalid_limit"));
    Ok(())
}

#[test]
fn exports_csv_download() -> Result<()> {
    let daemon = TestDaemon::start()?;
    daemon.wait_for_records(3)?;

    let (headers, body) = get(daemon.handle(), "/sessions/lobby/log.csv", Some(&daemon.token()))?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("text/csv"));
    assert!(headers.contains("attachment; filename=\"occupancy_log.csv\""));
    assert!(body.starts_with("timestamp,person_detected,AC_status\n"));
    let records = parse_csv(body.as_bytes())?;
    assert!(records.len() >= 3);
    assert!(records.iter().any(|r| r.presence));
    Ok(())
}

#[test]
fn empty_session_reports_no_data() -> Result<()> {
    let daemon = TestDaemon::start()?;
    let rx = daemon.directory.register("idle")?;
    let responder = std::thread::spawn(move || {
        let session = OccupancySession::new("idle", &SessionSettings::default());
        while let Ok(query) = rx.recv_timeout(Duration::from_secs(2)) {
            session.answer(query);
        }
    });

    let (headers, body) = get(daemon.handle(), "/sessions/idle/log", Some(&daemon.token()))?;
    assert!(headers.contains("404"));
    assert!(body.contains("no_data"));
    assert!(body.contains("No activity logged yet."));

    let (headers, body) = get(daemon.handle(), "/sessions/idle/log.csv", Some(&daemon.token()))?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, "timestamp,person_detected,AC_status\n");

    daemon.directory.unregister("idle");
    responder.join().expect("responder thread");
    Ok(())
}

#[test]
fn finished_session_is_no_longer_served() -> Result<()> {
    let mut daemon = TestDaemon::start()?;
    daemon.wait_for_records(1)?;
    let finished = daemon.stop_stream().expect("finished session");
    assert!(!finished.records.is_empty());

    let (headers, body) = get(daemon.handle(), "/sessions/lobby/log", Some(&daemon.token()))?;
    assert!(headers.contains("404"));
    assert!(body.contains("unknown_session"));
    Ok(())
}

#[test]
fn unresponsive_session_is_unavailable() -> Result<()> {
    let daemon = TestDaemon::start()?;
    drop(daemon.directory.register("ghost")?);
    let (headers, body) = get(daemon.handle(), "/sessions/ghost/status", Some(&daemon.token()))?;
    assert!(headers.contains("503"));
    assert!(body.contains("session_unavailable"));
    Ok(())
}
