//! Loopback inspection API.
//!
//! A minimal HTTP/1.1 server on a std `TcpListener`. Every route except
//! `/health` requires `Authorization: Bearer <token>`; the token is random per
//! process and optionally written to a file with mode 0600.
//!
//! Routes:
//! - `GET /health`
//! - `GET /sessions`: running stream names
//! - `GET /sessions/{name}/status`
//! - `GET /sessions/{name}/log?limit=N`: most recent records as JSON (default 20)
//! - `GET /sessions/{name}/log.csv`: full CSV download
//!
//! Sessions are reached only through their query channels; the API holds no
//! session state of its own.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::activity_log::EXPORT_FILE_NAME;
use crate::session::{SessionDirectory, SessionQuery};

const MAX_REQUEST_BYTES: usize = 8192;
const SESSION_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
    /// Records returned by `/log` when no `limit` is given.
    pub default_log_limit: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
            token_path: None,
            default_log_limit: 20,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    directory: SessionDirectory,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, directory: SessionDirectory) -> Self {
        Self { cfg, directory }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let token_path = cfg.token_path.clone();
        let directory = self.directory;
        let expected = raw;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, directory, expected, shutdown_thread) {
                log::error!("inspection api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    directory: SessionDirectory,
    token: [u8; 32],
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &cfg, &directory, &token) {
                    log::warn!("inspection api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Parsed route.
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Health,
    Sessions,
    Status(&'a str),
    Log(&'a str),
    LogCsv(&'a str),
}

fn route(path: &str) -> Option<Route<'_>> {
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').skip(1).collect();
    match segments.as_slice() {
        ["health"] => Some(Route::Health),
        ["sessions"] => Some(Route::Sessions),
        ["sessions", name, "status"] => Some(Route::Status(*name)),
        ["sessions", name, "log"] => Some(Route::Log(*name)),
        ["sessions", name, "log.csv"] => Some(Route::LogCsv(*name)),
        _ => None,
    }
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    directory: &SessionDirectory,
    token: &[u8; 32],
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    let Some(route) = route(&request.path) else {
        write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        return Ok(());
    };
    if route == Route::Health {
        write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
        return Ok(());
    }

    if request.query_param("token").is_some() {
        write_json_response(
            &mut stream,
            400,
            r#"{"error":"token_query_param_not_allowed"}"#,
        )?;
        return Ok(());
    }
    let presented = match request.bearer_token() {
        Some(presented) => presented,
        None => {
            write_json_response(&mut stream, 401, r#"{"error":"missing_token"}"#)?;
            return Ok(());
        }
    };
    if parse_hex32(&presented).ok().as_ref() != Some(token) {
        write_json_response(&mut stream, 401, r#"{"error":"invalid_token"}"#)?;
        return Err(anyhow!("inspection api token invalid"));
    }

    match route {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::Sessions => {
            let names = directory.names()?;
            let payload = serde_json::to_vec(&SessionList { sessions: names })?;
            write_response(&mut stream, 200, "application/json", &payload, &[])
        }
        Route::Status(name) => {
            let Some(sender) = session_or_404(&mut stream, directory, name)? else {
                return Ok(());
            };
            let (tx, rx) = mpsc::channel();
            let reply = sender
                .send(SessionQuery::Status(tx))
                .ok()
                .and_then(|_| rx.recv_timeout(SESSION_REPLY_TIMEOUT).ok());
            match reply {
                Some(status) => {
                    let payload = serde_json::to_vec(&status)?;
                    write_response(&mut stream, 200, "application/json", &payload, &[])
                }
                None => session_unavailable(&mut stream),
            }
        }
        Route::Log(name) => {
            let limit = match request.query_param("limit") {
                None => cfg.default_log_limit,
                Some(raw) => match raw.parse::<usize>() {
                    Ok(limit) if limit > 0 => limit,
                    _ => {
                        return write_json_response(
                            &mut stream,
                            400,
                            r#"{"error":"invalid_limit"}"#,
                        )
                    }
                },
            };
            let Some(sender) = session_or_404(&mut stream, directory, name)? else {
                return Ok(());
            };
            let (tx, rx) = mpsc::channel();
            let reply = sender
                .send(SessionQuery::Snapshot {
                    limit: Some(limit),
                    reply: tx,
                })
                .ok()
                .and_then(|_| rx.recv_timeout(SESSION_REPLY_TIMEOUT).ok());
            match reply {
                Some(records) if records.is_empty() => write_json_response(
                    &mut stream,
                    404,
                    r#"{"error":"no_data","message":"No activity logged yet."}"#,
                ),
                Some(records) => {
                    let payload = serde_json::to_vec(&records)?;
                    write_response(&mut stream, 200, "application/json", &payload, &[])
                }
                None => session_unavailable(&mut stream),
            }
        }
        Route::LogCsv(name) => {
            let Some(sender) = session_or_404(&mut stream, directory, name)? else {
                return Ok(());
            };
            let (tx, rx) = mpsc::channel();
            let reply = sender
                .send(SessionQuery::ExportCsv(tx))
                .ok()
                .and_then(|_| rx.recv_timeout(SESSION_REPLY_TIMEOUT).ok());
            match reply {
                Some(Ok(csv)) => {
                    let disposition =
                        format!("attachment; filename=\"{}\"", EXPORT_FILE_NAME);
                    write_response(
                        &mut stream,
                        200,
                        "text/csv; charset=utf-8",
                        &csv,
                        &[("Content-Disposition", disposition.as_str())],
                    )
                }
                Some(Err(err)) => {
                    write_json_response(&mut stream, 500, r#"{"error":"export_failed"}"#)?;
                    Err(err)
                }
                None => session_unavailable(&mut stream),
            }
        }
    }
}

#[derive(Serialize)]
struct SessionList {
    sessions: Vec<String>,
}

fn session_or_404(
    stream: &mut TcpStream,
    directory: &SessionDirectory,
    name: &str,
) -> Result<Option<mpsc::Sender<SessionQuery>>> {
    let sender = directory.get(name)?;
    if sender.is_none() {
        write_json_response(stream, 404, r#"{"error":"unknown_session"}"#)?;
    }
    Ok(sender)
}

fn session_unavailable(stream: &mut TcpStream) -> Result<()> {
    write_json_response(stream, 503, r#"{"error":"session_unavailable"}"#)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        query: query.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes(), &[])
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
    extra_headers: &[(&str, &str)],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    query: String,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
