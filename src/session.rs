//! Stream sessions.
//!
//! An `OccupancySession` owns everything stateful about one stream: the
//! debounce controller, the activity log, the presence policy and the
//! annotator. Sessions share nothing. The daemon runs one session per stream
//! on its own thread via [`run_stream`]; the inspection API reaches a session
//! only through its query channel.

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::activity_log::{ActivityLog, LogRecord, TIMESTAMP_FORMAT};
use crate::actuator::{ActuatorNotifier, Transition};
use crate::annotate::{AnnotatorStyle, FrameAnnotator};
use crate::controller::{ActuatorState, OccupancyController, SessionClock, DEFAULT_VACANCY_TIMEOUT};
use crate::detect::{DetectionEvent, DetectorBackend, PresencePolicy};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::sink::FrameSink;

/// Consecutive capture failures tolerated before a stream is abandoned.
pub const MAX_CONSECUTIVE_CAPTURE_ERRORS: u32 = 10;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub vacancy_timeout: Duration,
    pub policy: PresencePolicy,
    /// `None` keeps every record for the session lifetime.
    pub log_capacity: Option<usize>,
    pub style: AnnotatorStyle,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            vacancy_timeout: DEFAULT_VACANCY_TIMEOUT,
            policy: PresencePolicy::default(),
            log_capacity: None,
            style: AnnotatorStyle::default(),
        }
    }
}

/// What happened to one frame.
#[derive(Clone, Debug)]
pub struct FrameOutcome {
    pub sequence: u64,
    pub presence: bool,
    pub person_count: usize,
    pub state: ActuatorState,
    pub transition: Option<Transition>,
    /// Set when the detector failed and the frame was treated as empty.
    pub detector_error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_processed: u64,
    pub frames_with_presence: u64,
    pub detector_failures: u64,
    pub annotation_failures: u64,
    pub transitions_on: u64,
    pub transitions_off: u64,
    pub clock_regressions: u64,
}

/// Point-in-time view of a session, served by the inspection API.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub id: String,
    #[serde(with = "crate::activity_log::log_timestamp")]
    pub started_at: NaiveDateTime,
    pub state: ActuatorState,
    pub vacancy_timeout_secs: f64,
    pub seconds_since_last_seen: Option<f64>,
    pub remaining_grace_secs: Option<f64>,
    pub log_len: usize,
    pub log_evicted: u64,
    pub latest: Option<LogRecord>,
    pub stats: SessionStats,
}

pub struct OccupancySession {
    name: String,
    id: String,
    started_at: NaiveDateTime,
    controller: OccupancyController,
    log: ActivityLog,
    policy: PresencePolicy,
    annotator: FrameAnnotator,
    stats: SessionStats,
    last_now: Duration,
}

impl OccupancySession {
    pub fn new(name: &str, settings: &SessionSettings) -> Self {
        let log = match settings.log_capacity {
            Some(capacity) => ActivityLog::with_capacity(capacity),
            None => ActivityLog::new(),
        };
        Self {
            name: name.to_string(),
            id: new_session_id(),
            started_at: Local::now().naive_local(),
            controller: OccupancyController::new(settings.vacancy_timeout),
            log,
            policy: settings.policy,
            annotator: FrameAnnotator::new(settings.policy, settings.style.clone()),
            stats: SessionStats::default(),
            last_now: Duration::ZERO,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ActuatorState {
        self.controller.state()
    }

    pub fn log(&self) -> &ActivityLog {
        &self.log
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Run one frame through presence derivation, the controller, the log
    /// and the annotator, in that order.
    ///
    /// A detector error counts as "no detections" for this frame; it is
    /// reported in the outcome and the stats but never aborts the session.
    pub fn process_frame(
        &mut self,
        frame: &mut Frame,
        detections: Result<Vec<DetectionEvent>>,
        now: Duration,
    ) -> FrameOutcome {
        let (detections, detector_error) = match detections {
            Ok(detections) => (detections, None),
            Err(err) => {
                self.stats.detector_failures += 1;
                log::warn!(
                    "{}: detector failed on frame {}; treating as no detections: {:#}",
                    self.name,
                    frame.sequence,
                    err
                );
                (Vec::new(), Some(format!("{:#}", err)))
            }
        };

        let person_count = self.policy.persons(&detections).count();
        let presence = person_count > 0;
        let observation = self.controller.observe(presence, now);
        self.last_now = self.last_now.max(now);
        self.log.append(frame.captured_at, presence, observation.state);

        self.stats.frames_processed += 1;
        self.stats.clock_regressions = self.controller.clock_regressions();
        if presence {
            self.stats.frames_with_presence += 1;
        }

        let transition = observation.transitioned.then(|| {
            match observation.state {
                ActuatorState::On => self.stats.transitions_on += 1,
                ActuatorState::Off => self.stats.transitions_off += 1,
            }
            Transition {
                stream: self.name.clone(),
                state: observation.state,
                at: frame.captured_at,
            }
        });

        if let Err(err) = self.annotator.annotate(frame, observation.state, &detections) {
            self.stats.annotation_failures += 1;
            log::warn!(
                "{}: annotation failed on frame {}: {:#}",
                self.name,
                frame.sequence,
                err
            );
        }

        FrameOutcome {
            sequence: frame.sequence,
            presence,
            person_count,
            state: observation.state,
            transition,
            detector_error,
        }
    }

    pub fn status(&self) -> SessionStatus {
        let now = self.last_now;
        SessionStatus {
            name: self.name.clone(),
            id: self.id.clone(),
            started_at: self.started_at,
            state: self.controller.state(),
            vacancy_timeout_secs: self.controller.vacancy_timeout().as_secs_f64(),
            seconds_since_last_seen: self
                .controller
                .last_seen()
                .map(|seen| now.saturating_sub(seen).as_secs_f64()),
            remaining_grace_secs: self
                .controller
                .remaining_grace(now)
                .map(|d| d.as_secs_f64()),
            log_len: self.log.len(),
            log_evicted: self.log.evicted(),
            latest: self.log.latest().cloned(),
            stats: self.stats.clone(),
        }
    }

    /// Answer an inspection query. Replies to hung-up callers are dropped.
    pub fn answer(&self, query: SessionQuery) {
        match query {
            SessionQuery::Status(reply) => {
                let _ = reply.send(self.status());
            }
            SessionQuery::Snapshot { limit, reply } => {
                let _ = reply.send(self.log.snapshot(limit));
            }
            SessionQuery::ExportCsv(reply) => {
                let _ = reply.send(self.log.export_csv());
            }
        }
    }

    /// End the session, handing over its records. The controller is dropped.
    pub fn finish(mut self, reason: StreamEnd) -> FinishedSession {
        let ended_at = Local::now().naive_local();
        log::info!(
            "{}: session {} ended ({}) after {} frames",
            self.name,
            self.id,
            reason,
            self.stats.frames_processed
        );
        FinishedSession {
            name: self.name,
            id: self.id,
            started_at: self.started_at,
            ended_at,
            records: self.log.drain(),
            stats: self.stats,
            final_state: self.controller.state(),
            end_reason: reason,
        }
    }
}

/// Why a stream stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    Exhausted,
    Shutdown,
    SourceFailed(String),
}

impl std::fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamEnd::Exhausted => write!(f, "source exhausted"),
            StreamEnd::Shutdown => write!(f, "shutdown"),
            StreamEnd::SourceFailed(err) => write!(f, "source failed: {}", err),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FinishedSession {
    pub name: String,
    pub id: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub records: Vec<LogRecord>,
    pub stats: SessionStats,
    pub final_state: ActuatorState,
    pub end_reason: StreamEnd,
}

impl FinishedSession {
    pub fn summary(&self) -> String {
        format!(
            "{} [{}] {} .. {}: {} records, {} ON / {} OFF transitions, {} detector failures, final {}",
            self.name,
            self.id,
            self.started_at.format(TIMESTAMP_FORMAT),
            self.ended_at.format(TIMESTAMP_FORMAT),
            self.records.len(),
            self.stats.transitions_on,
            self.stats.transitions_off,
            self.stats.detector_failures,
            self.final_state
        )
    }
}

/// Read-only requests a running session answers between frames and while
/// it waits for the next one.
pub enum SessionQuery {
    Status(Sender<SessionStatus>),
    Snapshot {
        limit: Option<usize>,
        reply: Sender<Vec<LogRecord>>,
    },
    ExportCsv(Sender<Result<Vec<u8>>>),
}

/// Name-to-channel map of running sessions.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    inner: Arc<Mutex<HashMap<String, Sender<SessionQuery>>>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream name and return the receiving end of its query channel.
    pub fn register(&self, name: &str) -> Result<Receiver<SessionQuery>> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| anyhow!("session directory lock poisoned"))?;
        if map.contains_key(name) {
            return Err(anyhow!("session '{}' already registered", name));
        }
        let (tx, rx) = mpsc::channel();
        map.insert(name.to_string(), tx);
        Ok(rx)
    }

    pub fn unregister(&self, name: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(name);
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<Sender<SessionQuery>>> {
        let map = self
            .inner
            .lock()
            .map_err(|_| anyhow!("session directory lock poisoned"))?;
        Ok(map.get(name).cloned())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let map = self
            .inner
            .lock()
            .map_err(|_| anyhow!("session directory lock poisoned"))?;
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Everything one stream thread owns.
pub struct StreamContext {
    pub name: String,
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn DetectorBackend>,
    pub clock: Box<dyn SessionClock>,
    pub notifiers: Vec<Box<dyn ActuatorNotifier>>,
    pub sink: Box<dyn FrameSink>,
    pub settings: SessionSettings,
    /// Minimum spacing between frames; `None` runs as fast as the source allows.
    pub frame_interval: Option<Duration>,
    pub shutdown: Arc<AtomicBool>,
    pub queries: Option<Receiver<SessionQuery>>,
}

/// Longest a query waits while the session has no frame to process.
const QUERY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long a finished stream waits for its capture thread before detaching it.
const CAPTURE_JOIN_GRACE: Duration = Duration::from_secs(1);

enum Captured {
    Frame(Frame),
    End(StreamEnd),
}

/// Drive one stream until it ends, then return its session.
///
/// Capture runs on its own thread feeding a one-slot channel, so a
/// `next_frame` call that blocks inside a driver never delays query replies.
pub fn run_stream(ctx: StreamContext) -> FinishedSession {
    let StreamContext {
        name,
        mut source,
        mut detector,
        mut clock,
        mut notifiers,
        mut sink,
        settings,
        frame_interval,
        shutdown,
        queries,
    } = ctx;

    let mut session = OccupancySession::new(&name, &settings);
    log::info!(
        "{}: session {} started (detector={}, vacancy_timeout={:?})",
        name,
        session.id(),
        detector.name(),
        settings.vacancy_timeout
    );

    if let Err(err) = source.connect() {
        log::error!("{}: source connect failed: {:#}", name, err);
        return session.finish(StreamEnd::SourceFailed(format!("{:#}", err)));
    }
    if let Err(err) = detector.warm_up() {
        log::warn!("{}: detector warm-up failed: {:#}", name, err);
    }

    let (frames, capture) =
        match spawn_capture(&name, source, frame_interval, Arc::clone(&shutdown)) {
            Ok(spawned) => spawned,
            Err(err) => return session.finish(StreamEnd::SourceFailed(format!("{:#}", err))),
        };

    let mut last_health_log = Instant::now();
    let end = loop {
        if shutdown.load(Ordering::SeqCst) {
            break StreamEnd::Shutdown;
        }

        if let Some(rx) = &queries {
            loop {
                match rx.try_recv() {
                    Ok(query) => session.answer(query),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }

        let mut frame = match frames.recv_timeout(QUERY_POLL_INTERVAL) {
            Ok(Captured::Frame(frame)) => frame,
            Ok(Captured::End(end)) => break end,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) if shutdown.load(Ordering::SeqCst) => {
                break StreamEnd::Shutdown;
            }
            Err(RecvTimeoutError::Disconnected) => {
                break StreamEnd::SourceFailed("capture thread stopped".to_string());
            }
        };

        let detections = detector.detect(frame.pixels(), frame.width, frame.height);
        let now = clock.now();
        let outcome = session.process_frame(&mut frame, detections, now);

        if let Some(transition) = &outcome.transition {
            for notifier in notifiers.iter_mut() {
                if let Err(err) = notifier.notify(transition) {
                    log::warn!("{}: actuator notify failed: {:#}", name, err);
                }
            }
        }
        if let Err(err) = sink.present(&frame) {
            log::warn!("{}: frame sink failed: {:#}", name, err);
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            log::info!(
                "{}: state={} frames={} log_len={}",
                name,
                session.state(),
                session.stats().frames_processed,
                session.log().len()
            );
            last_health_log = Instant::now();
        }
    };

    // Answer anything still queued so API callers are not left waiting.
    if let Some(rx) = &queries {
        while let Ok(query) = rx.try_recv() {
            session.answer(query);
        }
    }
    drop(frames);
    reap_capture(&name, capture);
    session.finish(end)
}

fn spawn_capture(
    name: &str,
    mut source: Box<dyn FrameSource>,
    frame_interval: Option<Duration>,
    shutdown: Arc<AtomicBool>,
) -> Result<(Receiver<Captured>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::sync_channel(1);
    let stream = name.to_string();
    let handle = std::thread::Builder::new()
        .name(format!("capture-{}", name))
        .spawn(move || {
            let mut consecutive_errors = 0u32;
            let mut last_health_log = Instant::now();
            while !shutdown.load(Ordering::SeqCst) {
                let tick = Instant::now();
                let captured = match source.next_frame() {
                    Ok(Some(frame)) => {
                        consecutive_errors = 0;
                        Captured::Frame(frame)
                    }
                    Ok(None) => Captured::End(StreamEnd::Exhausted),
                    Err(err) => {
                        consecutive_errors += 1;
                        log::warn!(
                            "{}: capture failed ({}/{}): {:#}",
                            stream,
                            consecutive_errors,
                            MAX_CONSECUTIVE_CAPTURE_ERRORS,
                            err
                        );
                        if consecutive_errors < MAX_CONSECUTIVE_CAPTURE_ERRORS {
                            let retry = frame_interval.unwrap_or(Duration::from_millis(100));
                            std::thread::sleep(retry);
                            continue;
                        }
                        Captured::End(StreamEnd::SourceFailed(format!("{:#}", err)))
                    }
                };
                let ended = matches!(captured, Captured::End(_));
                if tx.send(captured).is_err() || ended {
                    break;
                }

                if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                    let stats = source.stats();
                    log::info!(
                        "{}: source health={} frames={} errors={} source={}",
                        stream,
                        source.is_healthy(),
                        stats.frames_captured,
                        stats.capture_errors,
                        stats.source
                    );
                    last_health_log = Instant::now();
                }

                if let Some(interval) = frame_interval {
                    let spent = tick.elapsed();
                    if spent < interval {
                        std::thread::sleep(interval - spent);
                    }
                }
            }
        })
        .map_err(|e| anyhow!("spawn capture thread for {}: {}", name, e))?;
    Ok((rx, handle))
}

/// Join the capture thread if it winds down within the grace period. A
/// thread still stuck in `next_frame` is left to finish on its own.
fn reap_capture(name: &str, handle: JoinHandle<()>) {
    let deadline = Instant::now() + CAPTURE_JOIN_GRACE;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    if !handle.is_finished() {
        log::warn!("{}: capture thread still blocked in the source; detaching", name);
        return;
    }
    if handle.join().is_err() {
        log::error!("{}: capture thread panicked", name);
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
