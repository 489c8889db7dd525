//! Occupancy Kernel
//!
//! Person detection on a live video stream driving a debounced ON/OFF actuator
//! ("lights" or "AC"), with a per-session activity log that can be exported as
//! CSV.
//!
//! # Architecture
//!
//! Each stream is one session. Per frame:
//!
//! 1. A `FrameSource` yields an RGB frame.
//! 2. A `DetectorBackend` returns `DetectionEvent`s; a `PresencePolicy` reduces
//!    them to one presence flag.
//! 3. The `OccupancyController` applies asymmetric hysteresis: ON on the first
//!    detection, OFF only after the vacancy timeout of continuous absence.
//! 4. The `ActivityLog` records `(timestamp, presence, state)`.
//! 5. The `FrameAnnotator` draws person boxes and the status caption; a
//!    `FrameSink` displays or stores the frame.
//! 6. Transitions go to `ActuatorNotifier`s.
//!
//! Controllers and logs are never shared between sessions.
//!
//! # Module Structure
//!
//! - `controller`: debounce state machine and session clocks
//! - `activity_log`: log records and CSV export
//! - `detect`: detection types, presence policy, detector backends
//! - `frame`, `ingest`, `annotate`, `sink`: frame I/O and rendering
//! - `actuator`: transition notifiers
//! - `session`: per-stream wiring and the stream loop
//! - `storage`: archive of finished sessions
//! - `api`, `config`: daemon surface

pub mod activity_log;
pub mod actuator;
pub mod annotate;
pub mod api;
pub mod config;
pub mod controller;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod session;
pub mod sink;
pub mod storage;

pub use activity_log::{
    parse_csv, write_records_csv, ActivityLog, LogRecord, CSV_HEADER, EXPORT_FILE_NAME,
    TIMESTAMP_FORMAT,
};
#[cfg(feature = "actuator-mqtt")]
pub use actuator::{MqttNotifier, MqttSettings};
pub use actuator::{ActuatorNotifier, ChannelNotifier, LogNotifier, Transition};
pub use annotate::{AnnotatorStyle, FrameAnnotator};
pub use config::OccupancydConfig;
pub use controller::{
    ActuatorState, MonotonicClock, Observation, OccupancyController, SessionClock, SteppedClock,
    DEFAULT_VACANCY_TIMEOUT,
};
pub use detect::{
    BackendRegistry, BoundingBox, DetectionEvent, DetectorBackend, PresencePolicy, StubBackend,
};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, SourceConfig, SourceStats, SyntheticSource};
pub use session::{
    run_stream, FinishedSession, FrameOutcome, OccupancySession, SessionDirectory, SessionQuery,
    SessionSettings, SessionStats, SessionStatus, StreamContext, StreamEnd,
};
pub use sink::{FrameSink, JpegSnapshotSink, NullSink};
pub use storage::{ArchivedSession, InMemoryLogArchive, LogArchive, SqliteLogArchive};
