//! Archive of finished session logs.
//!
//! Activity logs live in memory for the duration of a session. When a stream
//! ends, the daemon may hand the finished session to a [`LogArchive`] so the
//! records can be exported later with `export_log`.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use rand::RngCore;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;

use crate::activity_log::{LogRecord, TIMESTAMP_FORMAT};
use crate::controller::ActuatorState;
use crate::session::FinishedSession;

/// Metadata of one archived session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArchivedSession {
    pub id: String,
    pub name: String,
    #[serde(with = "crate::activity_log::log_timestamp")]
    pub started_at: NaiveDateTime,
    #[serde(with = "crate::activity_log::log_timestamp")]
    pub ended_at: NaiveDateTime,
    pub end_reason: String,
    pub record_count: u64,
    pub transitions_on: u64,
    pub transitions_off: u64,
    pub detector_failures: u64,
    pub final_state: ActuatorState,
}

impl ArchivedSession {
    fn from_finished(session: &FinishedSession) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            started_at: session.started_at,
            ended_at: session.ended_at,
            end_reason: session.end_reason.to_string(),
            record_count: session.records.len() as u64,
            transitions_on: session.stats.transitions_on,
            transitions_off: session.stats.transitions_off,
            detector_failures: session.stats.detector_failures,
            final_state: session.final_state,
        }
    }
}

pub trait LogArchive {
    /// Store a finished session and all its records. Session ids are unique.
    fn archive_session(&mut self, session: &FinishedSession) -> Result<()>;

    /// Archived sessions, oldest first, optionally only those of one stream.
    fn list_sessions(&mut self, stream: Option<&str>) -> Result<Vec<ArchivedSession>>;

    /// Records of one session in chronological order.
    fn load_records(&mut self, session_id: &str) -> Result<Vec<LogRecord>>;

    /// Resolve a session id, or a stream name to its most recent session.
    fn resolve(&mut self, id_or_stream: &str) -> Result<ArchivedSession> {
        let sessions = self.list_sessions(None)?;
        if let Some(found) = sessions.iter().find(|s| s.id == id_or_stream) {
            return Ok(found.clone());
        }
        sessions
            .into_iter()
            .rev()
            .find(|s| s.name == id_or_stream)
            .ok_or_else(|| anyhow!("no archived session matches '{}'", id_or_stream))
    }
}

pub struct SqliteLogArchive {
    conn: Connection,
}

impl SqliteLogArchive {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open log archive {}", db_path))?;
        let mut archive = Self { conn };
        archive.ensure_schema()?;
        Ok(archive)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS sessions (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              started_at TEXT NOT NULL,
              ended_at TEXT NOT NULL,
              end_reason TEXT NOT NULL,
              record_count INTEGER NOT NULL,
              transitions_on INTEGER NOT NULL,
              transitions_off INTEGER NOT NULL,
              detector_failures INTEGER NOT NULL,
              final_state TEXT NOT NULL,
              archived_seq INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
              session_id TEXT NOT NULL REFERENCES sessions(id),
              seq INTEGER NOT NULL,
              timestamp TEXT NOT NULL,
              person_detected INTEGER NOT NULL,
              ac_status TEXT NOT NULL,
              PRIMARY KEY (session_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_name ON sessions(name);
            "#,
        )?;
        Ok(())
    }
}

impl LogArchive for SqliteLogArchive {
    fn archive_session(&mut self, session: &FinishedSession) -> Result<()> {
        let meta = ArchivedSession::from_finished(session);
        let tx = self.conn.transaction()?;
        let archived_seq: i64 =
            tx.query_row("SELECT COALESCE(MAX(archived_seq), 0) + 1 FROM sessions", [], |row| {
                row.get(0)
            })?;
        tx.execute(
            r#"
            INSERT INTO sessions(id, name, started_at, ended_at, end_reason, record_count,
                                 transitions_on, transitions_off, detector_failures,
                                 final_state, archived_seq)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                meta.id,
                meta.name,
                meta.started_at.format(TIMESTAMP_FORMAT).to_string(),
                meta.ended_at.format(TIMESTAMP_FORMAT).to_string(),
                meta.end_reason,
                meta.record_count as i64,
                meta.transitions_on as i64,
                meta.transitions_off as i64,
                meta.detector_failures as i64,
                meta.final_state.as_str(),
                archived_seq
            ],
        )
        .with_context(|| format!("insert archived session {}", meta.id))?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO records(session_id, seq, timestamp, person_detected, ac_status)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;
            for (seq, record) in session.records.iter().enumerate() {
                stmt.execute(params![
                    meta.id,
                    seq as i64,
                    record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                    i64::from(record.presence),
                    record.actuator_state.as_str()
                ])?;
            }
        }
        tx.commit()?;

        log::info!(
            "archived session {} ({}): {} records",
            meta.id,
            meta.name,
            meta.record_count
        );
        Ok(())
    }

    fn list_sessions(&mut self, stream: Option<&str>) -> Result<Vec<ArchivedSession>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, name, started_at, ended_at, end_reason, record_count,
                   transitions_on, transitions_off, detector_failures, final_state
            FROM sessions
            WHERE ?1 IS NULL OR name = ?1
            ORDER BY archived_seq ASC
            "#,
        )?;
        let mut rows = stmt.query(params![stream])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let started_at: String = row.get(2)?;
            let ended_at: String = row.get(3)?;
            let final_state: String = row.get(9)?;
            out.push(ArchivedSession {
                id: row.get(0)?,
                name: row.get(1)?,
                started_at: parse_timestamp(&started_at)?,
                ended_at: parse_timestamp(&ended_at)?,
                end_reason: row.get(4)?,
                record_count: row.get::<_, i64>(5)? as u64,
                transitions_on: row.get::<_, i64>(6)? as u64,
                transitions_off: row.get::<_, i64>(7)? as u64,
                detector_failures: row.get::<_, i64>(8)? as u64,
                final_state: final_state.parse()?,
            });
        }
        Ok(out)
    }

    fn load_records(&mut self, session_id: &str) -> Result<Vec<LogRecord>> {
        let exists: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(anyhow!("unknown session '{}'", session_id));
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, person_detected, ac_status
            FROM records WHERE session_id = ?1 ORDER BY seq ASC
            "#,
        )?;
        let mut rows = stmt.query(params![session_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp: String = row.get(0)?;
            let presence: i64 = row.get(1)?;
            let state: String = row.get(2)?;
            out.push(LogRecord::new(
                parse_timestamp(&timestamp)?,
                presence != 0,
                state.parse()?,
            ));
        }
        Ok(out)
    }
}

/// Archive kept in memory, for tests and runs without a database.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLogArchive {
    sessions: Vec<(ArchivedSession, Vec<LogRecord>)>,
}

impl InMemoryLogArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogArchive for InMemoryLogArchive {
    fn archive_session(&mut self, session: &FinishedSession) -> Result<()> {
        if self.sessions.iter().any(|(meta, _)| meta.id == session.id) {
            return Err(anyhow!("session {} already archived", session.id));
        }
        self.sessions.push((
            ArchivedSession::from_finished(session),
            session.records.clone(),
        ));
        Ok(())
    }

    fn list_sessions(&mut self, stream: Option<&str>) -> Result<Vec<ArchivedSession>> {
        Ok(self
            .sessions
            .iter()
            .map(|(meta, _)| meta)
            .filter(|meta| stream.map_or(true, |name| meta.name == name))
            .cloned()
            .collect())
    }

    fn load_records(&mut self, session_id: &str) -> Result<Vec<LogRecord>> {
        self.sessions
            .iter()
            .find(|(meta, _)| meta.id == session_id)
            .map(|(_, records)| records.clone())
            .ok_or_else(|| anyhow!("unknown session '{}'", session_id))
    }
}

/// Private shared-cache in-memory database URI, unique per call.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:occupancy_archive_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .with_context(|| format!("corrupt archive timestamp '{}'", raw))
}
