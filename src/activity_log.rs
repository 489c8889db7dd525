//! Per-session activity log.
//!
//! Every processed frame appends one `LogRecord`. Records are never edited.
//! When a capacity is configured the oldest records are evicted first;
//! otherwise the log grows for the lifetime of the session.
//!
//! The CSV export uses the header `timestamp,person_detected,AC_status`,
//! second-resolution local timestamps and `0`/`1` presence flags.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;

use crate::controller::ActuatorState;

/// CSV header row, in column order.
pub const CSV_HEADER: [&str; 3] = ["timestamp", "person_detected", "AC_status"];

/// Conventional file name for downloaded exports.
pub const EXPORT_FILE_NAME: &str = "occupancy_log.csv";

/// Timestamp rendering used in exports and notices.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One frame decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(with = "log_timestamp")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "person_detected", with = "presence_flag")]
    pub presence: bool,
    #[serde(rename = "AC_status")]
    pub actuator_state: ActuatorState,
}

impl LogRecord {
    /// Build a record; the timestamp is truncated to whole seconds.
    pub fn new(timestamp: NaiveDateTime, presence: bool, actuator_state: ActuatorState) -> Self {
        Self {
            timestamp: timestamp.with_nanosecond(0).unwrap_or(timestamp),
            presence,
            actuator_state,
        }
    }
}

/// Append-only record of frame decisions for one session.
#[derive(Debug, Default)]
pub struct ActivityLog {
    records: VecDeque<LogRecord>,
    capacity: Option<usize>,
    evicted: u64,
}

impl ActivityLog {
    /// Unbounded log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that keeps at most `capacity` of the most recent records.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(4096)),
            capacity: Some(capacity),
            evicted: 0,
        }
    }

    pub fn append(&mut self, timestamp: NaiveDateTime, presence: bool, state: ActuatorState) {
        self.push(LogRecord::new(timestamp, presence, state));
    }

    pub fn push(&mut self, record: LogRecord) {
        if let Some(capacity) = self.capacity {
            while self.records.len() >= capacity {
                self.records.pop_front();
                self.evicted += 1;
            }
        }
        self.records.push_back(record);
    }

    /// Most recent `limit` records (all when `None`), oldest first.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<LogRecord> {
        let skip = match limit {
            Some(limit) => self.records.len().saturating_sub(limit),
            None => 0,
        };
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<&LogRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Records dropped because of the capacity bound.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Serialize the retained log as CSV. An empty log yields the header only.
    pub fn export_csv(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(32 + self.records.len() * 32);
        self.write_csv(&mut out)?;
        Ok(out)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        write_records_csv(self.records.iter(), writer)
    }

    /// Take every record out of the log. Called once at session end.
    pub fn drain(&mut self) -> Vec<LogRecord> {
        self.records.drain(..).collect()
    }
}

/// Write records as CSV with the standard header.
pub fn write_records_csv<'a, W, I>(records: I, writer: W) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a LogRecord>,
{
    // Header is written explicitly so an empty log still produces one.
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    wtr.write_record(CSV_HEADER)?;
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush().context("flush csv export")?;
    Ok(())
}

/// Parse a CSV export back into records.
pub fn parse_csv(bytes: &[u8]) -> Result<Vec<LogRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = rdr.headers()?.clone();
    if headers.iter().ne(CSV_HEADER.iter().copied()) {
        return Err(anyhow!(
            "unexpected csv header '{}', expected '{}'",
            headers.iter().collect::<Vec<_>>().join(","),
            CSV_HEADER.join(",")
        ));
    }
    let mut records = Vec::new();
    for (line, row) in rdr.deserialize::<LogRecord>().enumerate() {
        let record = row.with_context(|| format!("invalid csv row {}", line + 1))?;
        records.push(record);
    }
    Ok(records)
}

pub(crate) mod log_timestamp {
    use chrono::NaiveDateTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
            .map_err(|e| D::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
    }
}

mod presence_flag {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flag: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*flag))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match u8::deserialize(d)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(D::Error::custom(format!(
                "person_detected must be 0 or 1, got {}",
                other
            ))),
        }
    }
}
