//! Attendance recorder: one `present` row per identity per day.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    identity  TEXT NOT NULL,
    date      TEXT NOT NULL,
    time_in   TEXT NOT NULL,
    status    TEXT NOT NULL DEFAULT 'present',
    UNIQUE(identity, date)
);
CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance(date);
";

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Recorded,
    AlreadyMarked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity: String,
    pub date: NaiveDate,
    pub time_in: NaiveTime,
    pub status: String,
}

pub struct AttendanceRecorder {
    conn: Mutex<Connection>,
}

impl AttendanceRecorder {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AttendanceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, AttendanceError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AttendanceError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Mark `identity` present on the day of `at`. A second mark on the same
    /// day leaves the first row untouched.
    pub fn mark_present(&self, identity: &str, at: NaiveDateTime) -> Result<MarkOutcome, AttendanceError> {
        let inserted = self.conn.lock().execute(
            "INSERT INTO attendance (identity, date, time_in, status)
             VALUES (?1, ?2, ?3, 'present')
             ON CONFLICT(identity, date) DO NOTHING",
            params![
                identity,
                at.date().format(DATE_FORMAT).to_string(),
                at.time().format(TIME_FORMAT).to_string()
            ],
        )?;

        let outcome = if inserted == 1 {
            MarkOutcome::Recorded
        } else {
            MarkOutcome::AlreadyMarked
        };
        tracing::info!(identity, date = %at.date(), ?outcome, "attendance");
        Ok(outcome)
    }

    /// Records for one day, latest arrival first.
    pub fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, identity, date, time_in, status FROM attendance
             WHERE date = ?1 ORDER BY time_in DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], decode_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete one record; `false` if it did not exist.
    pub fn delete_record(&self, id: i64) -> Result<bool, AttendanceError> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM attendance WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

fn decode_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let date: String = row.get(2)?;
    let time_in: String = row.get(3)?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        identity: row.get(1)?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e)))?,
        time_in: NaiveTime::parse_from_str(&time_in, TIME_FORMAT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?,
        status: row.get(4)?,
    })
}
