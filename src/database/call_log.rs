//! Call Log Database
//!
//! SQLite-Datenbank für die lokale Anrufhistorie.
//! Eine Zeile pro abgeschlossenem Anruf, Schlüssel ist die `call_id`.

use crate::session::{CallRole, CallState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, types::Type, Connection, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallLogError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Could not determine app data directory")]
    NoDataDir,

    #[error("Call not found in log: {0}")]
    NotFound(String),
}

// ============================================================================
// CALL LOG ENTRY
// ============================================================================

/// Ein abgeschlossener Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallLogEntry {
    pub call_id: String,
    pub peer_id: String,
    pub role: CallRole,
    pub is_video: bool,
    /// Terminaler Zustand (ended, declined, missed, error)
    pub outcome: CallState,
    pub duration_secs: u64,
    pub ended_at: DateTime<Utc>,
}

// ============================================================================
// DATABASE
// ============================================================================

/// Anrufprotokoll (Thread-safe durch Mutex)
pub struct CallLog {
    conn: Mutex<Connection>,
}

impl CallLog {
    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open(path: &Path) -> Result<Self, CallLogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call log at {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    /// Öffnet die Datenbank im Datenverzeichnis der App
    pub fn open_default() -> Result<Self, CallLogError> {
        Self::open(&Self::default_path()?)
    }

    /// In-Memory Datenbank
    pub fn open_in_memory() -> Result<Self, CallLogError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn default_path() -> Result<PathBuf, CallLogError> {
        let proj_dirs = directories::ProjectDirs::from("com", "pulse", "call-session")
            .ok_or(CallLogError::NoDataDir)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("call_log.db");
        Ok(path)
    }

    fn with_connection(conn: Connection) -> Result<Self, CallLogError> {
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), CallLogError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_log (
                call_id TEXT PRIMARY KEY,
                peer_id TEXT NOT NULL,
                role TEXT NOT NULL,
                is_video INTEGER NOT NULL DEFAULT 0,
                outcome TEXT NOT NULL,
                duration_secs INTEGER NOT NULL DEFAULT 0,
                ended_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_call_log_ended_at ON call_log(ended_at)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Schreibt einen Eintrag, ein bestehender mit gleicher `call_id` wird ersetzt
    pub fn record(&self, entry: &CallLogEntry) -> Result<(), CallLogError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO call_log
                (call_id, peer_id, role, is_video, outcome, duration_secs, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.call_id,
                entry.peer_id,
                entry.role.as_str(),
                entry.is_video as i32,
                entry.outcome.as_str(),
                entry.duration_secs as i64,
                entry.ended_at.timestamp_millis(),
            ],
        )?;

        tracing::debug!("Call log: {} -> {}", entry.call_id, entry.outcome);
        Ok(())
    }

    pub fn get(&self, call_id: &str) -> Result<CallLogEntry, CallLogError> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT call_id, peer_id, role, is_video, outcome, duration_secs, ended_at
            FROM call_log
            WHERE call_id = ?1
            "#,
            params![call_id],
            entry_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CallLogError::NotFound(call_id.to_string()),
            other => CallLogError::Sqlite(other),
        })
    }

    /// Die letzten `limit` Anrufe, neueste zuerst
    pub fn recent(&self, limit: usize) -> Result<Vec<CallLogEntry>, CallLogError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT call_id, peer_id, role, is_video, outcome, duration_secs, ended_at
            FROM call_log
            ORDER BY ended_at DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map(params![limit as i64], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CallLogEntry> {
    let role: String = row.get(2)?;
    let outcome: String = row.get(4)?;
    let ended_at: i64 = row.get(6)?;

    Ok(CallLogEntry {
        call_id: row.get(0)?,
        peer_id: row.get(1)?,
        role: parse_role(&role).ok_or_else(|| unknown_value(2, &role))?,
        is_video: row.get::<_, i32>(3)? != 0,
        outcome: parse_outcome(&outcome).ok_or_else(|| unknown_value(4, &outcome))?,
        duration_secs: row.get::<_, i64>(5)?.max(0) as u64,
        ended_at: DateTime::from_timestamp_millis(ended_at).unwrap_or_default(),
    })
}

fn parse_role(raw: &str) -> Option<CallRole> {
    [CallRole::Caller, CallRole::Receiver]
        .into_iter()
        .find(|role| role.as_str() == raw)
}

fn parse_outcome(raw: &str) -> Option<CallState> {
    [
        CallState::Ended,
        CallState::Declined,
        CallState::Missed,
        CallState::Error,
    ]
    .into_iter()
    .find(|state| state.as_str() == raw)
}

fn unknown_value(column: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        Type::Text,
        format!("unknown value: {}", raw).into(),
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(call_id: &str, outcome: CallState, ended_at: DateTime<Utc>) -> CallLogEntry {
        CallLogEntry {
            call_id: call_id.to_string(),
            peer_id: "bob".to_string(),
            role: CallRole::Caller,
            is_video: false,
            outcome,
            duration_secs: 0,
            ended_at,
        }
    }

    #[test]
    fn test_record_and_get() {
        let log = CallLog::open_in_memory().unwrap();
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();

        let mut call = entry("c1", CallState::Ended, now);
        call.role = CallRole::Receiver;
        call.is_video = true;
        call.duration_secs = 42;
        log.record(&call).unwrap();

        assert_eq!(log.get("c1").unwrap(), call);
        assert!(matches!(log.get("c2"), Err(CallLogError::NotFound(_))));
    }

    #[test]
    fn test_record_replaces_same_call() {
        let log = CallLog::open_in_memory().unwrap();
        let now = Utc::now();

        log.record(&entry("c1", CallState::Error, now)).unwrap();
        log.record(&entry("c1", CallState::Ended, now)).unwrap();

        assert_eq!(log.recent(10).unwrap().len(), 1);
        assert_eq!(log.get("c1").unwrap().outcome, CallState::Ended);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let log = CallLog::open_in_memory().unwrap();
        let now = Utc::now();

        log.record(&entry("old", CallState::Missed, now - Duration::minutes(5)))
            .unwrap();
        log.record(&entry("new", CallState::Declined, now)).unwrap();
        log.record(&entry("mid", CallState::Ended, now - Duration::minutes(1)))
            .unwrap();

        let ids: Vec<_> = log
            .recent(2)
            .unwrap()
            .into_iter()
            .map(|e| e.call_id)
            .collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn test_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("call_log.db");

        {
            let log = CallLog::open(&path).unwrap();
            log.record(&entry("c1", CallState::Missed, Utc::now()))
                .unwrap();
        }

        let reopened = CallLog::open(&path).unwrap();
        assert_eq!(reopened.get("c1").unwrap().outcome, CallState::Missed);
    }
}
