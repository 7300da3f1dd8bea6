//! Shared SQLite plumbing for the incident, evidence and timeline stores.
//!
//! Every store opens a fresh connection per operation against the same file,
//! so stores are cheap to clone and safe to hand to spawned tasks.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::event_log::EventLog;
use crate::evidence::EvidenceStore;
use crate::incidents::IncidentStore;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;

    CREATE TABLE IF NOT EXISTS incidents (
        incident_id TEXT PRIMARY KEY,
        alert TEXT NOT NULL,
        service TEXT NOT NULL,
        severity TEXT,
        status TEXT NOT NULL,
        status_rank INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        deadline_at TEXT NOT NULL,
        owner TEXT,
        channel TEXT,
        degraded INTEGER NOT NULL DEFAULT 0,
        failure_reason TEXT,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status);

    CREATE TABLE IF NOT EXISTS evidence (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        incident_id TEXT NOT NULL,
        source TEXT NOT NULL,
        query TEXT NOT NULL,
        payload TEXT NOT NULL,
        summary TEXT NOT NULL,
        link TEXT,
        media TEXT,
        findings TEXT NOT NULL,
        late INTEGER NOT NULL,
        retrieved_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_evidence_incident ON evidence(incident_id, retrieved_at, id);

    CREATE TABLE IF NOT EXISTS tool_calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        incident_id TEXT NOT NULL,
        integration TEXT NOT NULL,
        operation TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        role TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        outcome TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        evidence_id INTEGER REFERENCES evidence(id)
    );
    CREATE INDEX IF NOT EXISTS idx_tool_calls_incident ON tool_calls(incident_id);

    CREATE TABLE IF NOT EXISTS diagnoses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        incident_id TEXT NOT NULL,
        hypothesis TEXT NOT NULL,
        claims TEXT NOT NULL,
        next_steps TEXT NOT NULL,
        citations TEXT NOT NULL,
        confidence REAL NOT NULL,
        low_confidence INTEGER NOT NULL,
        caveat TEXT,
        supersedes INTEGER REFERENCES diagnoses(id),
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_diagnoses_incident ON diagnoses(incident_id);

    CREATE TABLE IF NOT EXISTS candidate_owners (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        incident_id TEXT NOT NULL,
        diagnosis_id INTEGER NOT NULL REFERENCES diagnoses(id),
        rank INTEGER NOT NULL,
        team TEXT NOT NULL,
        candidate TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_candidates_incident ON candidate_owners(incident_id, diagnosis_id);

    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        incident_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        description TEXT NOT NULL,
        details TEXT,
        timestamp TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_incident ON events(incident_id);

    CREATE TRIGGER IF NOT EXISTS evidence_no_update BEFORE UPDATE ON evidence
    BEGIN SELECT RAISE(ABORT, 'evidence is append-only'); END;
    CREATE TRIGGER IF NOT EXISTS evidence_no_delete BEFORE DELETE ON evidence
    BEGIN SELECT RAISE(ABORT, 'evidence is append-only'); END;
    CREATE TRIGGER IF NOT EXISTS tool_calls_no_update BEFORE UPDATE ON tool_calls
    BEGIN SELECT RAISE(ABORT, 'tool calls are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS diagnoses_no_update BEFORE UPDATE ON diagnoses
    BEGIN SELECT RAISE(ABORT, 'diagnoses are append-only'); END;
    CREATE TRIGGER IF NOT EXISTS candidates_no_update BEFORE UPDATE ON candidate_owners
    BEGIN SELECT RAISE(ABORT, 'candidate owners are append-only'); END;
";

/// Creates the parent directory and schema, returning the shared path handle.
pub(crate) fn prepare(path: &str) -> Result<Arc<PathBuf>, StoreError> {
    let db_path = PathBuf::from(path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = connect(&db_path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(db_path))
}

pub(crate) fn connect(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Fixed-width UTC timestamps so lexical order matches time order.
pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

pub(crate) fn opt_json_col<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
    })
    .transpose()
}

/// Parses a stored enum tag through its `parse` function.
pub(crate) fn tag_col<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown tag {raw}").into(),
        )
    })
}

/// The three stores over one database file.
#[derive(Clone)]
pub struct Stores {
    pub incidents: IncidentStore,
    pub evidence: EvidenceStore,
    pub events: EventLog,
}

impl Stores {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db_path = prepare(path)?;
        Ok(Self {
            incidents: IncidentStore::at(db_path.clone()),
            evidence: EvidenceStore::at(db_path.clone()),
            events: EventLog::at(db_path),
        })
    }
}

#[cfg(test)]
pub(crate) fn test_db_path(name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    format!("/tmp/ack-tests/{name}-{nanos}.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_is_idempotent() {
        let path = test_db_path("schema");
        prepare(&path).expect("first");
        prepare(&path).expect("second");
        assert!(Stores::open(&path).is_ok());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = DateTime::parse_from_rfc3339("2026-03-01T09:00:00.5Z")
            .expect("parse")
            .with_timezone(&Utc);
        let late = early + chrono::Duration::milliseconds(600);
        assert!(timestamp(&early) < timestamp(&late));
    }
}
