use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::db;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    IncidentReceived,
    StatusChanged,
    ToolCallIssued,
    ToolCallFinished,
    DiagnosisRecorded,
    CandidatesRecorded,
    EscalationAttempt,
    EscalationDegraded,
    OperatorAlerted,
    ThreadMessage,
    ThreadReply,
    CloseRequested,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::IncidentReceived => "incident_received",
            EventType::StatusChanged => "status_changed",
            EventType::ToolCallIssued => "tool_call_issued",
            EventType::ToolCallFinished => "tool_call_finished",
            EventType::DiagnosisRecorded => "diagnosis_recorded",
            EventType::CandidatesRecorded => "candidates_recorded",
            EventType::EscalationAttempt => "escalation_attempt",
            EventType::EscalationDegraded => "escalation_degraded",
            EventType::OperatorAlerted => "operator_alerted",
            EventType::ThreadMessage => "thread_message",
            EventType::ThreadReply => "thread_reply",
            EventType::CloseRequested => "close_requested",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "incident_received" => EventType::IncidentReceived,
            "status_changed" => EventType::StatusChanged,
            "tool_call_issued" => EventType::ToolCallIssued,
            "tool_call_finished" => EventType::ToolCallFinished,
            "diagnosis_recorded" => EventType::DiagnosisRecorded,
            "candidates_recorded" => EventType::CandidatesRecorded,
            "escalation_attempt" => EventType::EscalationAttempt,
            "escalation_degraded" => EventType::EscalationDegraded,
            "operator_alerted" => EventType::OperatorAlerted,
            "thread_message" => EventType::ThreadMessage,
            "thread_reply" => EventType::ThreadReply,
            "close_requested" => EventType::CloseRequested,
            _ => return None,
        })
    }
}

/// One entry on an incident's durable timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub incident_id: String,
    pub event_type: EventType,
    pub description: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(incident_id: &str, event_type: EventType, description: impl Into<String>) -> Self {
        Self {
            id: None,
            incident_id: incident_id.to_string(),
            event_type,
            description: description.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Clone)]
pub struct EventLog {
    db_path: Arc<PathBuf>,
}

impl EventLog {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::at(db::prepare(path)?))
    }

    pub(crate) fn at(db_path: Arc<PathBuf>) -> Self {
        Self { db_path }
    }

    pub fn append(&self, event: &Event) -> Result<i64, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let details = event
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO events (incident_id, event_type, description, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.incident_id,
                event.event_type.as_str(),
                event.description,
                details,
                db::timestamp(&event.timestamp),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn events_for_incident(&self, incident_id: &str) -> Result<Vec<Event>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, event_type, description, details, timestamp
             FROM events
             WHERE incident_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![incident_id], map_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Incremental tail across all incidents, for streaming consumers.
    pub fn events_after(&self, after_id: i64) -> Result<Vec<Event>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, event_type, description, details, timestamp
             FROM events
             WHERE id > ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![after_id], map_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Whether an external resolution has been requested for the incident.
    pub fn close_requested(&self, incident_id: &str) -> Result<bool, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let found: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE incident_id = ?1 AND event_type = ?2)",
            params![incident_id, EventType::CloseRequested.as_str()],
            |row| row.get(0),
        )?;
        Ok(found)
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        event_type: db::tag_col(row, 2, EventType::parse)?,
        description: row.get(3)?,
        details: db::opt_json_col(row, 4)?,
        timestamp: db::time_col(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db_path;

    #[test]
    fn status_change_keeps_its_details() {
        let log = EventLog::open(&test_db_path("events-roundtrip")).expect("open");
        let id = log
            .append(
                &Event::new("inc-a", EventType::StatusChanged, "received -> acknowledged")
                    .with_details(serde_json::json!({"to": "acknowledged"})),
            )
            .expect("append");
        assert!(id > 0);

        let events = log.events_for_incident("inc-a").expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::StatusChanged);
        assert_eq!(events[0].details, Some(serde_json::json!({"to": "acknowledged"})));
    }

    #[test]
    fn events_after_skips_earlier_entries() {
        let log = EventLog::open(&test_db_path("events-after")).expect("open");
        let a = log
            .append(&Event::new("inc-a", EventType::IncidentReceived, "received"))
            .expect("append a");
        let b = log
            .append(&Event::new("inc-b", EventType::IncidentReceived, "received"))
            .expect("append b");

        let events = log.events_after(a).expect("events after");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, Some(b));
    }

    #[test]
    fn close_request_is_scoped_to_incident() {
        let log = EventLog::open(&test_db_path("events-close")).expect("open");
        log.append(&Event::new("inc-1", EventType::CloseRequested, "resolved upstream"))
            .expect("append");

        assert!(log.close_requested("inc-1").expect("query"));
        assert!(!log.close_requested("inc-2").expect("query"));
    }
}
