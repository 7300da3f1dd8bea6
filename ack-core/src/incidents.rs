//! Durable incident records and the artifacts roles attach to them: tool
//! call records, diagnoses and candidate owners.
//!
//! Status changes are conditional updates on the stored rank, so two writers
//! racing on the same incident can never move it backwards.

use chrono::Utc;
use rusqlite::{params, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Arc;

use crate::db;
use crate::error::StoreError;
use crate::model::{
    CandidateOwner, ChannelRef, Diagnosis, Incident, IncidentStatus, IntegrationKind, PastIncident,
    RoleKind, Severity, ToolCallRecord,
};

#[derive(Clone)]
pub struct IncidentStore {
    db_path: Arc<PathBuf>,
}

const INCIDENT_COLUMNS: &str = "incident_id, alert, service, severity, status, created_at,
    deadline_at, owner, channel, degraded, failure_reason";

impl IncidentStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::at(db::prepare(path)?))
    }

    pub(crate) fn at(db_path: Arc<PathBuf>) -> Self {
        Self { db_path }
    }

    /// Inserts a new incident. Fails with [`StoreError::Duplicate`] when the
    /// id is already known, which is what keeps one coordinator per incident.
    pub fn create(&self, incident: &Incident) -> Result<(), StoreError> {
        let conn = db::connect(&self.db_path)?;
        let alert = serde_json::to_string(&incident.alert)?;
        let channel = incident
            .channel
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let inserted = conn.execute(
            "INSERT INTO incidents (incident_id, alert, service, severity, status, status_rank,
                created_at, deadline_at, owner, channel, degraded, failure_reason, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                incident.incident_id,
                alert,
                incident.service,
                incident.severity.map(|s| s.as_str()),
                incident.status.as_str(),
                incident.status.rank(),
                db::timestamp(&incident.created_at),
                db::timestamp(&incident.deadline_at),
                incident.owner,
                channel,
                incident.degraded,
                incident.failure_reason,
                db::timestamp(&Utc::now()),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(incident.incident_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, incident_id: &str) -> Result<Option<Incident>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let incident = conn
            .query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE incident_id = ?1"),
                params![incident_id],
                map_incident,
            )
            .optional()?;
        Ok(incident)
    }

    pub fn require(&self, incident_id: &str) -> Result<Incident, StoreError> {
        self.get(incident_id)?
            .ok_or_else(|| StoreError::NotFound(incident_id.to_string()))
    }

    /// Moves the incident forward. Returns `false` when the stored status is
    /// already at or past `next`, or terminal.
    pub fn advance(&self, incident_id: &str, next: IncidentStatus) -> Result<bool, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let changed = conn.execute(
            "UPDATE incidents SET status = ?2, status_rank = ?3, updated_at = ?4
             WHERE incident_id = ?1 AND status_rank < ?3
               AND status NOT IN ('closed', 'failed')",
            params![
                incident_id,
                next.as_str(),
                next.rank(),
                db::timestamp(&Utc::now())
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_failed(&self, incident_id: &str, reason: &str) -> Result<bool, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let failed = IncidentStatus::Failed;
        let changed = conn.execute(
            "UPDATE incidents SET status = ?2, status_rank = ?3, failure_reason = ?4, updated_at = ?5
             WHERE incident_id = ?1 AND status NOT IN ('closed', 'failed')",
            params![
                incident_id,
                failed.as_str(),
                failed.rank(),
                reason,
                db::timestamp(&Utc::now())
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn set_owner(&self, incident_id: &str, team: &str) -> Result<(), StoreError> {
        self.update_field(incident_id, "owner", Some(team.to_string()))
    }

    pub fn set_channel(&self, incident_id: &str, channel: &ChannelRef) -> Result<(), StoreError> {
        self.update_field(incident_id, "channel", Some(serde_json::to_string(channel)?))
    }

    pub fn set_degraded(&self, incident_id: &str) -> Result<(), StoreError> {
        let conn = db::connect(&self.db_path)?;
        conn.execute(
            "UPDATE incidents SET degraded = 1, updated_at = ?2 WHERE incident_id = ?1",
            params![incident_id, db::timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    fn update_field(
        &self,
        incident_id: &str,
        column: &'static str,
        value: Option<String>,
    ) -> Result<(), StoreError> {
        let conn = db::connect(&self.db_path)?;
        let changed = conn.execute(
            &format!("UPDATE incidents SET {column} = ?2, updated_at = ?3 WHERE incident_id = ?1"),
            params![incident_id, value, db::timestamp(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(incident_id.to_string()));
        }
        Ok(())
    }

    /// Incidents in any of `statuses`, newest first.
    pub fn list(&self, statuses: &[IncidentStatus]) -> Result<Vec<Incident>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map([], map_incident)?;

        let mut out = Vec::new();
        for row in rows {
            let incident = row?;
            if statuses.contains(&incident.status) {
                out.push(incident);
            }
        }
        Ok(out)
    }

    pub fn open_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        self.list(&[
            IncidentStatus::Received,
            IncidentStatus::Acknowledged,
            IncidentStatus::Investigating,
            IncidentStatus::Diagnosing,
            IncidentStatus::Escalating,
            IncidentStatus::AwaitingHuman,
        ])
    }

    pub fn failed_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        self.list(&[IncidentStatus::Failed])
    }

    /// Appends a tool call record. `record.id` is ignored; the assigned id is
    /// returned.
    pub fn record_tool_call(&self, record: &ToolCallRecord) -> Result<i64, StoreError> {
        let conn = db::connect(&self.db_path)?;
        conn.execute(
            "INSERT INTO tool_calls (incident_id, integration, operation, fingerprint, role,
                started_at, finished_at, outcome, attempts, evidence_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.incident_id,
                record.integration.as_str(),
                serde_json::to_string(&record.operation)?,
                record.fingerprint,
                record.role.as_str(),
                db::timestamp(&record.started_at),
                db::timestamp(&record.finished_at),
                serde_json::to_string(&record.outcome)?,
                record.attempts,
                record.evidence_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn tool_calls(&self, incident_id: &str) -> Result<Vec<ToolCallRecord>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, integration, operation, fingerprint, role, started_at,
                    finished_at, outcome, attempts, evidence_id
             FROM tool_calls WHERE incident_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![incident_id], |row| {
            Ok(ToolCallRecord {
                id: row.get(0)?,
                incident_id: row.get(1)?,
                integration: db::tag_col(row, 2, IntegrationKind::parse)?,
                operation: db::json_col(row, 3)?,
                fingerprint: row.get(4)?,
                role: db::tag_col(row, 5, RoleKind::parse)?,
                started_at: db::time_col(row, 6)?,
                finished_at: db::time_col(row, 7)?,
                outcome: db::json_col(row, 8)?,
                attempts: row.get(9)?,
                evidence_id: row.get(10)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Records a new current diagnosis. Earlier rows stay untouched; the new
    /// row points at the one it supersedes. Returns the new id.
    pub fn record_diagnosis(&self, diagnosis: &Diagnosis) -> Result<i64, StoreError> {
        let mut conn = db::connect(&self.db_path)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<i64> = tx
            .query_row(
                "SELECT MAX(id) FROM diagnoses WHERE incident_id = ?1",
                params![diagnosis.incident_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        tx.execute(
            "INSERT INTO diagnoses (incident_id, hypothesis, claims, next_steps, citations,
                confidence, low_confidence, caveat, supersedes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                diagnosis.incident_id,
                diagnosis.hypothesis,
                serde_json::to_string(&diagnosis.claims)?,
                serde_json::to_string(&diagnosis.next_steps)?,
                serde_json::to_string(&diagnosis.citations)?,
                diagnosis.confidence,
                diagnosis.low_confidence,
                diagnosis.caveat,
                current,
                db::timestamp(&diagnosis.created_at),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn current_diagnosis(&self, incident_id: &str) -> Result<Option<Diagnosis>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let diagnosis = conn
            .query_row(
                "SELECT id, incident_id, hypothesis, claims, next_steps, citations, confidence,
                        low_confidence, caveat, supersedes, created_at
                 FROM diagnoses WHERE incident_id = ?1 ORDER BY id DESC LIMIT 1",
                params![incident_id],
                map_diagnosis,
            )
            .optional()?;
        Ok(diagnosis)
    }

    /// Every diagnosis ever recorded, oldest first.
    pub fn diagnosis_history(&self, incident_id: &str) -> Result<Vec<Diagnosis>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, hypothesis, claims, next_steps, citations, confidence,
                    low_confidence, caveat, supersedes, created_at
             FROM diagnoses WHERE incident_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![incident_id], map_diagnosis)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Latest diagnoses of other incidents on `service`, newest first.
    pub fn past_diagnoses(
        &self,
        service: &str,
        exclude_incident: &str,
        limit: usize,
    ) -> Result<Vec<PastIncident>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT i.incident_id, i.status, i.owner, d.hypothesis, d.confidence,
                    d.low_confidence, d.created_at
             FROM incidents i
             JOIN diagnoses d
               ON d.id = (SELECT MAX(id) FROM diagnoses WHERE incident_id = i.incident_id)
             WHERE i.service = ?1 AND i.incident_id != ?2
             ORDER BY d.id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![service, exclude_incident, limit as i64], |row| {
            Ok(PastIncident {
                incident_id: row.get(0)?,
                status: db::tag_col(row, 1, IncidentStatus::parse)?,
                owner: row.get(2)?,
                hypothesis: row.get(3)?,
                confidence: row.get(4)?,
                low_confidence: row.get(5)?,
                diagnosed_at: db::time_col(row, 6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Stores the ranked candidate list derived from `diagnosis_id`.
    pub fn record_candidates(
        &self,
        incident_id: &str,
        diagnosis_id: i64,
        candidates: &[CandidateOwner],
    ) -> Result<(), StoreError> {
        let mut conn = db::connect(&self.db_path)?;
        let tx = conn.transaction()?;
        for (rank, candidate) in candidates.iter().enumerate() {
            tx.execute(
                "INSERT INTO candidate_owners (incident_id, diagnosis_id, rank, team, candidate)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    incident_id,
                    diagnosis_id,
                    rank as i64,
                    candidate.team,
                    serde_json::to_string(candidate)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Candidates attached to the most recent diagnosis that has any.
    pub fn candidates(&self, incident_id: &str) -> Result<Vec<CandidateOwner>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT candidate FROM candidate_owners
             WHERE incident_id = ?1
               AND diagnosis_id = (SELECT MAX(diagnosis_id) FROM candidate_owners WHERE incident_id = ?1)
             ORDER BY rank ASC",
        )?;
        let rows = stmt.query_map(params![incident_id], |row| db::json_col(row, 0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn map_incident(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
    let severity: Option<String> = row.get(3)?;
    Ok(Incident {
        incident_id: row.get(0)?,
        alert: db::json_col(row, 1)?,
        service: row.get(2)?,
        severity: severity.as_deref().and_then(Severity::parse),
        status: db::tag_col(row, 4, IncidentStatus::parse)?,
        created_at: db::time_col(row, 5)?,
        deadline_at: db::time_col(row, 6)?,
        owner: row.get(7)?,
        channel: db::opt_json_col(row, 8)?,
        degraded: row.get(9)?,
        failure_reason: row.get(10)?,
    })
}

fn map_diagnosis(row: &rusqlite::Row<'_>) -> rusqlite::Result<Diagnosis> {
    Ok(Diagnosis {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        hypothesis: row.get(2)?,
        claims: db::json_col(row, 3)?,
        next_steps: db::json_col(row, 4)?,
        citations: db::json_col(row, 5)?,
        confidence: row.get(6)?,
        low_confidence: row.get(7)?,
        caveat: row.get(8)?,
        supersedes: row.get(9)?,
        created_at: db::time_col(row, 10)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_db_path;
    use crate::model::{Claim, ToolOutcome};
    use crate::tools::ToolOperation;
    use alert_registry::{CanonicalAlert, ALERT_SCHEMA_V1};

    pub(crate) fn sample_incident(id: &str) -> Incident {
        let now = Utc::now();
        Incident {
            incident_id: id.into(),
            alert: CanonicalAlert {
                schema: ALERT_SCHEMA_V1.into(),
                incident_id: id.into(),
                service: "payments-api".into(),
                severity: "critical".into(),
                title: "High error rate on payments-api".into(),
                description: String::new(),
                triggered_at: now.to_rfc3339(),
                html_url: None,
                source: "pagerduty".into(),
            },
            service: "payments-api".into(),
            severity: Some(Severity::Critical),
            status: IncidentStatus::Received,
            created_at: now,
            deadline_at: now + chrono::Duration::seconds(120),
            owner: None,
            channel: None,
            degraded: false,
            failure_reason: None,
        }
    }

    #[test]
    fn duplicate_incident_is_rejected() {
        let store = IncidentStore::open(&test_db_path("incidents-dup")).expect("open");
        store.create(&sample_incident("PD-1")).expect("create");
        let err = store.create(&sample_incident("PD-1")).expect_err("duplicate");
        assert!(matches!(err, StoreError::Duplicate(id) if id == "PD-1"));
    }

    #[test]
    fn status_never_regresses() {
        let store = IncidentStore::open(&test_db_path("incidents-monotonic")).expect("open");
        store.create(&sample_incident("PD-2")).expect("create");

        assert!(store.advance("PD-2", IncidentStatus::Investigating).expect("advance"));
        assert!(!store.advance("PD-2", IncidentStatus::Acknowledged).expect("regress"));
        assert!(!store.advance("PD-2", IncidentStatus::Investigating).expect("repeat"));
        assert!(store.mark_failed("PD-2", "store offline").expect("fail"));
        assert!(!store.advance("PD-2", IncidentStatus::Closed).expect("after failed"));

        let incident = store.require("PD-2").expect("get");
        assert_eq!(incident.status, IncidentStatus::Failed);
        assert_eq!(incident.failure_reason.as_deref(), Some("store offline"));
        assert_eq!(store.failed_incidents().expect("failed").len(), 1);
        assert!(store.open_incidents().expect("open").is_empty());
    }

    #[test]
    fn newer_diagnosis_supersedes_without_rewriting() {
        let store = IncidentStore::open(&test_db_path("incidents-diagnosis")).expect("open");
        store.create(&sample_incident("PD-3")).expect("create");

        let mut diagnosis = Diagnosis {
            id: 0,
            incident_id: "PD-3".into(),
            hypothesis: "node failure".into(),
            claims: vec![Claim {
                statement: "Node ip-10-0-1-5 is NotReady".into(),
                citations: vec![1],
            }],
            next_steps: vec!["Cordon the node".into()],
            citations: vec![1],
            confidence: 0.8,
            low_confidence: false,
            caveat: None,
            supersedes: None,
            created_at: Utc::now(),
        };
        let first = store.record_diagnosis(&diagnosis).expect("first");
        diagnosis.hypothesis = "node failure causing DB connection exhaustion".into();
        let second = store.record_diagnosis(&diagnosis).expect("second");

        let current = store.current_diagnosis("PD-3").expect("query").expect("present");
        assert_eq!(current.id, second);
        assert_eq!(current.supersedes, Some(first));
        let history = store.diagnosis_history("PD-3").expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].hypothesis, "node failure");
    }

    #[test]
    fn past_diagnoses_cover_other_incidents_on_the_service() {
        let store = IncidentStore::open(&test_db_path("incidents-past")).expect("open");
        let diagnosis = |incident_id: &str, hypothesis: &str| Diagnosis {
            id: 0,
            incident_id: incident_id.into(),
            hypothesis: hypothesis.into(),
            claims: Vec::new(),
            next_steps: Vec::new(),
            citations: Vec::new(),
            confidence: 0.8,
            low_confidence: false,
            caveat: None,
            supersedes: None,
            created_at: Utc::now(),
        };
        for id in ["PD-10", "PD-11", "PD-12"] {
            store.create(&sample_incident(id)).expect("create");
        }
        let mut other = sample_incident("PD-13");
        other.service = "ledger-worker".into();
        store.create(&other).expect("create");

        store.record_diagnosis(&diagnosis("PD-10", "node failure")).expect("record");
        store.record_diagnosis(&diagnosis("PD-10", "node failure causing DB exhaustion")).expect("record");
        store.record_diagnosis(&diagnosis("PD-11", "bad deploy")).expect("record");
        store.record_diagnosis(&diagnosis("PD-12", "current incident")).expect("record");
        store.record_diagnosis(&diagnosis("PD-13", "other service")).expect("record");

        let past = store.past_diagnoses("payments-api", "PD-12", 5).expect("past");
        let seen: Vec<(&str, &str)> = past
            .iter()
            .map(|p| (p.incident_id.as_str(), p.hypothesis.as_str()))
            .collect();
        assert_eq!(
            seen,
            vec![("PD-11", "bad deploy"), ("PD-10", "node failure causing DB exhaustion")]
        );
        assert_eq!(store.past_diagnoses("payments-api", "PD-12", 1).expect("past").len(), 1);
    }

    #[test]
    fn tool_calls_roundtrip_through_storage() {
        let store = IncidentStore::open(&test_db_path("incidents-tool-calls")).expect("open");
        let operation = ToolOperation::KubernetesNodes { pod_selector: None };
        let now = Utc::now();
        let id = store
            .record_tool_call(&ToolCallRecord {
                id: 0,
                incident_id: "PD-4".into(),
                integration: operation.integration(),
                fingerprint: operation.fingerprint(),
                operation,
                role: RoleKind::Investigator,
                started_at: now,
                finished_at: now,
                outcome: ToolOutcome::Timeout {
                    message: "exceeded 20s".into(),
                },
                attempts: 1,
                evidence_id: None,
            })
            .expect("record");

        let calls = store.tool_calls("PD-4").expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, id);
        assert_eq!(calls[0].integration, IntegrationKind::Kubernetes);
        assert!(!calls[0].outcome.is_success());
    }
}
