//! Append-only evidence store.
//!
//! Rows are immutable (enforced by triggers in the schema) and each insert
//! takes the write lock before stamping `retrieved_at`, so reading an
//! incident's evidence in `(retrieved_at, id)` order always yields a stable
//! prefix of any later read.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Arc;

use crate::db;
use crate::error::StoreError;
use crate::model::{EvidenceId, EvidenceItem, IntegrationKind, NewEvidence};
use crate::similarity;

const COLUMNS: &str =
    "id, incident_id, source, query, payload, summary, link, media, findings, late, retrieved_at";

#[derive(Clone)]
pub struct EvidenceStore {
    db_path: Arc<PathBuf>,
}

impl EvidenceStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::at(db::prepare(path)?))
    }

    pub(crate) fn at(db_path: Arc<PathBuf>) -> Self {
        Self { db_path }
    }

    pub fn insert(&self, evidence: &NewEvidence) -> Result<EvidenceItem, StoreError> {
        let mut conn = db::connect(&self.db_path)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last: Option<DateTime<Utc>> = tx
            .query_row(
                "SELECT retrieved_at FROM evidence WHERE incident_id = ?1
                 ORDER BY retrieved_at DESC, id DESC LIMIT 1",
                params![evidence.incident_id],
                |row| db::time_col(row, 0),
            )
            .optional()?;
        // Wall clocks can step backwards; never stamp earlier than the tail.
        let now = Utc::now().trunc_subsecs(6);
        let retrieved_at = match last {
            Some(last) if last > now => last,
            _ => now,
        };

        tx.execute(
            "INSERT INTO evidence (incident_id, source, query, payload, summary, link, media,
                findings, late, retrieved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                evidence.incident_id,
                evidence.source.as_str(),
                evidence.query,
                serde_json::to_string(&evidence.payload)?,
                evidence.summary,
                evidence.link,
                evidence.media,
                serde_json::to_string(&evidence.findings)?,
                evidence.late,
                db::timestamp(&retrieved_at),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(EvidenceItem {
            id,
            incident_id: evidence.incident_id.clone(),
            source: evidence.source,
            query: evidence.query.clone(),
            payload: evidence.payload.clone(),
            summary: evidence.summary.clone(),
            link: evidence.link.clone(),
            media: evidence.media.clone(),
            findings: evidence.findings.clone(),
            late: evidence.late,
            retrieved_at,
        })
    }

    /// All evidence for the incident in retrieval order.
    pub fn for_incident(&self, incident_id: &str) -> Result<Vec<EvidenceItem>, StoreError> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM evidence WHERE incident_id = ?1
                 ORDER BY retrieved_at ASC, id ASC"
            ),
            params![incident_id],
        )
    }

    pub fn by_source(
        &self,
        incident_id: &str,
        source: IntegrationKind,
    ) -> Result<Vec<EvidenceItem>, StoreError> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM evidence WHERE incident_id = ?1 AND source = ?2
                 ORDER BY retrieved_at ASC, id ASC"
            ),
            params![incident_id, source.as_str()],
        )
    }

    pub fn get(
        &self,
        incident_id: &str,
        evidence_id: EvidenceId,
    ) -> Result<Option<EvidenceItem>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let item = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM evidence WHERE incident_id = ?1 AND id = ?2"),
                params![incident_id, evidence_id],
                map_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Items whose summary is lexically closest to `query`, best first.
    /// Items sharing no terms with the query are left out.
    pub fn search(
        &self,
        incident_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(EvidenceItem, f64)>, StoreError> {
        let items = self.for_incident(incident_id)?;
        Ok(rank_items(items, query, limit))
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<EvidenceItem>, StoreError> {
        let conn = db::connect(&self.db_path)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, map_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Ranks an in-memory evidence set by similarity of `summary` and `query`
/// text to `query`. Ties keep retrieval order.
pub fn rank_items(items: Vec<EvidenceItem>, query: &str, limit: usize) -> Vec<(EvidenceItem, f64)> {
    let documents: Vec<String> = items
        .iter()
        .map(|item| format!("{} {} {}", item.source.as_str(), item.summary, item.query))
        .collect();
    let refs: Vec<&str> = documents.iter().map(String::as_str).collect();
    let scores = similarity::rank(query, &refs);

    let mut scored: Vec<(EvidenceItem, f64)> = items
        .into_iter()
        .zip(scores)
        .filter(|(_, score)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(limit);
    scored
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvidenceItem> {
    Ok(EvidenceItem {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        source: db::tag_col(row, 2, IntegrationKind::parse)?,
        query: row.get(3)?,
        payload: db::json_col(row, 4)?,
        summary: row.get(5)?,
        link: row.get(6)?,
        media: row.get(7)?,
        findings: db::json_col(row, 8)?,
        late: row.get(9)?,
        retrieved_at: db::time_col(row, 10)?,
    })
}
