//! Policy units that take part in one incident's triage.
//!
//! A role sees an explicit snapshot ([`RoleContext`]) and answers with tool
//! requests, a finished artifact, or nothing. Roles never write to the stores
//! themselves; the coordinator persists what they return.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Stores;
use crate::error::StoreError;
use crate::model::{
    CandidateOwner, Claim, Diagnosis, EvidenceId, EvidenceItem, Incident, OnCallContact,
    PastIncident, RoleKind, Severity, ToolCallRecord,
};
use crate::tools::ToolRequest;

pub mod analyst;
pub mod investigator;
pub mod manager;
pub mod responder;

pub use analyst::Analyst;
pub use investigator::Investigator;
pub use manager::Manager;
pub use responder::Responder;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionBudget {
    pub max_tool_calls: usize,
    pub max_turns: u32,
}

const HISTORY_LIMIT: usize = 5;

/// Everything a role may look at for one activation.
#[derive(Clone, Debug)]
pub struct RoleContext {
    pub incident: Incident,
    pub evidence: Vec<EvidenceItem>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub diagnosis: Option<Diagnosis>,
    /// Earlier incidents on the same service, newest first.
    pub history: Vec<PastIncident>,
    pub budget: ActionBudget,
    pub turn: u32,
    pub spent_tool_calls: usize,
    /// Calls still in flight when the deadline cut waiting short.
    pub outstanding_calls: usize,
    /// End of the time window evidence queries should cover.
    pub window_end: DateTime<Utc>,
    /// Re-query even when an identical call was already made.
    pub refresh: bool,
    /// Follow-up question from the incident thread.
    pub question: Option<String>,
}

impl RoleContext {
    /// Loads the current snapshot of the incident from the stores.
    pub fn load(stores: &Stores, incident_id: &str, budget: ActionBudget) -> Result<Self, StoreError> {
        let incident = stores.incidents.require(incident_id)?;
        Ok(Self {
            evidence: stores.evidence.for_incident(incident_id)?,
            tool_calls: stores.incidents.tool_calls(incident_id)?,
            diagnosis: stores.incidents.current_diagnosis(incident_id)?,
            history: stores
                .incidents
                .past_diagnoses(&incident.service, incident_id, HISTORY_LIMIT)?,
            budget,
            turn: 0,
            spent_tool_calls: 0,
            outstanding_calls: 0,
            window_end: incident.created_at,
            refresh: false,
            question: None,
            incident,
        })
    }

    pub fn evidence_by_id(&self, id: EvidenceId) -> Option<&EvidenceItem> {
        self.evidence.iter().find(|item| item.id == id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoleOutput {
    Dispatch(Vec<ToolRequest>),
    Artifact(Artifact),
    Abstain { reason: String },
}

impl RoleOutput {
    pub fn abstain(reason: impl Into<String>) -> Self {
        RoleOutput::Abstain {
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Artifact {
    Acknowledgement(Acknowledgement),
    Diagnosis(DiagnosisDraft),
    Escalation(EscalationPlan),
    Answer(ThreadAnswer),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acknowledgement {
    pub service: String,
    pub severity: Severity,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisDraft {
    pub hypothesis: String,
    pub claims: Vec<Claim>,
    pub next_steps: Vec<String>,
    pub citations: Vec<EvidenceId>,
    pub confidence: f64,
    pub low_confidence: bool,
    pub caveat: Option<String>,
}

impl DiagnosisDraft {
    pub fn into_diagnosis(self, incident_id: &str) -> Diagnosis {
        Diagnosis {
            id: 0,
            incident_id: incident_id.to_string(),
            hypothesis: self.hypothesis,
            claims: self.claims,
            next_steps: self.next_steps,
            citations: self.citations,
            confidence: self.confidence,
            low_confidence: self.low_confidence,
            caveat: self.caveat,
            supersedes: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationTarget {
    pub team: String,
    pub display_name: String,
    pub oncall: OnCallContact,
}

/// What the Manager wants the escalation to achieve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationPlan {
    pub channel_name: String,
    pub summary: String,
    /// Ranked; empty when no evidence implicated anyone.
    pub candidates: Vec<CandidateOwner>,
    pub primary: EscalationTarget,
    /// Chat users to invite.
    pub invitees: Vec<String>,
    pub fallback: EscalationTarget,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadAnswer {
    pub question: String,
    pub markdown: String,
    pub cited: Vec<EvidenceId>,
    pub wants_fresh_data: bool,
}

#[async_trait]
pub trait Role: Send + Sync {
    fn kind(&self) -> RoleKind;

    async fn act(&self, ctx: &RoleContext) -> RoleOutput;
}

#[cfg(test)]
pub(crate) fn test_context(incident: Incident) -> RoleContext {
    RoleContext {
        window_end: incident.created_at,
        incident,
        evidence: Vec::new(),
        tool_calls: Vec::new(),
        diagnosis: None,
        history: Vec::new(),
        budget: ActionBudget {
            max_tool_calls: 12,
            max_turns: 2,
        },
        turn: 0,
        spent_tool_calls: 0,
        outstanding_calls: 0,
        refresh: false,
        question: None,
    }
}
