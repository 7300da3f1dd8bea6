use alert_registry::CanonicalAlert;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ToolErrorKind;

pub type EvidenceId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Accepts the canonical vocabulary produced by `alert_registry::normalize_severity`.
    pub fn parse(value: &str) -> Option<Self> {
        match alert_registry::normalize_severity(value)? {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            _ => Some(Severity::Low),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Lifecycle of one incident. Every state except `Failed` sits on a single
/// forward path; `Failed` is reachable from any non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Received,
    Acknowledged,
    Investigating,
    Diagnosing,
    Escalating,
    AwaitingHuman,
    Closed,
    Failed,
}

impl IncidentStatus {
    pub fn rank(&self) -> i64 {
        match self {
            IncidentStatus::Received => 0,
            IncidentStatus::Acknowledged => 1,
            IncidentStatus::Investigating => 2,
            IncidentStatus::Diagnosing => 3,
            IncidentStatus::Escalating => 4,
            IncidentStatus::AwaitingHuman => 5,
            IncidentStatus::Closed => 6,
            IncidentStatus::Failed => 100,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Closed | IncidentStatus::Failed)
    }

    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == IncidentStatus::Failed || next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Received => "received",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Diagnosing => "diagnosing",
            IncidentStatus::Escalating => "escalating",
            IncidentStatus::AwaitingHuman => "awaiting_human",
            IncidentStatus::Closed => "closed",
            IncidentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "received" => IncidentStatus::Received,
            "acknowledged" => IncidentStatus::Acknowledged,
            "investigating" => IncidentStatus::Investigating,
            "diagnosing" => IncidentStatus::Diagnosing,
            "escalating" => IncidentStatus::Escalating,
            "awaiting_human" => IncidentStatus::AwaitingHuman,
            "closed" => IncidentStatus::Closed,
            "failed" => IncidentStatus::Failed,
            _ => return None,
        })
    }
}

/// Source-system tag for evidence and the key the gateway dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    PagerDuty,
    Prometheus,
    Splunk,
    Grafana,
    Kubernetes,
    Github,
}

impl IntegrationKind {
    pub const ALL: [IntegrationKind; 6] = [
        IntegrationKind::Kubernetes,
        IntegrationKind::Prometheus,
        IntegrationKind::Splunk,
        IntegrationKind::Github,
        IntegrationKind::Grafana,
        IntegrationKind::PagerDuty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::PagerDuty => "pager_duty",
            IntegrationKind::Prometheus => "prometheus",
            IntegrationKind::Splunk => "splunk",
            IntegrationKind::Grafana => "grafana",
            IntegrationKind::Kubernetes => "kubernetes",
            IntegrationKind::Github => "github",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Responder,
    Investigator,
    Analyst,
    Manager,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::Responder => "responder",
            RoleKind::Investigator => "investigator",
            RoleKind::Analyst => "analyst",
            RoleKind::Manager => "manager",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "responder" => RoleKind::Responder,
            "investigator" => RoleKind::Investigator,
            "analyst" => RoleKind::Analyst,
            "manager" => RoleKind::Manager,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub alert: CanonicalAlert,
    pub service: String,
    pub severity: Option<Severity>,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub owner: Option<String>,
    pub channel: Option<ChannelRef>,
    /// Set when escalation had to fall back to the default target.
    pub degraded: bool,
    pub failure_reason: Option<String>,
}

/// What part of the system a finding points at; used to map findings onto
/// owning teams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Service,
    Pod,
    Node,
    Database,
    Cache,
    Network,
    CodeChange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    NodeNotReady,
    PodUnhealthy,
    WarningEvent,
    RecentChange,
    MetricSpike,
    ErrorBurst,
}

impl FindingKind {
    /// Causes explain an incident; symptoms only corroborate one.
    pub fn is_cause(&self) -> bool {
        matches!(
            self,
            FindingKind::NodeNotReady
                | FindingKind::PodUnhealthy
                | FindingKind::WarningEvent
                | FindingKind::RecentChange
        )
    }

    pub fn weight(&self) -> f64 {
        match self {
            FindingKind::NodeNotReady => 0.8,
            FindingKind::PodUnhealthy => 0.75,
            FindingKind::RecentChange => 0.6,
            FindingKind::WarningEvent => 0.5,
            FindingKind::MetricSpike | FindingKind::ErrorBurst => 0.6,
        }
    }
}

/// A typed abnormality extracted from a vendor payload when it is rendered
/// into evidence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    /// Node, pod, metric, commit or log pattern the finding is about.
    pub subject: String,
    /// Short phrase usable inside a hypothesis ("node failure").
    pub label: String,
    /// One-sentence claim ("Node ip-10-0-1-5 is NotReady").
    pub detail: String,
    pub component: Component,
    /// True when the query was scoped to the alerting service's own footprint.
    pub direct: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEvidence {
    pub incident_id: String,
    pub source: IntegrationKind,
    pub query: String,
    pub payload: serde_json::Value,
    pub summary: String,
    pub link: Option<String>,
    pub media: Option<String>,
    pub findings: Vec<Finding>,
    /// Arrived after the response deadline had already moved the incident on.
    pub late: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: EvidenceId,
    pub incident_id: String,
    pub source: IntegrationKind,
    pub query: String,
    pub payload: serde_json::Value,
    pub summary: String,
    pub link: Option<String>,
    pub media: Option<String>,
    pub findings: Vec<Finding>,
    pub late: bool,
    pub retrieved_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Failure { kind: ToolErrorKind, message: String },
    Timeout { message: String },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: i64,
    pub incident_id: String,
    pub integration: IntegrationKind,
    pub operation: crate::tools::ToolOperation,
    pub fingerprint: String,
    pub role: RoleKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ToolOutcome,
    pub attempts: u32,
    pub evidence_id: Option<EvidenceId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub statement: String,
    pub citations: Vec<EvidenceId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: i64,
    pub incident_id: String,
    pub hypothesis: String,
    pub claims: Vec<Claim>,
    pub next_steps: Vec<String>,
    pub citations: Vec<EvidenceId>,
    pub confidence: f64,
    pub low_confidence: bool,
    pub caveat: Option<String>,
    pub supersedes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// The latest diagnosis of an earlier incident on the same service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PastIncident {
    pub incident_id: String,
    pub status: IncidentStatus,
    pub owner: Option<String>,
    pub hypothesis: String,
    pub confidence: f64,
    pub low_confidence: bool,
    pub diagnosed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnCallContact {
    pub name: String,
    pub chat_user: String,
    pub pagerduty_user: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateOwner {
    pub team: String,
    pub display_name: String,
    pub oncall: OnCallContact,
    pub confidence: f64,
    pub evidence: Vec<EvidenceId>,
    pub owns_alerting_service: bool,
    pub rationale: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use IncidentStatus::*;
        assert!(Received.can_transition_to(Acknowledged));
        assert!(Received.can_transition_to(Investigating));
        assert!(!Diagnosing.can_transition_to(Investigating));
        assert!(!Escalating.can_transition_to(Escalating));
        assert!(Escalating.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Closed));
    }

    #[test]
    fn status_and_kind_names_roundtrip() {
        for status in [
            IncidentStatus::Received,
            IncidentStatus::AwaitingHuman,
            IncidentStatus::Failed,
        ] {
            assert_eq!(IncidentStatus::parse(status.as_str()), Some(status));
        }
        for kind in IntegrationKind::ALL {
            assert_eq!(IntegrationKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn severity_accepts_vendor_vocabulary() {
        assert_eq!(Severity::parse("P1"), Some(Severity::Critical));
        assert_eq!(Severity::parse("error"), Some(Severity::High));
        assert_eq!(Severity::parse("unknown"), None);
    }
}
