use async_trait::async_trait;
use tracing::warn;

use super::{Artifact, DiagnosisDraft, Role, RoleContext, RoleOutput};
use crate::llm::{self, LlmConfig};
use crate::model::{Claim, Component, EvidenceId, FindingKind, RoleKind};

const CORROBORATION_BONUS: f64 = 0.1;
const RECURRENCE_BONUS: f64 = 0.05;
const MAX_CONFIDENCE: f64 = 0.95;
const SYMPTOM_ONLY_FACTOR: f64 = 0.6;
const NO_FINDING_CONFIDENCE: f64 = 0.1;
const LOW_CONFIDENCE_BELOW: f64 = 0.5;
const MAX_FAILED_SHARE: f64 = 0.5;

/// Reasons over whatever evidence exists (partial sets included) and always
/// produces a diagnosis, caveated when the evidence is thin.
pub struct Analyst {
    llm: Option<LlmConfig>,
}

impl Analyst {
    pub fn new(llm: Option<LlmConfig>) -> Self {
        Self { llm }
    }
}

/// Findings of the same kind about the same subject, across evidence items.
#[derive(Clone, Debug)]
struct FindingGroup {
    kind: FindingKind,
    subject: String,
    label: String,
    detail: String,
    component: Component,
    direct: bool,
    evidence: Vec<EvidenceId>,
}

fn group_findings(ctx: &RoleContext) -> Vec<FindingGroup> {
    let mut groups: Vec<FindingGroup> = Vec::new();
    for item in &ctx.evidence {
        for finding in &item.findings {
            match groups
                .iter_mut()
                .find(|g| g.kind == finding.kind && g.subject == finding.subject)
            {
                Some(group) => {
                    group.direct |= finding.direct;
                    if !group.evidence.contains(&item.id) {
                        group.evidence.push(item.id);
                    }
                }
                None => groups.push(FindingGroup {
                    kind: finding.kind,
                    subject: finding.subject.clone(),
                    label: finding.label.clone(),
                    detail: finding.detail.clone(),
                    component: finding.component,
                    direct: finding.direct,
                    evidence: vec![item.id],
                }),
            }
        }
    }
    groups
}

/// Strongest group first; the sort is stable so ties keep evidence order.
fn strongest<'a>(groups: impl Iterator<Item = &'a FindingGroup>) -> Option<&'a FindingGroup> {
    let mut ranked: Vec<&FindingGroup> = groups.collect();
    ranked.sort_by(|a, b| {
        b.kind
            .weight()
            .total_cmp(&a.kind.weight())
            .then(b.direct.cmp(&a.direct))
            .then(b.evidence.len().cmp(&a.evidence.len()))
    });
    ranked.first().copied()
}

fn next_step(group: &FindingGroup) -> String {
    let subject = &group.subject;
    match group.kind {
        FindingKind::NodeNotReady => {
            format!("Check kubelet and node health on {subject}; cordon and drain it if it stays NotReady")
        }
        FindingKind::PodUnhealthy => format!("Inspect logs and restart history of pod {subject}"),
        FindingKind::WarningEvent => format!("Review Kubernetes warning events on {subject}"),
        FindingKind::RecentChange => {
            format!("Review change {subject} and roll it back if it lines up with the alert")
        }
        FindingKind::MetricSpike if group.component == Component::Database => {
            format!("Check database connection pool and query load ({subject})")
        }
        FindingKind::MetricSpike => format!("Watch {subject} until it returns to its baseline"),
        FindingKind::ErrorBurst => {
            format!("Search logs for \"{subject}\" to find the failing code path")
        }
    }
}

/// Builds the rule-based diagnosis for the current snapshot.
pub fn diagnose(ctx: &RoleContext) -> DiagnosisDraft {
    let groups = group_findings(ctx);
    let cause = strongest(groups.iter().filter(|g| g.kind.is_cause()));
    let symptom = strongest(groups.iter().filter(|g| !g.kind.is_cause()));

    let (hypothesis, mut confidence) = match (cause, symptom) {
        (Some(cause), Some(symptom)) => (
            format!("{} causing {}", cause.label, symptom.label),
            (cause.kind.weight() + CORROBORATION_BONUS).min(MAX_CONFIDENCE),
        ),
        (Some(cause), None) => (
            format!("{} ({})", cause.label, cause.subject),
            cause.kind.weight(),
        ),
        (None, Some(symptom)) => (
            format!("{} with no upstream cause identified", symptom.label),
            symptom.kind.weight() * SYMPTOM_ONLY_FACTOR,
        ),
        (None, None) => (
            "Insufficient evidence to determine a probable cause".to_string(),
            NO_FINDING_CONFIDENCE,
        ),
    };

    // Lead with the chosen cause and symptom, then the rest in evidence order.
    let mut ordered: Vec<&FindingGroup> = cause.into_iter().chain(symptom).collect();
    for group in &groups {
        if !ordered
            .iter()
            .any(|g| g.kind == group.kind && g.subject == group.subject)
        {
            ordered.push(group);
        }
    }

    let claims: Vec<Claim> = ordered
        .iter()
        .map(|group| Claim {
            statement: group.detail.clone(),
            citations: group.evidence.clone(),
        })
        .collect();
    let mut citations: Vec<EvidenceId> = Vec::new();
    for id in claims.iter().flat_map(|c| c.citations.iter()) {
        if !citations.contains(id) {
            citations.push(*id);
        }
    }

    let mut next_steps: Vec<String> = Vec::new();
    for step in ordered.iter().map(|g| next_step(g)) {
        if !next_steps.contains(&step) {
            next_steps.push(step);
        }
    }
    // A cause already diagnosed on an earlier incident of this service
    // corroborates the current one.
    let recurrence = cause.and_then(|cause| {
        let label = cause.label.to_lowercase();
        ctx.history
            .iter()
            .find(|past| !past.low_confidence && past.hypothesis.to_lowercase().contains(&label))
    });
    if let Some(past) = recurrence {
        confidence = (confidence + RECURRENCE_BONUS).min(MAX_CONFIDENCE);
        next_steps.push(format!(
            "Compare with {}, diagnosed on {} with the same cause: {}",
            past.incident_id,
            past.diagnosed_at.format("%Y-%m-%d"),
            past.hypothesis
        ));
    }
    if next_steps.is_empty() {
        next_steps.push(format!(
            "Check the {} dashboards and recent deploys by hand",
            ctx.incident.service
        ));
        next_steps.push("Re-run the investigation once integrations recover".into());
    }

    let read_only: Vec<_> = ctx
        .tool_calls
        .iter()
        .filter(|call| call.operation.is_read_only())
        .collect();
    let unsuccessful = read_only.iter().filter(|call| !call.outcome.is_success()).count()
        + ctx.outstanding_calls;
    let attempted = read_only.len() + ctx.outstanding_calls;
    let failed_share = if attempted == 0 {
        0.0
    } else {
        unsuccessful as f64 / attempted as f64
    };

    let low_confidence = ctx.evidence.is_empty()
        || failed_share > MAX_FAILED_SHARE
        || cause.is_none()
        || confidence < LOW_CONFIDENCE_BELOW;

    let caveat = if ctx.evidence.is_empty() {
        Some("No evidence could be retrieved before the response deadline; this diagnosis is unverified".into())
    } else if unsuccessful > 0 {
        Some(format!(
            "{unsuccessful} of {attempted} evidence queries failed or timed out"
        ))
    } else if low_confidence {
        Some("Evidence is sparse; treat this hypothesis as tentative".into())
    } else {
        None
    };

    DiagnosisDraft {
        hypothesis,
        claims,
        next_steps,
        citations,
        confidence,
        low_confidence,
        caveat,
    }
}

#[async_trait]
impl Role for Analyst {
    fn kind(&self) -> RoleKind {
        RoleKind::Analyst
    }

    async fn act(&self, ctx: &RoleContext) -> RoleOutput {
        let mut draft = diagnose(ctx);

        if let Some(config) = &self.llm {
            if !ctx.evidence.is_empty() {
                match llm::refine_hypothesis(config, &ctx.incident, &ctx.evidence, &draft.hypothesis)
                    .await
                {
                    Ok(refinement) => {
                        draft.hypothesis = refinement.hypothesis;
                        for id in refinement.citations {
                            if !draft.citations.contains(&id) {
                                draft.citations.push(id);
                            }
                        }
                    }
                    Err(err) => warn!(
                        incident_id = %ctx.incident.incident_id,
                        error = %err,
                        "llm refinement failed; keeping rule-based hypothesis"
                    ),
                }
            }
        }

        RoleOutput::Artifact(Artifact::Diagnosis(draft))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::incidents::tests::sample_incident;
    use crate::model::{EvidenceItem, Finding, IntegrationKind, ToolCallRecord, ToolOutcome};
    use crate::roles::test_context;
    use crate::tools::ToolOperation;
    use chrono::Utc;

    pub(crate) fn item(id: EvidenceId, source: IntegrationKind, findings: Vec<Finding>) -> EvidenceItem {
        EvidenceItem {
            id,
            incident_id: "PD-1".into(),
            source,
            query: format!("query {id}"),
            payload: serde_json::json!({}),
            summary: format!("summary {id}"),
            link: None,
            media: None,
            findings,
            late: false,
            retrieved_at: Utc::now(),
        }
    }

    pub(crate) fn node_not_ready() -> Finding {
        Finding {
            kind: FindingKind::NodeNotReady,
            subject: "ip-10-0-1-5".into(),
            label: "node failure".into(),
            detail: "Node ip-10-0-1-5 is NotReady".into(),
            component: Component::Node,
            direct: true,
        }
    }

    pub(crate) fn db_spike() -> Finding {
        Finding {
            kind: FindingKind::MetricSpike,
            subject: "db_connections_active".into(),
            label: "DB connection exhaustion".into(),
            detail: "db_connections_active peaked at 98.0, 4.9x its baseline of 20.0".into(),
            component: Component::Database,
            direct: true,
        }
    }

    fn call(outcome: ToolOutcome) -> ToolCallRecord {
        let op = ToolOperation::KubernetesNodes { pod_selector: None };
        ToolCallRecord {
            id: 0,
            incident_id: "PD-1".into(),
            integration: IntegrationKind::Kubernetes,
            fingerprint: op.fingerprint(),
            operation: op,
            role: RoleKind::Investigator,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome,
            attempts: 1,
            evidence_id: None,
        }
    }

    fn past(id: &str, hypothesis: &str, low_confidence: bool) -> crate::model::PastIncident {
        crate::model::PastIncident {
            incident_id: id.into(),
            status: crate::model::IncidentStatus::Closed,
            owner: Some("container-infra".into()),
            hypothesis: hypothesis.into(),
            confidence: 0.9,
            low_confidence,
            diagnosed_at: Utc::now(),
        }
    }

    #[test]
    fn recurring_cause_is_corroborated_by_history() {
        let mut ctx = test_context(sample_incident("PD-1"));
        ctx.evidence = vec![
            item(1, IntegrationKind::Prometheus, vec![db_spike()]),
            item(2, IntegrationKind::Kubernetes, vec![node_not_ready()]),
        ];
        ctx.tool_calls = vec![call(ToolOutcome::Success); 2];
        ctx.history = vec![
            past("PD-0", "Insufficient evidence to determine a probable cause", true),
            past("PD-7", "Node failure causing DB connection exhaustion", false),
        ];

        let draft = diagnose(&ctx);
        assert!((draft.confidence - 0.95).abs() < 1e-9);
        assert!(draft
            .next_steps
            .last()
            .is_some_and(|step| step.starts_with("Compare with PD-7")));
        // History alone never produces citations.
        assert_eq!(draft.citations, vec![2, 1]);
    }

    #[test]
    fn unrelated_or_tentative_history_is_ignored() {
        let mut ctx = test_context(sample_incident("PD-1"));
        ctx.evidence = vec![
            item(1, IntegrationKind::Prometheus, vec![db_spike()]),
            item(2, IntegrationKind::Kubernetes, vec![node_not_ready()]),
        ];
        ctx.tool_calls = vec![call(ToolOutcome::Success); 2];
        ctx.history = vec![
            past("PD-5", "bad deploy (#482)", false),
            past("PD-6", "node failure (ip-10-0-1-9)", true),
        ];

        let draft = diagnose(&ctx);
        assert!((draft.confidence - 0.9).abs() < 1e-9);
        assert!(!draft.next_steps.iter().any(|s| s.starts_with("Compare with")));
    }

    #[test]
    fn cause_and_symptom_form_hypothesis() {
        let mut ctx = test_context(sample_incident("PD-1"));
        ctx.evidence = vec![
            item(1, IntegrationKind::Prometheus, vec![db_spike()]),
            item(2, IntegrationKind::Kubernetes, vec![node_not_ready()]),
            item(3, IntegrationKind::Splunk, Vec::new()),
        ];
        ctx.tool_calls = vec![call(ToolOutcome::Success); 3];

        let draft = diagnose(&ctx);
        assert_eq!(draft.hypothesis, "node failure causing DB connection exhaustion");
        assert_eq!(draft.citations, vec![2, 1]);
        assert_eq!(draft.claims.len(), 2);
        assert!((draft.confidence - 0.9).abs() < 1e-9);
        assert!(!draft.low_confidence);
        assert!(draft.caveat.is_none());
        assert!(draft.next_steps[0].contains("ip-10-0-1-5"));
    }

    #[test]
    fn no_evidence_is_low_confidence_without_citations() {
        let mut ctx = test_context(sample_incident("PD-1"));
        ctx.tool_calls = vec![call(ToolOutcome::Timeout {
            message: "deadline".into(),
        })];
        ctx.outstanding_calls = 2;

        let draft = diagnose(&ctx);
        assert!(draft.low_confidence);
        assert!(draft.citations.is_empty());
        assert!(draft.claims.is_empty());
        assert_eq!(draft.next_steps.len(), 2);
        assert!(draft.caveat.is_some());
    }

    #[test]
    fn mostly_failed_queries_lower_confidence() {
        let mut ctx = test_context(sample_incident("PD-1"));
        ctx.evidence = vec![item(1, IntegrationKind::Kubernetes, vec![node_not_ready()])];
        ctx.tool_calls = vec![
            call(ToolOutcome::Success),
            call(ToolOutcome::Failure {
                kind: crate::error::ToolErrorKind::Unavailable,
                message: "503".into(),
            }),
            call(ToolOutcome::Timeout {
                message: "slow".into(),
            }),
        ];

        let draft = diagnose(&ctx);
        assert_eq!(draft.hypothesis, "node failure (ip-10-0-1-5)");
        assert!(draft.low_confidence);
        assert_eq!(draft.caveat.as_deref(), Some("2 of 3 evidence queries failed or timed out"));
    }

    #[test]
    fn symptom_alone_is_flagged() {
        let mut ctx = test_context(sample_incident("PD-1"));
        ctx.evidence = vec![item(1, IntegrationKind::Prometheus, vec![db_spike()])];
        ctx.tool_calls = vec![call(ToolOutcome::Success)];

        let draft = diagnose(&ctx);
        assert_eq!(
            draft.hypothesis,
            "DB connection exhaustion with no upstream cause identified"
        );
        assert!(draft.low_confidence);
        assert_eq!(draft.citations, vec![1]);
    }

    #[tokio::test]
    async fn act_without_llm_returns_rule_based_draft() {
        let mut ctx = test_context(sample_incident("PD-1"));
        ctx.evidence = vec![item(4, IntegrationKind::Kubernetes, vec![node_not_ready()])];
        let output = Analyst::new(None).act(&ctx).await;
        match output {
            RoleOutput::Artifact(Artifact::Diagnosis(draft)) => {
                assert_eq!(draft.citations, vec![4])
            }
            other => panic!("expected diagnosis, got {other:?}"),
        }
    }
}
