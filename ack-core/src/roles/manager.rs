//! Turns a diagnosis into people: ranks candidate owners, picks the primary,
//! writes the channel summary, and answers thread questions from the
//! evidence already on file.

use async_trait::async_trait;
use std::fmt::Write;
use std::sync::Arc;
use tracing::warn;

use super::{Artifact, EscalationPlan, EscalationTarget, Role, RoleContext, RoleOutput, ThreadAnswer};
use crate::bridge::channel_name;
use crate::catalog::ServiceCatalog;
use crate::config::CoordinatorConfig;
use crate::evidence::rank_items;
use crate::model::{CandidateOwner, Diagnosis, EvidenceItem, IntegrationKind, OnCallContact, RoleKind};
use crate::similarity;
use crate::summary::{self, SummaryInput};

const DIRECT_BONUS: f64 = 0.1;
const MAX_CONFIDENCE: f64 = 0.95;
const UNCITED_ANSWER_LIMIT: usize = 3;
const FRESH_DATA_PHRASES: [&str; 5] = ["fresh", "re-run", "rerun", "latest data", "refresh"];

pub struct Manager {
    catalog: Arc<ServiceCatalog>,
    config: Arc<CoordinatorConfig>,
}

impl Manager {
    pub fn new(catalog: Arc<ServiceCatalog>, config: Arc<CoordinatorConfig>) -> Self {
        Self { catalog, config }
    }

    /// Teams implicated by the findings inside cited evidence, best first.
    /// Ties prefer the team that owns the alerting service, then team id.
    pub fn candidates(&self, ctx: &RoleContext, diagnosis: &Diagnosis) -> Vec<CandidateOwner> {
        let service = ctx.incident.service.as_str();
        let service_team = self.catalog.service(service).map(|s| s.team.as_str());
        let mut owners: Vec<CandidateOwner> = Vec::new();

        let cited = diagnosis
            .citations
            .iter()
            .filter_map(|id| ctx.evidence_by_id(*id));
        for item in cited {
            for finding in &item.findings {
                let Some(team_id) = self.catalog.owner_of(finding.component, service) else {
                    continue;
                };
                let Some(team) = self.catalog.team(team_id) else {
                    continue;
                };
                let bonus = if finding.direct { DIRECT_BONUS } else { 0.0 };
                let confidence = (finding.kind.weight() + bonus).min(MAX_CONFIDENCE);
                let rationale = format!("{} ({} evidence)", finding.detail, item.source.as_str());

                match owners.iter_mut().find(|c| c.team == team_id) {
                    Some(owner) => {
                        if !owner.evidence.contains(&item.id) {
                            owner.evidence.push(item.id);
                        }
                        if confidence > owner.confidence {
                            owner.confidence = confidence;
                            owner.rationale = rationale;
                        }
                    }
                    None => owners.push(CandidateOwner {
                        team: team_id.to_string(),
                        display_name: team.display_name.clone(),
                        oncall: team.oncall.clone(),
                        confidence,
                        evidence: vec![item.id],
                        owns_alerting_service: service_team == Some(team_id),
                        rationale,
                    }),
                }
            }
        }

        owners.sort_by(|a, b| {
            let rank = |c: &CandidateOwner| (c.confidence * 1000.0).round() as i64;
            rank(b)
                .cmp(&rank(a))
                .then(b.owns_alerting_service.cmp(&a.owns_alerting_service))
                .then(a.team.cmp(&b.team))
        });
        owners
    }

    /// Who gets the incident when no evidence implicates anyone, or when
    /// escalation to the primary keeps failing.
    pub fn fallback_target(&self) -> EscalationTarget {
        let team_id = self.config.fallback_team.as_str();
        match self.catalog.team(team_id) {
            Some(team) => EscalationTarget {
                team: team_id.to_string(),
                display_name: team.display_name.clone(),
                oncall: team.oncall.clone(),
            },
            None => {
                warn!(team = team_id, "fallback team missing from catalog");
                EscalationTarget {
                    team: team_id.to_string(),
                    display_name: team_id.to_string(),
                    oncall: OnCallContact {
                        name: team_id.to_string(),
                        chat_user: String::new(),
                        pagerduty_user: String::new(),
                    },
                }
            }
        }
    }

    pub fn plan(&self, ctx: &RoleContext, diagnosis: &Diagnosis) -> EscalationPlan {
        let candidates = self.candidates(ctx, diagnosis);
        let fallback = self.fallback_target();
        let primary = candidates
            .first()
            .map(|c| EscalationTarget {
                team: c.team.clone(),
                display_name: c.display_name.clone(),
                oncall: c.oncall.clone(),
            })
            .unwrap_or_else(|| fallback.clone());

        let mut invitees: Vec<String> = Vec::new();
        let users = if candidates.is_empty() {
            vec![fallback.oncall.chat_user.clone()]
        } else {
            candidates.iter().map(|c| c.oncall.chat_user.clone()).collect()
        };
        for user in users {
            if !user.is_empty() && !invitees.contains(&user) {
                invitees.push(user);
            }
        }

        let owner = format!("{} ({})", primary.display_name, primary.oncall.name);
        let summary = summary::format_summary(&SummaryInput {
            incident: &ctx.incident,
            diagnosis,
            candidates: &candidates,
            owner: &owner,
            evidence: &ctx.evidence,
            history: &ctx.history,
            public_url: &self.config.public_url,
        });

        EscalationPlan {
            channel_name: channel_name(&ctx.incident.incident_id, &ctx.incident.service),
            summary,
            candidates,
            primary,
            invitees,
            fallback,
        }
    }

    /// Answers from the existing evidence. Items the diagnosis cited are
    /// preferred; a source named in the question narrows them further.
    pub fn answer(&self, ctx: &RoleContext, question: &str) -> ThreadAnswer {
        let lowered = question.to_lowercase();
        let wants_fresh_data = FRESH_DATA_PHRASES.iter().any(|p| lowered.contains(p));
        let hinted = source_hints(question);

        let citations: Vec<_> = ctx
            .diagnosis
            .as_ref()
            .map(|d| d.citations.clone())
            .unwrap_or_default();
        let cited: Vec<EvidenceItem> = citations
            .iter()
            .filter_map(|id| ctx.evidence_by_id(*id).cloned())
            .collect();

        let selected: Vec<EvidenceItem> = if cited.is_empty() {
            rank_items(ctx.evidence.clone(), question, UNCITED_ANSWER_LIMIT)
                .into_iter()
                .map(|(item, _)| item)
                .collect()
        } else {
            let narrowed: Vec<EvidenceItem> = cited
                .iter()
                .filter(|item| hinted.contains(&item.source))
                .cloned()
                .collect();
            let pool = if narrowed.is_empty() { cited } else { narrowed };
            by_relevance(pool, question)
        };

        let public_url = self.config.public_url.as_str();
        let mut markdown = String::new();
        if selected.is_empty() {
            markdown.push_str("No collected evidence matches that question yet.");
            if !wants_fresh_data {
                markdown.push_str(" Ask for fresh data to re-run the queries.");
            }
        } else {
            if let Some(diagnosis) = &ctx.diagnosis {
                let _ = writeln!(markdown, "Current hypothesis: {}", diagnosis.hypothesis);
            }
            for item in &selected {
                let _ = writeln!(
                    markdown,
                    "- [#{} {}]({}) {}",
                    item.id,
                    item.source.as_str(),
                    summary::evidence_link(item, public_url),
                    item.summary
                );
            }
        }

        ThreadAnswer {
            question: question.to_string(),
            markdown,
            cited: selected.iter().map(|item| item.id).collect(),
            wants_fresh_data,
        }
    }
}

/// Sources named in the question. Matching is on whole tokens so "prevent"
/// does not hint at events and "logic" does not hint at logs.
fn source_hints(question: &str) -> Vec<IntegrationKind> {
    let tokens = similarity::tokenize(question);
    let mentions = |words: &[&str]| -> bool {
        words.iter().any(|word| {
            let phrase = similarity::tokenize(word);
            !phrase.is_empty() && tokens.windows(phrase.len()).any(|w| w == phrase.as_slice())
        })
    };
    let mut kinds = Vec::new();
    if mentions(&["log", "logging", "splunk", "error message"]) {
        kinds.push(IntegrationKind::Splunk);
    }
    if mentions(&["metric", "graph", "dashboard", "prometheus", "grafana"]) {
        kinds.push(IntegrationKind::Prometheus);
        kinds.push(IntegrationKind::Grafana);
    }
    if mentions(&["event", "node", "pod", "cluster", "kubernetes", "k8s"]) {
        kinds.push(IntegrationKind::Kubernetes);
    }
    if mentions(&["commit", "deploy", "deployment", "change", "pr", "pull request", "github"]) {
        kinds.push(IntegrationKind::Github);
    }
    kinds
}

/// Stable ordering by similarity to the question; unrelated items keep
/// their citation order at the end.
fn by_relevance(items: Vec<EvidenceItem>, question: &str) -> Vec<EvidenceItem> {
    let documents: Vec<String> = items
        .iter()
        .map(|item| format!("{} {} {}", item.source.as_str(), item.summary, item.query))
        .collect();
    let refs: Vec<&str> = documents.iter().map(String::as_str).collect();
    let scores = similarity::rank(question, &refs);
    let mut scored: Vec<(EvidenceItem, f64)> = items.into_iter().zip(scores).collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().map(|(item, _)| item).collect()
}

#[async_trait]
impl Role for Manager {
    fn kind(&self) -> RoleKind {
        RoleKind::Manager
    }

    async fn act(&self, ctx: &RoleContext) -> RoleOutput {
        if let Some(question) = &ctx.question {
            return RoleOutput::Artifact(Artifact::Answer(self.answer(ctx, question)));
        }
        match &ctx.diagnosis {
            Some(diagnosis) => RoleOutput::Artifact(Artifact::Escalation(self.plan(ctx, diagnosis))),
            None => RoleOutput::abstain("no diagnosis recorded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidents::tests::sample_incident;
    use crate::model::{Component, Finding, FindingKind};
    use crate::roles::analyst::tests::{db_spike, item, node_not_ready};
    use crate::roles::{analyst, test_context};

    fn manager() -> Manager {
        Manager::new(Arc::new(ServiceCatalog::demo()), Arc::new(CoordinatorConfig::default()))
    }

    fn scenario_context() -> RoleContext {
        let mut ctx = test_context(sample_incident("PD-1"));
        let mut splunk = item(3, IntegrationKind::Splunk, Vec::new());
        splunk.summary = "Splunk error logs: 42 errors, top pattern \"connection refused\"".into();
        ctx.evidence = vec![
            item(1, IntegrationKind::Prometheus, vec![db_spike()]),
            item(2, IntegrationKind::Kubernetes, vec![node_not_ready()]),
            splunk,
        ];
        let mut diagnosis = analyst::diagnose(&ctx).into_diagnosis("PD-1");
        diagnosis.id = 1;
        ctx.diagnosis = Some(diagnosis);
        ctx
    }

    #[test]
    fn node_owner_ranks_above_database() {
        let ctx = scenario_context();
        let diagnosis = ctx.diagnosis.clone().expect("diagnosis");
        let plan = manager().plan(&ctx, &diagnosis);

        let teams: Vec<&str> = plan.candidates.iter().map(|c| c.team.as_str()).collect();
        assert_eq!(teams, vec!["container-infra", "database"]);
        assert!((plan.candidates[0].confidence - 0.9).abs() < 1e-9);
        assert!((plan.candidates[1].confidence - 0.7).abs() < 1e-9);
        assert_eq!(plan.primary.oncall.pagerduty_user, "PINF02");
        assert_eq!(plan.invitees, vec!["U02INF".to_string(), "U03DBA".to_string()]);
        assert_eq!(plan.channel_name, "inc-pd-1-payments-api");
        assert!(plan.summary.contains("node failure causing DB connection exhaustion"));
    }

    #[test]
    fn ties_prefer_service_owner() {
        let mut ctx = test_context(sample_incident("PD-1"));
        let pod = Finding {
            kind: FindingKind::WarningEvent,
            subject: "Pod/payments-api-7d9".into(),
            label: "BackOff events".into(),
            detail: "BackOff on Pod payments-api-7d9".into(),
            component: Component::Pod,
            direct: false,
        };
        let mut node = pod.clone();
        node.component = Component::Node;
        node.subject = "Node/ip-10-0-1-5".into();
        ctx.evidence = vec![item(1, IntegrationKind::Kubernetes, vec![node, pod])];
        let diagnosis = analyst::diagnose(&ctx).into_diagnosis("PD-1");

        let candidates = manager().candidates(&ctx, &diagnosis);
        assert_eq!(candidates[0].team, "payments");
        assert!(candidates[0].owns_alerting_service);
        assert_eq!(candidates[1].team, "container-infra");
    }

    #[test]
    fn empty_citations_fall_back_to_default_team() {
        let ctx = test_context(sample_incident("PD-1"));
        let diagnosis = analyst::diagnose(&ctx).into_diagnosis("PD-1");
        let plan = manager().plan(&ctx, &diagnosis);

        assert!(plan.candidates.is_empty());
        assert_eq!(plan.primary.team, "sre");
        assert_eq!(plan.primary, plan.fallback);
        assert_eq!(plan.invitees, vec!["U04SRE".to_string()]);
        assert!(plan.summary.contains("Low confidence"));
    }

    #[test]
    fn log_question_is_answered_from_cited_evidence() {
        let mut ctx = scenario_context();
        if let Some(diagnosis) = ctx.diagnosis.as_mut() {
            diagnosis.citations.push(3);
        }
        let answer = manager().answer(&ctx, "what logs show this?");

        assert_eq!(answer.cited, vec![3]);
        assert!(!answer.wants_fresh_data);
        assert!(answer
            .markdown
            .contains("(http://localhost:8080/incidents/PD-1/evidence/3)"));
    }

    #[test]
    fn question_without_matching_source_lists_all_citations() {
        let ctx = scenario_context();
        let answer = manager().answer(&ctx, "why did this page fire?");
        assert_eq!(answer.cited.len(), 2);
    }

    #[test]
    fn source_hints_match_whole_words() {
        assert!(source_hints("how do we prevent this next time?").is_empty());
        assert!(source_hints("what is the retry logic here?").is_empty());
        assert_eq!(source_hints("which events fired?"), vec![IntegrationKind::Kubernetes]);
        assert_eq!(source_hints("any recent pull requests?"), vec![IntegrationKind::Github]);
        assert_eq!(source_hints("show me the Logs"), vec![IntegrationKind::Splunk]);
    }

    #[test]
    fn prevention_question_is_not_narrowed_to_kubernetes() {
        let ctx = scenario_context();
        let answer = manager().answer(&ctx, "how do we prevent this?");
        assert_eq!(answer.cited.len(), 2);
    }

    #[tokio::test]
    async fn fresh_data_request_is_flagged() {
        let mut ctx = scenario_context();
        ctx.question = Some("can you re-run the checks with fresh data?".into());
        match manager().act(&ctx).await {
            RoleOutput::Artifact(Artifact::Answer(answer)) => assert!(answer.wants_fresh_data),
            other => panic!("expected answer, got {other:?}"),
        }
    }
}
