//! Chooses which evidence to gather.
//!
//! The first turn fans out over every integration the service's category
//! calls for. Later turns only chase leads found in earlier evidence, such as
//! node-scoped events for a node that is NotReady.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use super::{Role, RoleContext, RoleOutput};
use crate::catalog::{ServiceCatalog, ServiceEntry};
use crate::model::{Component, FindingKind, IntegrationKind, RoleKind};
use crate::tools::{ToolOperation, ToolRequest};

const RANGE_STEP: &str = "60s";

pub struct Investigator {
    catalog: Arc<ServiceCatalog>,
    /// Integrations the gateway can actually reach.
    available: Vec<IntegrationKind>,
    lookback: Duration,
}

impl Investigator {
    pub fn new(catalog: Arc<ServiceCatalog>, available: Vec<IntegrationKind>, lookback_mins: i64) -> Self {
        Self {
            catalog,
            available,
            lookback: Duration::minutes(lookback_mins.max(1)),
        }
    }

    /// Integrations to query for this incident, in investigation order.
    pub fn select_integrations(&self, ctx: &RoleContext) -> Vec<IntegrationKind> {
        let registered = self.catalog.integrations_for(&ctx.incident.service);
        let usable: Vec<IntegrationKind> = IntegrationKind::ALL
            .into_iter()
            .filter(|kind| registered.contains(kind) && self.available.contains(kind))
            .collect();

        let text = format!("{} {}", ctx.incident.alert.title, ctx.incident.alert.description)
            .to_lowercase();
        let rollout = ["deploy", "rollout", "pod", "crashloop", "oomkill"]
            .iter()
            .any(|w| text.contains(w));
        let performance = ["slow", "latency", "performance", "timeout"]
            .iter()
            .any(|w| text.contains(w));

        let narrowed: Vec<IntegrationKind> = usable
            .iter()
            .copied()
            .filter(|kind| !(rollout && *kind == IntegrationKind::Prometheus))
            .filter(|kind| !(performance && *kind == IntegrationKind::Github))
            .collect();
        if narrowed.is_empty() {
            usable
        } else {
            narrowed
        }
    }

    fn initial_operations(&self, ctx: &RoleContext) -> Vec<ToolOperation> {
        let service = ctx.incident.service.as_str();
        let Some(entry) = self.catalog.service(service) else {
            return Vec::new();
        };
        let end = ctx.window_end;
        let start = end - self.lookback;

        let mut ops = Vec::new();
        for kind in self.select_integrations(ctx) {
            match kind {
                IntegrationKind::Kubernetes => ops.extend(kubernetes_queries(service, entry)),
                IntegrationKind::Prometheus => {
                    ops.extend(prometheus_queries(service, entry, start, end))
                }
                IntegrationKind::Splunk => ops.push(ToolOperation::SplunkSearch {
                    query: format!(
                        "search index=* service=\"{service}\" (level=ERROR OR level=FATAL)"
                    ),
                    earliest: rfc3339(start),
                    latest: rfc3339(end),
                }),
                IntegrationKind::Github => {
                    if let Some(repository) = &entry.repository {
                        ops.push(ToolOperation::GithubCommits {
                            repository: repository.clone(),
                            since: rfc3339(start),
                        });
                        ops.push(ToolOperation::GithubPulls {
                            repository: repository.clone(),
                        });
                    }
                }
                IntegrationKind::Grafana => {
                    ops.extend(entry.dashboards.iter().map(|panel| ToolOperation::GrafanaPanel {
                        dashboard_uid: panel.dashboard_uid.clone(),
                        panel_id: panel.panel_id,
                    }))
                }
                IntegrationKind::PagerDuty => ops.push(ToolOperation::PagerdutyIncident {
                    incident_id: ctx.incident.alert.incident_id.clone(),
                }),
            }
        }
        ops
    }

    fn follow_up_operations(&self, ctx: &RoleContext) -> Vec<ToolOperation> {
        if !self.available.contains(&IntegrationKind::Kubernetes) {
            return Vec::new();
        }
        let mut nodes: Vec<&str> = Vec::new();
        for finding in ctx.evidence.iter().flat_map(|item| item.findings.iter()) {
            if finding.kind == FindingKind::NodeNotReady && !nodes.contains(&finding.subject.as_str()) {
                nodes.push(&finding.subject);
            }
        }
        nodes
            .into_iter()
            .map(|node| ToolOperation::KubernetesEvents {
                namespace: None,
                field_selector: Some(format!("involvedObject.kind=Node,involvedObject.name={node}")),
            })
            .collect()
    }
}

#[async_trait]
impl Role for Investigator {
    fn kind(&self) -> RoleKind {
        RoleKind::Investigator
    }

    async fn act(&self, ctx: &RoleContext) -> RoleOutput {
        if ctx.turn >= ctx.budget.max_turns {
            return RoleOutput::abstain("turn budget exhausted");
        }
        let remaining = ctx.budget.max_tool_calls.saturating_sub(ctx.spent_tool_calls);
        if remaining == 0 {
            return RoleOutput::abstain("tool call budget exhausted");
        }

        let candidates = if ctx.turn == 0 {
            self.initial_operations(ctx)
        } else {
            self.follow_up_operations(ctx)
        };

        let mut seen: HashSet<String> = if ctx.refresh {
            HashSet::new()
        } else {
            ctx.tool_calls.iter().map(|call| call.fingerprint.clone()).collect()
        };
        let requests: Vec<ToolRequest> = candidates
            .into_iter()
            .filter(ToolOperation::is_read_only)
            .filter(|op| seen.insert(op.fingerprint()))
            .take(remaining)
            .map(|op| ToolRequest::new(RoleKind::Investigator, op))
            .collect();

        if requests.is_empty() {
            RoleOutput::abstain("no new evidence to gather")
        } else {
            RoleOutput::Dispatch(requests)
        }
    }
}

fn kubernetes_queries(service: &str, entry: &ServiceEntry) -> Vec<ToolOperation> {
    let selector = format!("app={service}");
    vec![
        ToolOperation::KubernetesPods {
            namespace: entry.namespace.clone(),
            label_selector: selector.clone(),
        },
        ToolOperation::KubernetesNodes {
            pod_selector: Some(selector),
        },
        ToolOperation::KubernetesEvents {
            namespace: Some(entry.namespace.clone()),
            field_selector: Some("type=Warning".into()),
        },
    ]
}

/// Availability, error rate and p95 latency, plus connection usage for
/// services backed by a database.
fn prometheus_queries(
    service: &str,
    entry: &ServiceEntry,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<ToolOperation> {
    let range = |query: String| ToolOperation::PrometheusRange {
        query,
        start: rfc3339(start),
        end: rfc3339(end),
        step: RANGE_STEP.into(),
    };

    let mut ops = vec![
        ToolOperation::PrometheusInstant {
            query: format!("up{{job=\"{service}\"}}"),
        },
        range(format!(
            "sum(rate(http_requests_total{{service=\"{service}\",status=~\"5..\"}}[5m]))"
        )),
        range(format!(
            "histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{{service=\"{service}\"}}[5m])) by (le))"
        )),
    ];
    if entry.dependencies.contains(&Component::Database) {
        ops.push(range(format!("sum(db_connections_active{{service=\"{service}\"}})")));
    }
    ops
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
