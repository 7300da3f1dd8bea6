use ack_effects::Effectful;
use ack_effects_derive::Effectful;
use serde::{Deserialize, Serialize};

use crate::model::{IntegrationKind, RoleKind};

/// Every operation the gateway can perform, with its parameters and effect
/// class. Kubernetes, Prometheus, Splunk, Grafana and GitHub are read-only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Effectful)]
#[serde(tag = "operation", rename_all = "snake_case")]
#[effect(Observe)]
pub enum ToolOperation {
    PagerdutyIncident {
        incident_id: String,
    },
    #[effect(Mutate)]
    PagerdutyAcknowledge {
        incident_id: String,
    },
    #[effect(Mutate)]
    PagerdutyReassign {
        incident_id: String,
        assignee: String,
    },
    PrometheusInstant {
        query: String,
    },
    PrometheusRange {
        query: String,
        start: String,
        end: String,
        step: String,
    },
    SplunkSearch {
        query: String,
        earliest: String,
        latest: String,
    },
    GrafanaPanel {
        dashboard_uid: String,
        panel_id: u32,
    },
    KubernetesEvents {
        namespace: Option<String>,
        field_selector: Option<String>,
    },
    KubernetesPods {
        namespace: String,
        label_selector: String,
    },
    /// Nodes hosting pods that match `pod_selector`, or every node.
    KubernetesNodes {
        pod_selector: Option<String>,
    },
    GithubCommits {
        repository: String,
        since: String,
    },
    GithubPulls {
        repository: String,
    },
}

impl ToolOperation {
    pub fn integration(&self) -> IntegrationKind {
        match self {
            ToolOperation::PagerdutyIncident { .. }
            | ToolOperation::PagerdutyAcknowledge { .. }
            | ToolOperation::PagerdutyReassign { .. } => IntegrationKind::PagerDuty,
            ToolOperation::PrometheusInstant { .. } | ToolOperation::PrometheusRange { .. } => {
                IntegrationKind::Prometheus
            }
            ToolOperation::SplunkSearch { .. } => IntegrationKind::Splunk,
            ToolOperation::GrafanaPanel { .. } => IntegrationKind::Grafana,
            ToolOperation::KubernetesEvents { .. }
            | ToolOperation::KubernetesPods { .. }
            | ToolOperation::KubernetesNodes { .. } => IntegrationKind::Kubernetes,
            ToolOperation::GithubCommits { .. } | ToolOperation::GithubPulls { .. } => {
                IntegrationKind::Github
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolOperation::PagerdutyIncident { .. } => "pagerduty_incident",
            ToolOperation::PagerdutyAcknowledge { .. } => "pagerduty_acknowledge",
            ToolOperation::PagerdutyReassign { .. } => "pagerduty_reassign",
            ToolOperation::PrometheusInstant { .. } => "prometheus_instant",
            ToolOperation::PrometheusRange { .. } => "prometheus_range",
            ToolOperation::SplunkSearch { .. } => "splunk_search",
            ToolOperation::GrafanaPanel { .. } => "grafana_panel",
            ToolOperation::KubernetesEvents { .. } => "kubernetes_events",
            ToolOperation::KubernetesPods { .. } => "kubernetes_pods",
            ToolOperation::KubernetesNodes { .. } => "kubernetes_nodes",
            ToolOperation::GithubCommits { .. } => "github_commits",
            ToolOperation::GithubPulls { .. } => "github_pulls",
        }
    }

    /// Human-readable query description stored with the evidence.
    pub fn describe(&self) -> String {
        match self {
            ToolOperation::PagerdutyIncident { incident_id } => {
                format!("PagerDuty incident {incident_id}")
            }
            ToolOperation::PagerdutyAcknowledge { incident_id } => {
                format!("acknowledge PagerDuty incident {incident_id}")
            }
            ToolOperation::PagerdutyReassign {
                incident_id,
                assignee,
            } => format!("reassign PagerDuty incident {incident_id} to {assignee}"),
            ToolOperation::PrometheusInstant { query } => format!("Prometheus instant `{query}`"),
            ToolOperation::PrometheusRange {
                query, start, end, ..
            } => format!("Prometheus range `{query}` from {start} to {end}"),
            ToolOperation::SplunkSearch {
                query, earliest, ..
            } => format!("Splunk `{query}` since {earliest}"),
            ToolOperation::GrafanaPanel {
                dashboard_uid,
                panel_id,
            } => format!("Grafana panel {panel_id} on dashboard {dashboard_uid}"),
            ToolOperation::KubernetesEvents {
                namespace,
                field_selector,
            } => format!(
                "Kubernetes events in {} ({})",
                namespace.as_deref().unwrap_or("all namespaces"),
                field_selector.as_deref().unwrap_or("no selector")
            ),
            ToolOperation::KubernetesPods {
                namespace,
                label_selector,
            } => format!("Kubernetes pods {label_selector} in {namespace}"),
            ToolOperation::KubernetesNodes { pod_selector } => match pod_selector {
                Some(selector) => format!("Kubernetes nodes hosting {selector}"),
                None => "Kubernetes nodes".into(),
            },
            ToolOperation::GithubCommits { repository, since } => {
                format!("GitHub commits on {repository} since {since}")
            }
            ToolOperation::GithubPulls { repository } => {
                format!("GitHub pull requests on {repository}")
            }
        }
    }

    /// Identity used to deduplicate requests within one incident.
    pub fn fingerprint(&self) -> String {
        let params = serde_json::to_string(self).unwrap_or_else(|_| self.describe());
        format!("{}:{}", self.name(), params)
    }

    pub fn is_read_only(&self) -> bool {
        self.effect().is_read_only()
    }
}

/// A tool call a role wants dispatched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub operation: ToolOperation,
    pub role: RoleKind,
}

impl ToolRequest {
    pub fn new(role: RoleKind, operation: ToolOperation) -> Self {
        Self { operation, role }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ack_effects::Effect;

    #[test]
    fn only_pagerduty_writes_are_mutating() {
        let ack = ToolOperation::PagerdutyAcknowledge {
            incident_id: "PD-1".into(),
        };
        let nodes = ToolOperation::KubernetesNodes { pod_selector: None };
        assert_eq!(ack.effect(), Effect::Mutate);
        assert_eq!(nodes.effect(), Effect::Observe);
        assert!(!ack.is_read_only());
        assert_eq!(ack.integration(), IntegrationKind::PagerDuty);
        assert_eq!(nodes.integration(), IntegrationKind::Kubernetes);
    }

    #[test]
    fn fingerprint_distinguishes_parameters() {
        let a = ToolOperation::PrometheusRange {
            query: "up".into(),
            start: "t0".into(),
            end: "t1".into(),
            step: "60s".into(),
        };
        let b = ToolOperation::PrometheusRange {
            query: "up".into(),
            start: "t0".into(),
            end: "t2".into(),
            step: "60s".into(),
        };
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().starts_with("prometheus_range:"));
    }
}
