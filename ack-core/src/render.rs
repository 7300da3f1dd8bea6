//! Turns raw integration payloads into evidence summaries and typed findings.
//!
//! Payload shapes are the normalized ones integrations hand back through the
//! gateway (Prometheus API `data.result`, Kubernetes list `items`, and so on).
//! Anything unexpected still renders; it just yields no findings.

use serde_json::Value;

use crate::model::{Component, Finding, FindingKind};
use crate::tools::ToolOperation;

const SPIKE_RATIO: f64 = 2.0;
const ERROR_BURST_MIN: usize = 5;
const RESTART_THRESHOLD: i64 = 5;
const MAX_EVENT_FINDINGS: usize = 5;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rendered {
    pub summary: String,
    pub link: Option<String>,
    pub media: Option<String>,
    pub findings: Vec<Finding>,
}

pub fn render(operation: &ToolOperation, service: &str, payload: &Value) -> Rendered {
    let mut rendered = match operation {
        ToolOperation::PagerdutyIncident { incident_id } => pagerduty_incident(incident_id, payload),
        ToolOperation::PrometheusRange { query, .. } => prometheus_range(query, service, payload),
        ToolOperation::PrometheusInstant { query } => prometheus_instant(query, payload),
        ToolOperation::SplunkSearch { query, .. } => splunk(query, payload),
        ToolOperation::GrafanaPanel { .. } => grafana(operation, payload),
        ToolOperation::KubernetesEvents { field_selector, .. } => {
            kubernetes_events(service, field_selector.is_some(), payload)
        }
        ToolOperation::KubernetesPods { label_selector, .. } => kubernetes_pods(label_selector, payload),
        ToolOperation::KubernetesNodes { pod_selector } => {
            kubernetes_nodes(pod_selector.is_some(), payload)
        }
        ToolOperation::GithubCommits { repository, since } => github_commits(repository, since, payload),
        ToolOperation::GithubPulls { repository } => github_pulls(repository, payload),
        ToolOperation::PagerdutyAcknowledge { .. } | ToolOperation::PagerdutyReassign { .. } => {
            Rendered {
                summary: format!("{} completed", operation.describe()),
                ..Rendered::default()
            }
        }
    };

    if let Some(link) = str_at(payload, &["link"]) {
        rendered.link = Some(link.to_string());
    }
    rendered
}

/// Classifies a metric query or log pattern by the component it concerns.
pub fn infer_component(text: &str) -> Component {
    let text = text.to_lowercase();
    if ["db_", "pg_", "mysql", "database", "connection"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        Component::Database
    } else if text.contains("redis") || text.contains("cache") {
        Component::Cache
    } else if text.contains("node_") {
        Component::Node
    } else {
        Component::Service
    }
}

fn pagerduty_incident(incident_id: &str, payload: &Value) -> Rendered {
    let incident = payload.get("incident").unwrap_or(payload);
    let status = str_at(incident, &["status"]).unwrap_or("unknown");
    let urgency = str_at(incident, &["urgency"]).unwrap_or("unknown");
    let title = str_at(incident, &["title"]).unwrap_or("");
    Rendered {
        summary: format!("PagerDuty incident {incident_id} is {status} ({urgency} urgency): {title}"),
        link: str_at(incident, &["html_url"]).map(str::to_string),
        ..Rendered::default()
    }
}

fn prometheus_range(query: &str, service: &str, payload: &Value) -> Rendered {
    let series = array_at(payload, &["data", "result"]);
    let metric = metric_name(query);
    let component = infer_component(query);
    let mut findings = Vec::new();
    let mut lines = Vec::new();

    for entry in series {
        let values: Vec<f64> = entry
            .get("values")
            .and_then(Value::as_array)
            .map(|points| points.iter().filter_map(sample_value).collect())
            .unwrap_or_default();
        if values.is_empty() {
            continue;
        }

        let baseline = median(&values[..values.len().div_ceil(2)]);
        let peak = values.iter().copied().fold(f64::MIN, f64::max);
        let spiked = peak > 0.0 && (baseline <= 0.0 || peak >= baseline * SPIKE_RATIO);
        if spiked && findings.is_empty() {
            let ratio = if baseline > 0.0 { peak / baseline } else { peak };
            findings.push(Finding {
                kind: FindingKind::MetricSpike,
                subject: metric.clone(),
                label: spike_label(component, query, &metric),
                detail: format!(
                    "{metric} peaked at {peak:.1}, {ratio:.1}x its baseline of {baseline:.1}"
                ),
                component,
                direct: query.contains(service),
            });
        }
        lines.push(format!("peak {peak:.1} vs baseline {baseline:.1}"));
    }

    let summary = match (lines.len(), findings.first()) {
        (0, _) => format!("Prometheus `{query}` returned no samples"),
        (_, Some(finding)) => format!("Prometheus `{query}`: {}", finding.detail),
        (n, None) => format!("Prometheus `{query}` steady across {n} series ({})", lines[0]),
    };
    Rendered {
        summary,
        findings,
        ..Rendered::default()
    }
}

fn spike_label(component: Component, query: &str, metric: &str) -> String {
    let query = query.to_lowercase();
    match component {
        Component::Database if query.contains("connection") => "DB connection exhaustion".into(),
        Component::Database => "database saturation".into(),
        Component::Cache => "cache pressure".into(),
        Component::Node => "node resource pressure".into(),
        _ if query.contains("5..") || query.contains("error") => "elevated error rate".into(),
        _ if query.contains("latency") || query.contains("duration") => "latency spike".into(),
        _ => format!("{metric} spike"),
    }
}

fn prometheus_instant(query: &str, payload: &Value) -> Rendered {
    let series = array_at(payload, &["data", "result"]);
    let values: Vec<String> = series
        .iter()
        .filter_map(|entry| entry.get("value").and_then(sample_value))
        .map(|v| format!("{v:.2}"))
        .collect();
    let summary = if values.is_empty() {
        format!("Prometheus `{query}` returned no samples")
    } else {
        format!("Prometheus `{query}` = {}", values.join(", "))
    };
    Rendered {
        summary,
        ..Rendered::default()
    }
}

fn splunk(query: &str, payload: &Value) -> Rendered {
    let results = array_at(payload, &["results"]);
    let errors: Vec<&str> = results
        .iter()
        .filter(|row| is_error_row(row))
        .filter_map(|row| str_at(row, &["message"]).or_else(|| str_at(row, &["_raw"])))
        .collect();

    let mut patterns: Vec<(String, usize)> = Vec::new();
    for message in &errors {
        let pattern = normalize_pattern(message);
        match patterns.iter_mut().find(|entry| entry.0 == pattern) {
            Some((_, count)) => *count += 1,
            None => patterns.push((pattern, 1)),
        }
    }
    patterns.sort_by(|a, b| b.1.cmp(&a.1));

    let mut findings = Vec::new();
    let summary = match patterns.first() {
        Some((pattern, count)) => {
            if errors.len() >= ERROR_BURST_MIN {
                findings.push(Finding {
                    kind: FindingKind::ErrorBurst,
                    subject: pattern.clone(),
                    label: "error-log burst".into(),
                    detail: format!("{} error log lines, most often \"{pattern}\"", errors.len()),
                    component: infer_component(pattern),
                    direct: true,
                });
            }
            format!(
                "Splunk `{query}`: {} lines, {} errors; top pattern \"{pattern}\" ({count}x)",
                results.len(),
                errors.len()
            )
        }
        None => format!("Splunk `{query}`: {} lines, no errors", results.len()),
    };

    Rendered {
        summary,
        findings,
        ..Rendered::default()
    }
}

fn is_error_row(row: &Value) -> bool {
    let level = str_at(row, &["level"])
        .or_else(|| str_at(row, &["log_level"]))
        .unwrap_or("")
        .to_lowercase();
    if matches!(level.as_str(), "error" | "fatal" | "critical") {
        return true;
    }
    let raw = str_at(row, &["_raw"]).unwrap_or("").to_lowercase();
    raw.contains("error") || raw.contains("exception")
}

/// Collapses numbers and ids so repeated messages group together.
fn normalize_pattern(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_digits = false;
    for c in message.trim().chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
        } else {
            in_digits = false;
            out.push(c.to_ascii_lowercase());
        }
    }
    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(80).collect()
}

fn grafana(operation: &ToolOperation, payload: &Value) -> Rendered {
    let title = str_at(payload, &["title"]).unwrap_or("panel");
    Rendered {
        summary: format!("Grafana \"{title}\" ({})", operation.describe()),
        link: str_at(payload, &["dashboard_url"]).map(str::to_string),
        media: str_at(payload, &["image_url"]).map(str::to_string),
        findings: Vec::new(),
    }
}

fn kubernetes_events(service: &str, scoped: bool, payload: &Value) -> Rendered {
    let items = array_at(payload, &["items"]);
    let mut findings: Vec<Finding> = Vec::new();
    let mut reasons: Vec<String> = Vec::new();

    for event in items
        .iter()
        .filter(|e| str_at(e, &["type"]) == Some("Warning"))
    {
        let reason = str_at(event, &["reason"]).unwrap_or("Warning");
        let kind = str_at(event, &["involvedObject", "kind"]).unwrap_or("Object");
        let name = str_at(event, &["involvedObject", "name"]).unwrap_or("unknown");
        let message = str_at(event, &["message"]).unwrap_or("");
        if !reasons.iter().any(|r| r == reason) {
            reasons.push(reason.to_string());
        }

        let subject = format!("{kind}/{name}");
        if findings.len() >= MAX_EVENT_FINDINGS
            || findings.iter().any(|f| f.subject == subject && f.label.starts_with(reason))
        {
            continue;
        }
        findings.push(Finding {
            kind: FindingKind::WarningEvent,
            subject,
            label: format!("{reason} events"),
            detail: format!("{reason} on {kind} {name}: {message}"),
            component: match kind {
                "Node" => Component::Node,
                "Pod" => Component::Pod,
                _ => Component::Service,
            },
            direct: scoped || name.starts_with(service),
        });
    }

    let warnings = items
        .iter()
        .filter(|e| str_at(e, &["type"]) == Some("Warning"))
        .count();
    let summary = if warnings == 0 {
        format!("Kubernetes: {} events, no warnings", items.len())
    } else {
        format!(
            "Kubernetes: {} events, {warnings} warnings ({})",
            items.len(),
            reasons.join(", ")
        )
    };
    Rendered {
        summary,
        findings,
        ..Rendered::default()
    }
}

fn kubernetes_pods(selector: &str, payload: &Value) -> Rendered {
    let items = array_at(payload, &["items"]);
    let mut findings = Vec::new();

    for pod in items {
        let name = str_at(pod, &["metadata", "name"]).unwrap_or("unknown");
        let phase = str_at(pod, &["status", "phase"]).unwrap_or("Unknown");
        let statuses = array_at(pod, &["status", "containerStatuses"]);
        let waiting = statuses
            .iter()
            .find_map(|s| str_at(s, &["state", "waiting", "reason"]));
        let restarts: i64 = statuses
            .iter()
            .filter_map(|s| s.get("restartCount").and_then(Value::as_i64))
            .sum();

        let problem = if let Some(reason) = waiting {
            Some((format!("{reason} pods"), format!("Pod {name} is waiting: {reason}")))
        } else if !matches!(phase, "Running" | "Succeeded") {
            Some(("pod instability".to_string(), format!("Pod {name} is {phase}")))
        } else if restarts >= RESTART_THRESHOLD {
            Some((
                "pod instability".to_string(),
                format!("Pod {name} restarted {restarts} times"),
            ))
        } else {
            None
        };

        if let Some((label, detail)) = problem {
            findings.push(Finding {
                kind: FindingKind::PodUnhealthy,
                subject: name.to_string(),
                label,
                detail,
                component: Component::Pod,
                direct: true,
            });
        }
    }

    let summary = if findings.is_empty() {
        format!("Kubernetes: all {} pods matching {selector} healthy", items.len())
    } else {
        let names: Vec<&str> = findings.iter().map(|f| f.subject.as_str()).collect();
        format!(
            "Kubernetes: {}/{} pods matching {selector} unhealthy ({})",
            findings.len(),
            items.len(),
            names.join(", ")
        )
    };
    Rendered {
        summary,
        findings,
        ..Rendered::default()
    }
}

fn kubernetes_nodes(scoped: bool, payload: &Value) -> Rendered {
    let items = array_at(payload, &["items"]);
    let mut findings = Vec::new();

    for node in items {
        let name = str_at(node, &["metadata", "name"]).unwrap_or("unknown");
        let ready = array_at(node, &["status", "conditions"])
            .iter()
            .find(|c| str_at(c, &["type"]) == Some("Ready"))
            .and_then(|c| str_at(c, &["status"]));
        if ready != Some("True") {
            findings.push(Finding {
                kind: FindingKind::NodeNotReady,
                subject: name.to_string(),
                label: "node failure".into(),
                detail: format!("Node {name} is NotReady"),
                component: Component::Node,
                direct: scoped,
            });
        }
    }

    let summary = if findings.is_empty() {
        format!("Kubernetes: all {} nodes Ready", items.len())
    } else {
        let names: Vec<&str> = findings.iter().map(|f| f.subject.as_str()).collect();
        format!(
            "Kubernetes: {} of {} nodes NotReady ({})",
            findings.len(),
            items.len(),
            names.join(", ")
        )
    };
    Rendered {
        summary,
        findings,
        ..Rendered::default()
    }
}

fn github_commits(repository: &str, since: &str, payload: &Value) -> Rendered {
    let commits = array_at(payload, &["commits"]);
    let Some(latest) = commits.first() else {
        return Rendered {
            summary: format!("GitHub: no commits on {repository} since {since}"),
            ..Rendered::default()
        };
    };

    let sha: String = str_at(latest, &["sha"]).unwrap_or("unknown").chars().take(7).collect();
    let message = str_at(latest, &["message"])
        .and_then(|m| m.lines().next())
        .unwrap_or("");
    let author = str_at(latest, &["author"]).unwrap_or("unknown");
    Rendered {
        summary: format!(
            "GitHub: {} commits on {repository} since {since}; latest {sha} \"{message}\" by {author}",
            commits.len()
        ),
        link: str_at(latest, &["html_url"]).map(str::to_string),
        media: None,
        findings: vec![Finding {
            kind: FindingKind::RecentChange,
            subject: sha.clone(),
            label: "recent code change".into(),
            detail: format!("Commit {sha} by {author}: {message}"),
            component: Component::CodeChange,
            direct: true,
        }],
    }
}

fn github_pulls(repository: &str, payload: &Value) -> Rendered {
    let pulls = array_at(payload, &["pulls"]);
    let merged = pulls
        .iter()
        .find(|p| p.get("merged_at").is_some_and(|m| !m.is_null()));
    let Some(pull) = merged else {
        return Rendered {
            summary: format!("GitHub: {} open pull requests on {repository}, none merged recently", pulls.len()),
            ..Rendered::default()
        };
    };

    let number = pull.get("number").and_then(Value::as_i64).unwrap_or_default();
    let title = str_at(pull, &["title"]).unwrap_or("");
    Rendered {
        summary: format!("GitHub: PR #{number} \"{title}\" merged on {repository}"),
        link: str_at(pull, &["html_url"]).map(str::to_string),
        media: None,
        findings: vec![Finding {
            kind: FindingKind::RecentChange,
            subject: format!("#{number}"),
            label: "recently merged change".into(),
            detail: format!("PR #{number} \"{title}\" was merged"),
            component: Component::CodeChange,
            direct: true,
        }],
    }
}

fn metric_name(query: &str) -> String {
    // Skip aggregation wrappers like `sum(rate(` to the first selector.
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != ':')
        .filter(|t| !t.is_empty())
        .find(|t| {
            !matches!(
                *t,
                "sum" | "rate" | "irate" | "increase" | "avg" | "max" | "min" | "by"
                    | "histogram_quantile" | "count"
            ) && t.parse::<f64>().is_err()
        })
        .unwrap_or("metric")
        .to_string()
}

fn sample_value(point: &Value) -> Option<f64> {
    let raw = point.as_array()?.get(1)?;
    match raw {
        Value::String(s) => s.parse().ok(),
        other => other.as_f64(),
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.is_empty() {
        0.0
    } else if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str()
}

fn array_at<'a>(value: &'a Value, path: &[&str]) -> &'a [Value] {
    let mut current = value;
    for key in path {
        match current.get(*key) {
            Some(next) => current = next,
            None => return &[],
        }
    }
    current.as_array().map(Vec::as_slice).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn not_ready_node_becomes_node_failure() {
        let op = ToolOperation::KubernetesNodes {
            pod_selector: Some("app=payments-api".into()),
        };
        let payload = json!({"items": [
            {"metadata": {"name": "ip-10-0-1-4"}, "status": {"conditions": [{"type": "Ready", "status": "True"}]}},
            {"metadata": {"name": "ip-10-0-1-5"}, "status": {"conditions": [{"type": "Ready", "status": "Unknown"}]}}
        ]});

        let rendered = render(&op, "payments-api", &payload);
        assert_eq!(rendered.findings.len(), 1);
        let finding = &rendered.findings[0];
        assert_eq!(finding.kind, FindingKind::NodeNotReady);
        assert_eq!(finding.detail, "Node ip-10-0-1-5 is NotReady");
        assert!(finding.direct);
        assert!(rendered.summary.contains("1 of 2 nodes NotReady"));
    }

    #[test]
    fn connection_spike_is_db_exhaustion() {
        let op = ToolOperation::PrometheusRange {
            query: "sum(db_connections_active{service=\"payments-api\"})".into(),
            start: "t0".into(),
            end: "t1".into(),
            step: "60s".into(),
        };
        let payload = json!({"data": {"result": [{"metric": {}, "values": [
            [1, "90"], [2, "92"], [3, "88"], [4, "150"], [5, "270"], [6, "280"]
        ]}]}});

        let rendered = render(&op, "payments-api", &payload);
        let finding = &rendered.findings[0];
        assert_eq!(finding.kind, FindingKind::MetricSpike);
        assert_eq!(finding.component, Component::Database);
        assert_eq!(finding.label, "DB connection exhaustion");
        assert_eq!(finding.subject, "db_connections_active");
        assert!(finding.direct);
    }

    #[test]
    fn flat_series_has_no_finding() {
        let op = ToolOperation::PrometheusRange {
            query: "up{job=\"payments-api\"}".into(),
            start: "t0".into(),
            end: "t1".into(),
            step: "60s".into(),
        };
        let payload = json!({"data": {"result": [{"values": [[1, "1"], [2, "1"], [3, "1"]]}]}});
        assert!(render(&op, "payments-api", &payload).findings.is_empty());
    }

    #[test]
    fn splunk_groups_error_patterns() {
        let op = ToolOperation::SplunkSearch {
            query: "index=prod service=payments-api".into(),
            earliest: "-60m".into(),
            latest: "now".into(),
        };
        let mut results: Vec<Value> = (0..6)
            .map(|i| json!({"level": "ERROR", "message": format!("connection refused to 10.0.3.{i}")}))
            .collect();
        results.push(json!({"level": "INFO", "message": "healthcheck ok"}));

        let rendered = render(&op, "payments-api", &json!({"results": results}));
        assert_eq!(rendered.findings.len(), 1);
        assert_eq!(rendered.findings[0].subject, "connection refused to #.#.#.#");
        assert!(rendered.summary.contains("7 lines, 6 errors"));
    }

    #[test]
    fn grafana_snapshot_carries_media_and_link_override() {
        let op = ToolOperation::GrafanaPanel {
            dashboard_uid: "payments-overview".into(),
            panel_id: 4,
        };
        let payload = json!({
            "title": "Payments API latency",
            "image_url": "https://grafana.example/render/4.png",
            "dashboard_url": "https://grafana.example/d/payments-overview",
            "link": "https://grafana.example/d/payments-overview?viewPanel=4"
        });
        let rendered = render(&op, "payments-api", &payload);
        assert_eq!(rendered.media.as_deref(), Some("https://grafana.example/render/4.png"));
        assert_eq!(
            rendered.link.as_deref(),
            Some("https://grafana.example/d/payments-overview?viewPanel=4")
        );
    }

    #[test]
    fn crashlooping_pod_is_unhealthy() {
        let op = ToolOperation::KubernetesPods {
            namespace: "payments".into(),
            label_selector: "app=payments-api".into(),
        };
        let payload = json!({"items": [{
            "metadata": {"name": "payments-api-7d9f"},
            "status": {"phase": "Running", "containerStatuses": [
                {"restartCount": 9, "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
            ]}
        }]});
        let rendered = render(&op, "payments-api", &payload);
        assert_eq!(rendered.findings[0].label, "CrashLoopBackOff pods");
    }
}
