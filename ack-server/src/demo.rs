//! Stand-ins used when the server runs without real integrations: canned
//! payloads telling a bad-deploy story, and a chat bridge that only logs.

use ack_core::bridge::{ChannelBridge, ThreadMessage};
use ack_core::model::ChannelRef;
use ack_core::testing::ScriptedIntegration;
use ack_core::{BridgeError, IntegrationKind, ToolError, ToolGateway, ToolOperation};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const LATENCY: Duration = Duration::from_millis(150);

pub fn demo_gateway(retry_backoff: Duration) -> ToolGateway {
    let scripted = |kind: IntegrationKind, handler: fn(&ToolOperation) -> Result<Value, ToolError>| {
        Arc::new(ScriptedIntegration::new(kind, handler).with_latency(LATENCY))
    };
    ToolGateway::new(retry_backoff)
        .with(scripted(IntegrationKind::Kubernetes, kubernetes))
        .with(scripted(IntegrationKind::Prometheus, prometheus))
        .with(scripted(IntegrationKind::Splunk, splunk))
        .with(scripted(IntegrationKind::Github, github))
        .with(scripted(IntegrationKind::Grafana, grafana))
        .with(scripted(IntegrationKind::PagerDuty, pagerduty))
}

fn kubernetes(op: &ToolOperation) -> Result<Value, ToolError> {
    Ok(match op {
        ToolOperation::KubernetesPods { label_selector, .. } => {
            let app = label_selector.trim_start_matches("app=");
            json!({"items": [{
                "metadata": {"name": format!("{app}-5c8d-x7k2p")},
                "status": {"phase": "Running", "containerStatuses": [{
                    "restartCount": 7,
                    "state": {"waiting": {"reason": "CrashLoopBackOff"}}
                }]}
            }]})
        }
        ToolOperation::KubernetesNodes { .. } => json!({"items": [{
            "metadata": {"name": "ip-10-0-2-11"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }]}),
        _ => json!({"items": []}),
    })
}

fn prometheus(op: &ToolOperation) -> Result<Value, ToolError> {
    let points = |base: f64, peak: f64| -> Vec<Value> {
        (0..10)
            .map(|i| {
                let v = if i < 6 { base } else { peak };
                json!([1_760_600_000 + i * 60, v.to_string()])
            })
            .collect()
    };
    Ok(match op {
        ToolOperation::PrometheusRange { query, .. } if query.contains("5..") => {
            json!({"data": {"result": [{"metric": {}, "values": points(0.2, 14.0)}]}})
        }
        ToolOperation::PrometheusRange { .. } => {
            json!({"data": {"result": [{"metric": {}, "values": points(0.12, 0.13)}]}})
        }
        _ => json!({"data": {"result": [{"metric": {}, "value": [1_760_600_000, "1"]}]}}),
    })
}

fn splunk(_: &ToolOperation) -> Result<Value, ToolError> {
    let rows: Vec<Value> = (0..6)
        .map(|_| json!({"level": "ERROR", "message": "panic: missing config key PAYMENTS_LEDGER_URL"}))
        .collect();
    Ok(json!({ "results": rows }))
}

fn github(op: &ToolOperation) -> Result<Value, ToolError> {
    Ok(match op {
        ToolOperation::GithubPulls { repository } => json!({"pulls": [{
            "number": 482,
            "title": "Move ledger settings to env config",
            "merged_at": "2026-10-16T09:12:00Z",
            "html_url": format!("https://github.com/{repository}/pull/482")
        }]}),
        _ => json!({"commits": []}),
    })
}

fn grafana(op: &ToolOperation) -> Result<Value, ToolError> {
    let ToolOperation::GrafanaPanel { dashboard_uid, panel_id } = op else {
        return Err(ToolError::new(ack_core::ToolErrorKind::InvalidRequest, "not a panel request"));
    };
    Ok(json!({
        "title": "Request errors",
        "dashboard_url": format!("https://grafana.demo.local/d/{dashboard_uid}?viewPanel={panel_id}"),
        "image_url": format!("https://grafana.demo.local/render/d-solo/{dashboard_uid}?panelId={panel_id}")
    }))
}

fn pagerduty(op: &ToolOperation) -> Result<Value, ToolError> {
    Ok(match op {
        ToolOperation::PagerdutyIncident { incident_id } => json!({"incident": {
            "status": "triggered",
            "urgency": "high",
            "html_url": format!("https://demo.pagerduty.com/incidents/{incident_id}")
        }}),
        _ => json!({"status": "ok"}),
    })
}

/// Chat bridge that writes everything to the log. Threads are always empty,
/// so follow-ups arrive over HTTP instead.
#[derive(Default)]
pub struct LogBridge {
    next_id: AtomicU64,
}

impl LogBridge {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl ChannelBridge for LogBridge {
    async fn create_channel(&self, name: &str) -> Result<ChannelRef, BridgeError> {
        let channel = ChannelRef {
            id: self.next("C"),
            name: name.to_string(),
        };
        info!(channel = %channel.name, id = %channel.id, "channel created");
        Ok(channel)
    }

    async fn invite(&self, channel: &ChannelRef, users: &[String]) -> Result<(), BridgeError> {
        info!(channel = %channel.name, users = ?users, "users invited");
        Ok(())
    }

    async fn post_message(&self, channel: &ChannelRef, markdown: &str) -> Result<String, BridgeError> {
        info!(channel = %channel.name, "posted:\n{markdown}");
        Ok(self.next("M"))
    }

    async fn read_thread(
        &self,
        _channel: &ChannelRef,
        _after: Option<&str>,
    ) -> Result<Vec<ThreadMessage>, BridgeError> {
        Ok(Vec::new())
    }
}
