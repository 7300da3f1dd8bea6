//! Inbound alert parsing.
//!
//! Each webhook flavour has an adapter that maps its payload onto a
//! [`CanonicalAlert`]. Nothing here touches the stores: a payload that fails
//! to parse or validate never becomes an incident.

use ack_core::Coordinator;
use alert_registry::{validate_alert, AlertError, CanonicalAlert, ALERT_SCHEMA_V1};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::routes::request_close;
use crate::state::{ApiError, AppState};

/// What an inbound webhook asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookEvent {
    Trigger(CanonicalAlert),
    /// The alert was resolved at the source.
    Resolve { incident_id: String },
    /// Valid but irrelevant (acknowledged, annotated, ...).
    Ignored(String),
}

pub trait AlertAdapter: Send + Sync + 'static {
    fn parse(&self, payload: &Value) -> Result<WebhookEvent, AlertError>;
}

/// PagerDuty v3 webhooks: `{"event": {"event_type", "occurred_at", "data": {...}}}`.
pub struct PagerDutyV3Adapter;

/// Legacy PagerDuty v2 webhooks: `{"messages": [{"event", "incident": {...}}]}`.
pub struct PagerDutyLegacyAdapter;

/// Flat JSON from scripts and other alerting tools.
pub struct GenericAdapter;

impl AlertAdapter for PagerDutyV3Adapter {
    fn parse(&self, payload: &Value) -> Result<WebhookEvent, AlertError> {
        let event = payload
            .get("event")
            .ok_or_else(|| AlertError::Malformed("missing event".into()))?;
        let event_type = str_at(event, &["event_type"]).unwrap_or_default();
        let data = event
            .get("data")
            .ok_or_else(|| AlertError::Malformed("missing event.data".into()))?;
        let incident_id = str_at(data, &["id"]).unwrap_or_default().to_string();

        match event_type {
            "incident.triggered" => {}
            "incident.resolved" => return resolve(incident_id),
            other => return Ok(WebhookEvent::Ignored(format!("event type {other}"))),
        }

        let severity = str_at(data, &["priority", "summary"])
            .or_else(|| str_at(data, &["urgency"]))
            .unwrap_or_default();
        trigger(CanonicalAlert {
            schema: ALERT_SCHEMA_V1.into(),
            incident_id,
            service: str_at(data, &["service", "summary"]).unwrap_or_default().to_string(),
            severity: severity.to_string(),
            title: str_at(data, &["title"]).unwrap_or_default().to_string(),
            description: str_at(data, &["body", "details"]).unwrap_or_default().to_string(),
            triggered_at: str_at(event, &["occurred_at"])
                .map(str::to_string)
                .unwrap_or_else(now),
            html_url: str_at(data, &["html_url"]).map(str::to_string),
            source: "pagerduty".into(),
        })
    }
}

impl AlertAdapter for PagerDutyLegacyAdapter {
    fn parse(&self, payload: &Value) -> Result<WebhookEvent, AlertError> {
        let message = payload
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|m| m.first())
            .ok_or_else(|| AlertError::Malformed("payload missing messages[0]".into()))?;
        let incident = message
            .get("incident")
            .ok_or_else(|| AlertError::Malformed("message missing incident".into()))?;
        let incident_id = str_at(incident, &["id"]).unwrap_or_default().to_string();

        match str_at(message, &["event"]).unwrap_or_default() {
            "incident.trigger" => {}
            "incident.resolve" => return resolve(incident_id),
            other => return Ok(WebhookEvent::Ignored(format!("event {other}"))),
        }

        let title = str_at(incident, &["title"])
            .or_else(|| str_at(incident, &["trigger_summary_data", "subject"]))
            .unwrap_or_default();
        trigger(CanonicalAlert {
            schema: ALERT_SCHEMA_V1.into(),
            incident_id,
            service: str_at(incident, &["service", "name"])
                .or_else(|| str_at(incident, &["service", "summary"]))
                .unwrap_or_default()
                .to_string(),
            severity: str_at(incident, &["urgency"]).unwrap_or("high").to_string(),
            title: title.to_string(),
            description: String::new(),
            triggered_at: str_at(incident, &["created_on"])
                .map(str::to_string)
                .unwrap_or_else(now),
            html_url: str_at(incident, &["html_url"]).map(str::to_string),
            source: "pagerduty".into(),
        })
    }
}

impl AlertAdapter for GenericAdapter {
    fn parse(&self, payload: &Value) -> Result<WebhookEvent, AlertError> {
        if !payload.is_object() {
            return Err(AlertError::Malformed("expected a JSON object".into()));
        }
        let incident_id = str_at(payload, &["incident_id"])
            .or_else(|| str_at(payload, &["id"]))
            .unwrap_or_default()
            .to_string();
        if str_at(payload, &["status"]) == Some("resolved") {
            return resolve(incident_id);
        }

        trigger(CanonicalAlert {
            schema: ALERT_SCHEMA_V1.into(),
            incident_id,
            service: str_at(payload, &["service"]).unwrap_or_default().to_string(),
            severity: str_at(payload, &["severity"]).unwrap_or("high").to_string(),
            title: str_at(payload, &["title"])
                .or_else(|| str_at(payload, &["alert_title"]))
                .unwrap_or_default()
                .to_string(),
            description: str_at(payload, &["description"]).unwrap_or_default().to_string(),
            triggered_at: str_at(payload, &["triggered_at"])
                .map(str::to_string)
                .unwrap_or_else(now),
            html_url: str_at(payload, &["html_url"]).map(str::to_string),
            source: str_at(payload, &["source"]).unwrap_or("generic").to_string(),
        })
    }
}

pub fn webhook_router() -> Router<AppState> {
    Router::new()
        .route("/webhook/pagerduty", post(handle_pagerduty))
        .route("/webhook/generic", post(handle_generic))
}

async fn handle_pagerduty(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event = if payload.get("messages").is_some() {
        PagerDutyLegacyAdapter.parse(&payload)
    } else {
        PagerDutyV3Adapter.parse(&payload)
    };
    accept(&state, event)
}

async fn handle_generic(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    accept(&state, GenericAdapter.parse(&payload))
}

/// Invalid payloads are answered with 400 and leave no trace in the stores.
fn accept(
    state: &AppState,
    event: Result<WebhookEvent, AlertError>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event = event.map_err(|err| {
        warn!(error = %err, "webhook rejected");
        ApiError::BadRequest(err.to_string())
    })?;
    match event {
        WebhookEvent::Trigger(alert) => {
            let incident_id = alert.incident_id.clone();
            // The coordinator owns the incident from here; its handle is not needed.
            let _ = Coordinator::start(state.deps.clone(), alert)?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "incident_id": incident_id, "status": "received" })),
            ))
        }
        WebhookEvent::Resolve { incident_id } => {
            request_close(&state.deps, &incident_id, "resolved at the alert source")?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "incident_id": incident_id, "status": "close_requested" })),
            ))
        }
        WebhookEvent::Ignored(reason) => {
            info!(%reason, "webhook ignored");
            Ok((StatusCode::OK, Json(json!({ "status": "ignored", "reason": reason }))))
        }
    }
}

fn trigger(alert: CanonicalAlert) -> Result<WebhookEvent, AlertError> {
    validate_alert(&alert)?;
    Ok(WebhookEvent::Trigger(alert))
}

fn resolve(incident_id: String) -> Result<WebhookEvent, AlertError> {
    if incident_id.trim().is_empty() {
        return Err(AlertError::Missing("incident id"));
    }
    Ok(WebhookEvent::Resolve { incident_id })
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str().filter(|s| !s.trim().is_empty())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v3(event_type: &str) -> Value {
        json!({"event": {
            "id": "01DEN2",
            "event_type": event_type,
            "resource_type": "incident",
            "occurred_at": "2026-10-16T09:30:00.169Z",
            "data": {
                "id": "Q1W2E3",
                "type": "incident",
                "title": "High error rate on payments-api",
                "html_url": "https://acme.pagerduty.com/incidents/Q1W2E3",
                "urgency": "high",
                "priority": {"summary": "P1"},
                "service": {"id": "PF9KMXH", "summary": "payments-api"}
            }
        }})
    }

    #[test]
    fn v3_trigger_becomes_canonical_alert() {
        let WebhookEvent::Trigger(alert) = PagerDutyV3Adapter.parse(&v3("incident.triggered")).expect("parse")
        else {
            panic!("expected trigger");
        };
        assert_eq!(alert.incident_id, "Q1W2E3");
        assert_eq!(alert.service, "payments-api");
        assert_eq!(alert.severity, "P1");
        assert_eq!(alert.html_url.as_deref(), Some("https://acme.pagerduty.com/incidents/Q1W2E3"));
    }

    #[test]
    fn v3_resolve_and_other_events() {
        assert_eq!(
            PagerDutyV3Adapter.parse(&v3("incident.resolved")).expect("parse"),
            WebhookEvent::Resolve {
                incident_id: "Q1W2E3".into()
            }
        );
        assert!(matches!(
            PagerDutyV3Adapter.parse(&v3("incident.acknowledged")),
            Ok(WebhookEvent::Ignored(_))
        ));
    }

    #[test]
    fn v3_without_service_is_rejected() {
        let mut payload = v3("incident.triggered");
        payload["event"]["data"]["service"] = json!(null);
        assert_eq!(
            PagerDutyV3Adapter.parse(&payload),
            Err(AlertError::Missing("service"))
        );
    }

    #[test]
    fn legacy_messages_are_supported() {
        let payload = json!({"messages": [{
            "event": "incident.trigger",
            "incident": {
                "id": "PIJ90N7",
                "urgency": "high",
                "created_on": "2026-10-16T09:30:00Z",
                "html_url": "https://acme.pagerduty.com/incidents/PIJ90N7",
                "service": {"name": "ledger-worker"},
                "trigger_summary_data": {"subject": "ledger backlog growing"}
            }
        }]});
        let WebhookEvent::Trigger(alert) = PagerDutyLegacyAdapter.parse(&payload).expect("parse") else {
            panic!("expected trigger");
        };
        assert_eq!(alert.title, "ledger backlog growing");
        assert_eq!(alert.service, "ledger-worker");
    }

    #[test]
    fn generic_payload_defaults_trigger_time() {
        let payload = json!({
            "id": "GEN-1",
            "service": "payments-api",
            "severity": "critical",
            "title": "latency SLO burn"
        });
        let WebhookEvent::Trigger(alert) = GenericAdapter.parse(&payload).expect("parse") else {
            panic!("expected trigger");
        };
        assert_eq!(alert.source, "generic");
        assert!(chrono::DateTime::parse_from_rfc3339(&alert.triggered_at).is_ok());
    }

    #[test]
    fn generic_rejects_non_objects_and_bad_severity() {
        assert!(GenericAdapter.parse(&json!([1, 2])).is_err());
        let payload = json!({"id": "GEN-2", "service": "x", "severity": "meh", "title": "t"});
        assert!(matches!(
            GenericAdapter.parse(&payload),
            Err(AlertError::InvalidSeverity(_))
        ));
    }
}
