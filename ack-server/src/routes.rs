//! Read-only incident views plus the two human-facing writes: thread
//! questions and resolution requests.

use ack_core::event_log::{Event, EventType};
use ack_core::model::{
    CandidateOwner, Diagnosis, EvidenceItem, Incident, PastIncident, ToolCallRecord,
};
use ack_core::roles::ThreadAnswer;
use ack_core::{followup, IncidentStatus, TriageDeps};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::state::{ApiError, AppState};

const SEEN_BEFORE_LIMIT: usize = 5;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id", get(incident_snapshot))
        .route("/incidents/:id/evidence/:evidence_id", get(evidence_item))
        .route("/incidents/:id/thread", post(ask_thread))
        .route("/incidents/:id/resolve", post(resolve))
}

#[derive(Debug, Serialize)]
pub struct IncidentSnapshot {
    pub incident: Incident,
    pub diagnosis: Option<Diagnosis>,
    /// Superseded diagnoses, oldest first.
    pub diagnosis_history: Vec<Diagnosis>,
    pub candidates: Vec<CandidateOwner>,
    pub evidence: Vec<EvidenceItem>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub timeline: Vec<Event>,
    /// Earlier incidents on the same service, newest first.
    pub seen_before: Vec<PastIncident>,
}

#[derive(Debug, Deserialize)]
pub struct ThreadQuestion {
    pub question: String,
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_incidents(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let incidents = &state.deps.stores.incidents;
    Ok(Json(json!({
        "open": incidents.open_incidents()?,
        "failed": incidents.failed_incidents()?,
    })))
}

async fn incident_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IncidentSnapshot>, ApiError> {
    let stores = &state.deps.stores;
    let incident = find(&state.deps, &id)?;
    Ok(Json(IncidentSnapshot {
        diagnosis: stores.incidents.current_diagnosis(&id)?,
        diagnosis_history: stores.incidents.diagnosis_history(&id)?,
        candidates: stores.incidents.candidates(&id)?,
        evidence: stores.evidence.for_incident(&id)?,
        tool_calls: stores.incidents.tool_calls(&id)?,
        timeline: stores.events.events_for_incident(&id)?,
        seen_before: stores
            .incidents
            .past_diagnoses(&incident.service, &id, SEEN_BEFORE_LIMIT)?,
        incident,
    }))
}

async fn evidence_item(
    State(state): State<AppState>,
    Path((id, evidence_id)): Path<(String, i64)>,
) -> Result<Json<EvidenceItem>, ApiError> {
    state
        .deps
        .stores
        .evidence
        .get(&id, evidence_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{id}/evidence/{evidence_id}")))
}

/// Follow-ups are answered once a human has the incident, and after close.
async fn ask_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ThreadQuestion>,
) -> Result<Json<ThreadAnswer>, ApiError> {
    let question = body.question.trim();
    if question.is_empty() {
        return Err(ApiError::BadRequest("question is empty".into()));
    }
    let incident = find(&state.deps, &id)?;
    if !matches!(
        incident.status,
        IncidentStatus::AwaitingHuman | IncidentStatus::Closed
    ) {
        return Err(ApiError::Conflict(format!(
            "incident '{id}' is {}; follow-ups open once a human has it",
            incident.status.as_str()
        )));
    }
    Ok(Json(followup::answer(&state.deps, &id, question).await?))
}

async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    request_close(&state.deps, &id, "resolved by a human")?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "incident_id": id, "status": "close_requested" })),
    ))
}

/// Records a close request; the incident's coordinator closes it once it is
/// awaiting a human.
pub(crate) fn request_close(deps: &TriageDeps, id: &str, note: &str) -> Result<(), ApiError> {
    let incident = find(deps, id)?;
    if incident.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "incident '{id}' is already {}",
            incident.status.as_str()
        )));
    }
    deps.stores
        .events
        .append(&Event::new(id, EventType::CloseRequested, note))?;
    info!(incident_id = id, note, "close requested");
    Ok(())
}

fn find(deps: &TriageDeps, id: &str) -> Result<Incident, ApiError> {
    deps.stores
        .incidents
        .get(id)?
        .ok_or_else(|| ApiError::NotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use ack_core::testing::RecordingBridge;
    use ack_core::{CoordinatorConfig, ServiceCatalog, Stores, ToolGateway};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn db_path(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("/tmp/ack-tests/server-{name}-{nanos}.db")
    }

    fn app(name: &str) -> (Router, AppState, RecordingBridge) {
        let bridge = RecordingBridge::new();
        let config = CoordinatorConfig {
            thread_poll_ms: 100,
            ..CoordinatorConfig::default()
        };
        let (operator_tx, _operator_rx) = mpsc::unbounded_channel();
        let deps = TriageDeps {
            stores: Stores::open(&db_path(name)).expect("stores"),
            gateway: ToolGateway::new(config.retry_backoff()),
            bridge: Arc::new(bridge.clone()),
            catalog: Arc::new(ServiceCatalog::demo()),
            config: Arc::new(config),
            llm: None,
            operator_tx,
        };
        let state = AppState::new(deps);
        (router(state.clone()), state, bridge)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn alert(id: &str) -> Value {
        json!({
            "id": id,
            "service": "payments-api",
            "severity": "critical",
            "title": "High error rate on payments-api",
            "triggered_at": "2026-10-16T09:30:00Z"
        })
    }

    async fn wait_for(state: &AppState, id: &str, status: IncidentStatus) {
        for _ in 0..600 {
            let current = state.deps.stores.incidents.get(id).expect("get").map(|i| i.status);
            if current == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("incident {id} never reached {}", status.as_str());
    }

    #[tokio::test]
    async fn healthz_answers() {
        let (app, _, _) = app("healthz");
        let response = app.oneshot(get("/healthz")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn invalid_alert_is_rejected_without_an_incident() {
        let (app, state, _) = app("invalid");
        let mut payload = alert("BAD-1");
        payload["service"] = json!("");
        let response = app
            .oneshot(post_json("/webhook/generic", payload))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.deps.stores.incidents.get("BAD-1").expect("get").is_none());
        assert!(state
            .deps
            .stores
            .events
            .events_for_incident("BAD-1")
            .expect("events")
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_alert_conflicts() {
        let (app, _, _) = app("duplicate");
        let first = app
            .clone()
            .oneshot(post_json("/webhook/generic", alert("DUP-1")))
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(first).await["incident_id"], "DUP-1");

        let second = app
            .oneshot(post_json("/webhook/generic", alert("DUP-1")))
            .await
            .expect("response");
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_incidents_are_not_found() {
        let (app, _, _) = app("missing");
        for uri in ["/incidents/NOPE", "/incidents/NOPE/evidence/1"] {
            let response = app.clone().oneshot(get(uri)).await.expect("response");
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        let response = app
            .oneshot(post_json("/incidents/NOPE/resolve", json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn handed_off_incident_answers_questions_and_closes() {
        let (app, state, bridge) = app("handoff");
        let response = app
            .clone()
            .oneshot(post_json("/webhook/generic", alert("HO-1")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        wait_for(&state, "HO-1", IncidentStatus::AwaitingHuman).await;
        assert_eq!(bridge.invited_users(), vec!["U04SRE".to_string()]);

        let snapshot = body_json(app.clone().oneshot(get("/incidents/HO-1")).await.expect("snapshot")).await;
        assert_eq!(snapshot["incident"]["status"], "awaiting_human");
        assert_eq!(snapshot["incident"]["owner"], "sre");
        assert_eq!(snapshot["diagnosis"]["low_confidence"], true);
        assert!(snapshot["timeline"].as_array().is_some_and(|t| !t.is_empty()));

        let response = app
            .clone()
            .oneshot(post_json(
                "/incidents/HO-1/thread",
                json!({ "question": "what changed recently?" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let answer = body_json(response).await;
        assert!(answer["markdown"]
            .as_str()
            .is_some_and(|m| m.contains("Current hypothesis")));

        let response = app
            .clone()
            .oneshot(post_json("/incidents/HO-1/resolve", json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        wait_for(&state, "HO-1", IncidentStatus::Closed).await;

        let response = app
            .oneshot(post_json("/incidents/HO-1/resolve", json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test(start_paused = true)]
    async fn questions_before_hand_off_conflict() {
        let (app, state, bridge) = app("early-question");
        bridge.fail_creates(1000);
        app.clone()
            .oneshot(post_json("/webhook/generic", alert("EQ-1")))
            .await
            .expect("response");
        wait_for(&state, "EQ-1", IncidentStatus::Failed).await;

        let response = app
            .oneshot(post_json("/incidents/EQ-1/thread", json!({ "question": "status?" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test(start_paused = true)]
    async fn pagerduty_resolve_requests_close() {
        let (app, state, _) = app("pd-resolve");
        app.clone()
            .oneshot(post_json("/webhook/generic", alert("PD-9")))
            .await
            .expect("response");
        wait_for(&state, "PD-9", IncidentStatus::AwaitingHuman).await;

        let payload = json!({"event": {
            "event_type": "incident.resolved",
            "data": { "id": "PD-9" }
        }});
        let response = app
            .oneshot(post_json("/webhook/pagerduty", payload))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        wait_for(&state, "PD-9", IncidentStatus::Closed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_fails_triage_and_resumes_hand_offs() {
        let (app, state, bridge) = app("orphans");
        let stores = &state.deps.stores;
        let mut incident = ack_core::model::Incident {
            incident_id: "OR-1".into(),
            alert: alert_registry::CanonicalAlert {
                schema: alert_registry::ALERT_SCHEMA_V1.into(),
                incident_id: "OR-1".into(),
                service: "payments-api".into(),
                severity: "high".into(),
                title: "t".into(),
                description: String::new(),
                triggered_at: "2026-10-16T09:30:00Z".into(),
                html_url: None,
                source: "generic".into(),
            },
            service: "payments-api".into(),
            severity: None,
            status: IncidentStatus::Investigating,
            created_at: chrono::Utc::now(),
            deadline_at: chrono::Utc::now(),
            owner: None,
            channel: None,
            degraded: false,
            failure_reason: None,
        };
        stores.incidents.create(&incident).expect("create");
        incident.incident_id = "OR-2".into();
        incident.alert.incident_id = "OR-2".into();
        incident.status = IncidentStatus::AwaitingHuman;
        incident.owner = Some("sre".into());
        incident.channel = Some(ack_core::model::ChannelRef {
            id: "C-OR-2".into(),
            name: "inc-or-2-payments-api".into(),
        });
        stores.incidents.create(&incident).expect("create");

        let settled = crate::state::settle_orphans(&state.deps).expect("settle");
        assert_eq!(settled, crate::state::Settlement { failed: 1, resumed: 1 });
        let status = |id: &str| stores.incidents.require(id).expect("incident").status;
        assert_eq!(status("OR-1"), IncidentStatus::Failed);
        assert_eq!(status("OR-2"), IncidentStatus::AwaitingHuman);

        // The resumed coordinator still answers the channel thread.
        bridge.push_thread_message("C-OR-2", "U04SRE", "is anyone still on this?");
        for _ in 0..100 {
            if !bridge.posts().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let posts = bridge.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "C-OR-2");
        assert_eq!(status("OR-2"), IncidentStatus::AwaitingHuman);

        let response = app
            .oneshot(post_json("/incidents/OR-2/resolve", json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        wait_for(&state, "OR-2", IncidentStatus::Closed).await;
    }
}
