//! Dispatches tool requests as independent tasks.
//!
//! Each call runs in its own task that records intent, invokes the gateway,
//! persists any evidence and then the ToolCall record, and only then reports
//! completion. A caller that stops waiting (deadline) leaves the tasks running,
//! so late results are still persisted for audit.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::db::Stores;
use crate::error::{StoreError, ToolErrorKind};
use crate::event_log::{Event, EventType};
use crate::gateway::ToolGateway;
use crate::model::{EvidenceId, NewEvidence, ToolCallRecord, ToolOutcome};
use crate::render;
use crate::tools::ToolRequest;

#[derive(Clone)]
pub struct DispatchContext {
    pub incident_id: String,
    pub service: String,
    pub stores: Stores,
    pub gateway: ToolGateway,
    pub tool_timeout: std::time::Duration,
    /// Results finishing after this are flagged late.
    pub deadline: Instant,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub issued: usize,
    pub completed: usize,
    pub deadline_hit: bool,
}

impl DispatchReport {
    pub fn outstanding(&self) -> usize {
        self.issued - self.completed
    }
}

/// Issues every request concurrently and waits until all complete or the
/// deadline passes. A store failure inside any call is returned.
pub async fn dispatch_all(
    ctx: &DispatchContext,
    requests: Vec<ToolRequest>,
) -> Result<DispatchReport, StoreError> {
    let issued = requests.len();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    for request in requests {
        spawn_tool_call(ctx.clone(), request, done_tx.clone());
    }
    drop(done_tx);

    let mut report = DispatchReport {
        issued,
        ..DispatchReport::default()
    };
    while report.completed < issued {
        let next = tokio::time::timeout_at(ctx.deadline, done_rx.recv()).await;
        match next {
            Ok(Some(Ok(()))) => report.completed += 1,
            Ok(Some(Err(err))) => return Err(err),
            Ok(None) => break,
            Err(_) => {
                report.deadline_hit = true;
                warn!(
                    incident_id = %ctx.incident_id,
                    outstanding = report.outstanding(),
                    "response deadline reached with tool calls in flight"
                );
                break;
            }
        }
    }
    Ok(report)
}

/// Runs one tool call to completion in a detached task.
pub fn spawn_tool_call(
    ctx: DispatchContext,
    request: ToolRequest,
    done: mpsc::UnboundedSender<Result<(), StoreError>>,
) {
    tokio::spawn(async move {
        let result = run_tool_call(&ctx, &request).await;
        if let Err(err) = &result {
            error!(incident_id = %ctx.incident_id, error = %err, "tool call could not be persisted");
        }
        let _ = done.send(result.map(|_| ()));
    });
}

/// Invokes, persists and logs one call. Tool failures are part of the
/// returned outcome; only store failures are errors.
pub async fn run_tool_call(
    ctx: &DispatchContext,
    request: &ToolRequest,
) -> Result<(ToolOutcome, Option<EvidenceId>), StoreError> {
    let operation = &request.operation;
    let integration = operation.integration();

    ctx.stores.events.append(
        &Event::new(
            &ctx.incident_id,
            EventType::ToolCallIssued,
            format!("intent: {}", operation.describe()),
        )
        .with_details(serde_json::json!({
            "operation": operation,
            "role": request.role.as_str(),
            "status": "running",
        })),
    )?;

    let started_at = Utc::now();
    let invocation = ctx.gateway.invoke(operation, ctx.tool_timeout).await;
    let finished_at = Utc::now();
    let late = Instant::now() > ctx.deadline;

    let (outcome, evidence_id) = match invocation.result {
        Ok(payload) if operation.is_read_only() => {
            let rendered = render::render(operation, &ctx.service, &payload);
            let item = ctx.stores.evidence.insert(&NewEvidence {
                incident_id: ctx.incident_id.clone(),
                source: integration,
                query: operation.describe(),
                payload,
                summary: rendered.summary,
                link: rendered.link,
                media: rendered.media,
                findings: rendered.findings,
                late,
            })?;
            (ToolOutcome::Success, Some(item.id))
        }
        Ok(_) => (ToolOutcome::Success, None),
        Err(err) if err.kind == ToolErrorKind::Timeout => (
            ToolOutcome::Timeout {
                message: err.message,
            },
            None,
        ),
        Err(err) => (
            ToolOutcome::Failure {
                kind: err.kind,
                message: err.message,
            },
            None,
        ),
    };

    let status = match &outcome {
        ToolOutcome::Success => "done",
        ToolOutcome::Failure { .. } => "failed",
        ToolOutcome::Timeout { .. } => "timeout",
    };
    ctx.stores.incidents.record_tool_call(&ToolCallRecord {
        id: 0,
        incident_id: ctx.incident_id.clone(),
        integration,
        operation: operation.clone(),
        fingerprint: operation.fingerprint(),
        role: request.role,
        started_at,
        finished_at,
        outcome: outcome.clone(),
        attempts: invocation.attempts,
        evidence_id,
    })?;

    ctx.stores.events.append(
        &Event::new(
            &ctx.incident_id,
            EventType::ToolCallFinished,
            format!("{status}: {}", operation.describe()),
        )
        .with_details(serde_json::json!({
            "operation": operation.name(),
            "status": status,
            "outcome": outcome,
            "attempts": invocation.attempts,
            "evidence_id": evidence_id,
            "late": late,
        })),
    )?;

    info!(
        incident_id = %ctx.incident_id,
        operation = operation.name(),
        status,
        late,
        "tool call finished"
    );
    Ok((outcome, evidence_id))
}
