//! Thread follow-ups after hand-off.
//!
//! Answers are read-mostly queries over the evidence already on file. Only an
//! explicit request for fresh data, while the incident is still awaiting a
//! human, re-runs evidence queries; the incident status never changes here.

use chrono::Utc;
use std::fmt::Write;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::bridge::ThreadMessage;
use crate::coordinator::TriageDeps;
use crate::error::StoreError;
use crate::event_log::{Event, EventType};
use crate::executor;
use crate::model::IncidentStatus;
use crate::roles::{Artifact, Role, RoleContext, RoleOutput, ThreadAnswer};
use crate::summary;

pub async fn answer(
    deps: &TriageDeps,
    incident_id: &str,
    question: &str,
) -> Result<ThreadAnswer, StoreError> {
    deps.stores.events.append(
        &Event::new(incident_id, EventType::ThreadMessage, question)
            .with_details(serde_json::json!({ "question": question })),
    )?;
    reply(deps, incident_id, question).await
}

/// Same as [`answer`] for a message read from the channel thread. The
/// message id is kept so a resumed coordinator does not answer it twice.
pub async fn answer_thread_message(
    deps: &TriageDeps,
    incident_id: &str,
    message: &ThreadMessage,
) -> Result<ThreadAnswer, StoreError> {
    deps.stores.events.append(
        &Event::new(incident_id, EventType::ThreadMessage, message.text.as_str()).with_details(
            serde_json::json!({
                "question": message.text,
                "message_id": message.id,
                "author": message.author,
            }),
        ),
    )?;
    reply(deps, incident_id, &message.text).await
}

async fn reply(
    deps: &TriageDeps,
    incident_id: &str,
    question: &str,
) -> Result<ThreadAnswer, StoreError> {
    let ctx = question_context(deps, incident_id, question)?;
    let mut reply = ask(deps, &ctx, question).await;

    if reply.wants_fresh_data {
        if ctx.incident.status == IncidentStatus::AwaitingHuman {
            let before = ctx.evidence.iter().map(|item| item.id).max().unwrap_or(0);
            refresh(deps, &ctx).await?;

            let ctx = question_context(deps, incident_id, question)?;
            reply = ask(deps, &ctx, question).await;
            let fresh: Vec<_> = ctx.evidence.iter().filter(|item| item.id > before).collect();
            if fresh.is_empty() {
                reply.markdown.push_str("\nRe-ran the evidence queries; nothing new came back.");
            } else {
                reply.markdown.push_str("\nFresh evidence:\n");
                for item in fresh {
                    let _ = writeln!(
                        reply.markdown,
                        "- [#{} {}]({}) {}",
                        item.id,
                        item.source.as_str(),
                        summary::evidence_link(item, &deps.config.public_url),
                        item.summary
                    );
                    reply.cited.push(item.id);
                }
            }
        } else {
            reply.markdown.push_str(&format!(
                "\nFresh data is only gathered while the incident awaits a human (status: {}).",
                ctx.incident.status.as_str()
            ));
        }
    }

    if let Some(channel) = &ctx.incident.channel {
        if let Err(err) = deps.bridge.post_message(channel, &reply.markdown).await {
            warn!(incident_id, error = %err, "thread reply could not be posted");
        }
    }
    deps.stores.events.append(
        &Event::new(incident_id, EventType::ThreadReply, "follow-up answered").with_details(
            serde_json::json!({
                "cited": reply.cited,
                "fresh_data": reply.wants_fresh_data,
            }),
        ),
    )?;
    info!(incident_id, cited = reply.cited.len(), "follow-up answered");
    Ok(reply)
}

fn question_context(
    deps: &TriageDeps,
    incident_id: &str,
    question: &str,
) -> Result<RoleContext, StoreError> {
    let mut ctx = RoleContext::load(&deps.stores, incident_id, deps.budget())?;
    ctx.question = Some(question.to_string());
    Ok(ctx)
}

async fn ask(deps: &TriageDeps, ctx: &RoleContext, question: &str) -> ThreadAnswer {
    let manager = deps.manager();
    match manager.act(ctx).await {
        RoleOutput::Artifact(Artifact::Answer(answer)) => answer,
        _ => manager.answer(ctx, question),
    }
}

/// One bounded Investigator pass over a window ending now. Identical queries
/// are allowed since their results may have changed.
async fn refresh(deps: &TriageDeps, ctx: &RoleContext) -> Result<(), StoreError> {
    let mut pass = ctx.clone();
    pass.window_end = Utc::now();
    pass.refresh = true;
    pass.turn = 0;
    pass.spent_tool_calls = 0;

    let RoleOutput::Dispatch(requests) = deps.investigator().act(&pass).await else {
        return Ok(());
    };
    let deadline = Instant::now() + deps.config.response_budget();
    let report = executor::dispatch_all(&deps.dispatch_context(&ctx.incident, deadline), requests).await?;
    info!(
        incident_id = %ctx.incident.incident_id,
        issued = report.issued,
        completed = report.completed,
        "fresh evidence gathered"
    );
    Ok(())
}
