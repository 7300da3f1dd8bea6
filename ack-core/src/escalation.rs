//! Hands the incident to humans: channel, invitations, summary, reassignment.
//!
//! Each attempt resumes where the previous one stopped, so a channel is never
//! created twice and people are not re-invited. When the primary cannot be
//! reached within the configured attempts, the fallback team gets the incident
//! and the incident is flagged degraded.

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::coordinator::TriageDeps;
use crate::error::{BridgeError, StoreError};
use crate::event_log::{Event, EventType};
use crate::executor;
use crate::model::{ChannelRef, Incident, IntegrationKind, RoleKind, ToolOutcome};
use crate::roles::{EscalationPlan, EscalationTarget};
use crate::tools::{ToolOperation, ToolRequest};

#[derive(Clone, Debug, PartialEq)]
pub struct EscalationOutcome {
    /// `None` when chat was unreachable and the fallback was paged instead.
    pub channel: Option<ChannelRef>,
    pub owner: EscalationTarget,
    pub degraded: bool,
    pub attempts: u32,
}

#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("reassign failed: {0}")]
    Reassign(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Default)]
struct Progress {
    channel: Option<ChannelRef>,
    invited: bool,
    posted: bool,
    reassigned: bool,
}

/// Returns `None` only when no human was reached at all: nothing could be
/// posted to chat and the fallback could not be paged either.
pub async fn escalate(
    deps: &TriageDeps,
    incident: &Incident,
    plan: &EscalationPlan,
) -> Result<Option<EscalationOutcome>, StoreError> {
    let incident_id = incident.incident_id.as_str();
    let max_attempts = deps.config.escalation_attempts.max(1);
    let mut progress = Progress::default();

    for attempt in 1..=max_attempts {
        deps.stores.events.append(
            &Event::new(
                incident_id,
                EventType::EscalationAttempt,
                format!("escalation attempt {attempt} to {}", plan.primary.display_name),
            )
            .with_details(serde_json::json!({
                "attempt": attempt,
                "team": plan.primary.team,
                "invitees": plan.invitees,
            })),
        )?;

        match attempt_primary(deps, incident, plan, &mut progress).await {
            Ok(channel) => {
                let owner = plan.primary.clone();
                deps.stores.incidents.set_owner(incident_id, &owner.team)?;
                info!(incident_id, team = %owner.team, attempt, "escalation complete");
                return Ok(Some(EscalationOutcome {
                    channel: Some(channel),
                    owner,
                    degraded: false,
                    attempts: attempt,
                }));
            }
            Err(StepError::Store(err)) => return Err(err),
            Err(err) => {
                warn!(incident_id, attempt, error = %err, "escalation attempt failed");
                if attempt < max_attempts {
                    tokio::time::sleep(deps.config.escalation_backoff() * attempt).await;
                }
            }
        }
    }

    degrade(deps, incident, plan, progress, max_attempts).await
}

async fn attempt_primary(
    deps: &TriageDeps,
    incident: &Incident,
    plan: &EscalationPlan,
    progress: &mut Progress,
) -> Result<ChannelRef, StepError> {
    let channel = open_channel(deps, incident, &plan.channel_name, progress).await?;
    if !progress.invited {
        deps.bridge.invite(&channel, &plan.invitees).await?;
        progress.invited = true;
    }
    if !progress.posted {
        deps.bridge.post_message(&channel, &plan.summary).await?;
        progress.posted = true;
    }
    if !progress.reassigned {
        reassign(deps, incident, &plan.primary).await?;
        progress.reassigned = true;
    }
    Ok(channel)
}

async fn degrade(
    deps: &TriageDeps,
    incident: &Incident,
    plan: &EscalationPlan,
    mut progress: Progress,
    attempts: u32,
) -> Result<Option<EscalationOutcome>, StoreError> {
    let incident_id = incident.incident_id.as_str();
    let fallback = &plan.fallback;
    deps.stores.incidents.set_degraded(incident_id)?;
    deps.stores.events.append(
        &Event::new(
            incident_id,
            EventType::EscalationDegraded,
            format!(
                "could not complete escalation to {}; falling back to {}",
                plan.primary.display_name, fallback.display_name
            ),
        )
        .with_details(serde_json::json!({
            "primary": plan.primary.team,
            "fallback": fallback.team,
            "channel_created": progress.channel.is_some(),
            "invited": progress.invited,
            "posted": progress.posted,
            "reassigned": progress.reassigned,
        })),
    )?;

    let channel = match open_channel(deps, incident, &plan.channel_name, &mut progress).await {
        Ok(channel) => Some(channel),
        Err(StepError::Store(err)) => return Err(err),
        Err(err) => {
            warn!(incident_id, error = %err, "no channel could be opened; paging fallback directly");
            None
        }
    };

    let mut posted = progress.posted;
    if let Some(channel) = &channel {
        let fallback_user = fallback.oncall.chat_user.clone();
        if !fallback_user.is_empty() && !(progress.invited && plan.invitees.contains(&fallback_user)) {
            if let Err(err) = deps.bridge.invite(channel, &[fallback_user]).await {
                warn!(incident_id, error = %err, "fallback invite failed");
            }
        }

        let note = format!(
            "> Escalation to {} did not complete; {} has been paged as fallback.",
            plan.primary.display_name, fallback.display_name
        );
        let markdown = if posted {
            note
        } else {
            format!("{note}\n\n{}", plan.summary)
        };
        match deps.bridge.post_message(channel, &markdown).await {
            Ok(_) => posted = true,
            Err(err) => warn!(incident_id, error = %err, "summary could not be posted"),
        }
    }

    // The primary never completed an attempt, so the page goes to the fallback.
    let paged = match reassign(deps, incident, fallback).await {
        Ok(paged) => paged,
        Err(StepError::Store(err)) => return Err(err),
        Err(err) => {
            warn!(incident_id, error = %err, "fallback reassign failed");
            false
        }
    };
    if !posted && !paged {
        warn!(incident_id, "neither chat nor paging reached a human");
        return Ok(None);
    }

    let owner = fallback.clone();
    deps.stores.incidents.set_owner(incident_id, &owner.team)?;
    warn!(incident_id, team = %owner.team, posted, paged, "escalation completed degraded");

    Ok(Some(EscalationOutcome {
        channel,
        owner,
        degraded: true,
        attempts,
    }))
}

async fn open_channel(
    deps: &TriageDeps,
    incident: &Incident,
    name: &str,
    progress: &mut Progress,
) -> Result<ChannelRef, StepError> {
    if let Some(channel) = &progress.channel {
        return Ok(channel.clone());
    }
    let channel = deps.bridge.create_channel(name).await?;
    deps.stores.incidents.set_channel(&incident.incident_id, &channel)?;
    progress.channel = Some(channel.clone());
    Ok(channel)
}

/// Points the originating PagerDuty incident at `target`. Skipped when
/// PagerDuty is not wired up or the target has no PagerDuty user; the
/// returned flag says whether anyone was actually paged.
async fn reassign(
    deps: &TriageDeps,
    incident: &Incident,
    target: &EscalationTarget,
) -> Result<bool, StepError> {
    if !deps.gateway.supports(IntegrationKind::PagerDuty) || target.oncall.pagerduty_user.is_empty() {
        return Ok(false);
    }
    let request = ToolRequest::new(
        RoleKind::Manager,
        ToolOperation::PagerdutyReassign {
            incident_id: incident.alert.incident_id.clone(),
            assignee: target.oncall.pagerduty_user.clone(),
        },
    );
    let ctx = deps.dispatch_context(incident, Instant::now() + deps.config.tool_timeout());
    let (outcome, _) = executor::run_tool_call(&ctx, &request).await?;
    match outcome {
        ToolOutcome::Success => Ok(true),
        ToolOutcome::Failure { message, .. } | ToolOutcome::Timeout { message } => {
            Err(StepError::Reassign(message))
        }
    }
}
