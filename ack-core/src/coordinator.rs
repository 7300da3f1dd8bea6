//! One incident's lifecycle, from webhook receipt to hand-off and closure.
//!
//! A coordinator is a spawned task owning exactly one incident. It sequences
//! the roles, persists what they return, enforces the response deadline and
//! is the only writer of the incident's status.

use alert_registry::CanonicalAlert;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bridge::ChannelBridge;
use crate::catalog::ServiceCatalog;
use crate::config::CoordinatorConfig;
use crate::db::Stores;
use crate::error::{LaunchError, StoreError};
use crate::escalation::{self, EscalationOutcome};
use crate::event_log::{Event, EventType};
use crate::executor::{self, DispatchContext};
use crate::followup;
use crate::gateway::ToolGateway;
use crate::llm::LlmConfig;
use crate::model::{ChannelRef, Incident, IncidentStatus, IntegrationKind, RoleKind, Severity};
use crate::roles::{
    analyst, ActionBudget, Analyst, Artifact, Investigator, Manager, Responder, Role, RoleContext,
    RoleOutput,
};
use crate::tools::{ToolOperation, ToolRequest};

/// Raised when an incident ends in `Failed` or nobody could be reached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub incident_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Everything a coordinator needs, shared across incidents. Nothing in here
/// holds per-incident state; that lives in the stores.
#[derive(Clone)]
pub struct TriageDeps {
    pub stores: Stores,
    pub gateway: ToolGateway,
    pub bridge: Arc<dyn ChannelBridge>,
    pub catalog: Arc<ServiceCatalog>,
    pub config: Arc<CoordinatorConfig>,
    pub llm: Option<LlmConfig>,
    pub operator_tx: mpsc::UnboundedSender<OperatorAlert>,
}

impl TriageDeps {
    pub fn budget(&self) -> ActionBudget {
        ActionBudget {
            max_tool_calls: self.config.max_tool_calls,
            max_turns: self.config.max_turns,
        }
    }

    pub fn dispatch_context(&self, incident: &Incident, deadline: Instant) -> DispatchContext {
        DispatchContext {
            incident_id: incident.incident_id.clone(),
            service: incident.service.clone(),
            stores: self.stores.clone(),
            gateway: self.gateway.clone(),
            tool_timeout: self.config.tool_timeout(),
            deadline,
        }
    }

    pub fn investigator(&self) -> Investigator {
        Investigator::new(
            self.catalog.clone(),
            self.gateway.kinds(),
            self.config.lookback_mins,
        )
    }

    pub fn manager(&self) -> Manager {
        Manager::new(self.catalog.clone(), self.config.clone())
    }

    /// Best-effort operator notification; the receiver may be gone.
    pub fn alert_operator(&self, incident_id: &str, reason: &str) {
        let alert = OperatorAlert {
            incident_id: incident_id.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        };
        if self.operator_tx.send(alert).is_err() {
            warn!(incident_id, "operator alert channel closed");
        }
        let _ = self.stores.events.append(&Event::new(
            incident_id,
            EventType::OperatorAlerted,
            format!("operator alerted: {reason}"),
        ));
    }
}

pub struct Coordinator {
    deps: TriageDeps,
    incident_id: String,
    /// Receipt plus the response budget.
    deadline: Instant,
}

impl Coordinator {
    /// Persists the incident and spawns its coordinator. A second alert for
    /// an incident that already exists is rejected with `Duplicate`.
    pub fn start(
        deps: TriageDeps,
        alert: CanonicalAlert,
    ) -> Result<JoinHandle<IncidentStatus>, LaunchError> {
        let budget = deps.config.response_budget();
        let deadline = Instant::now() + budget;
        let now = Utc::now();
        let incident = Incident {
            incident_id: alert.incident_id.clone(),
            service: alert.service.trim().to_string(),
            severity: Severity::parse(&alert.severity),
            status: IncidentStatus::Received,
            created_at: now,
            deadline_at: now + chrono::Duration::milliseconds(budget.as_millis() as i64),
            owner: None,
            channel: None,
            degraded: false,
            failure_reason: None,
            alert,
        };
        deps.stores.incidents.create(&incident)?;
        deps.stores.events.append(
            &Event::new(
                &incident.incident_id,
                EventType::IncidentReceived,
                format!("alert received: {}", incident.alert.title),
            )
            .with_details(serde_json::to_value(&incident.alert).map_err(StoreError::from)?),
        )?;
        info!(incident_id = %incident.incident_id, service = %incident.service, "incident received");

        let coordinator = Coordinator {
            deps,
            incident_id: incident.incident_id,
            deadline,
        };
        Ok(tokio::spawn(coordinator.run()))
    }

    /// Picks an incident that was handed off before a restart back up. The
    /// idle timer counts from the last recorded event and the thread is read
    /// after the last message that was already answered.
    pub fn resume(deps: TriageDeps, incident: Incident) -> JoinHandle<IncidentStatus> {
        let coordinator = Coordinator {
            deps,
            incident_id: incident.incident_id.clone(),
            deadline: Instant::now(),
        };
        tokio::spawn(async move {
            let (last_activity, cursor) = match coordinator.resume_point() {
                Ok(point) => point,
                Err(err) => return coordinator.fail(&format!("persistence failure: {err}")),
            };
            info!(incident_id = %incident.incident_id, cursor = ?cursor, "resuming hand-off");
            match coordinator.await_human(incident.channel, last_activity, cursor).await {
                Ok(status) => status,
                Err(err) => coordinator.fail(&format!("persistence failure: {err}")),
            }
        })
    }

    async fn run(self) -> IncidentStatus {
        match self.drive().await {
            Ok(status) => status,
            Err(err) => self.fail(&format!("persistence failure: {err}")),
        }
    }

    async fn drive(&self) -> Result<IncidentStatus, StoreError> {
        let ctx = self.context()?;
        let responder = Responder::new(self.deps.catalog.clone());
        match responder.act(&ctx).await {
            RoleOutput::Artifact(Artifact::Acknowledgement(ack)) => {
                debug!(incident_id = %self.incident_id, service = %ack.service, severity = ack.severity.as_str(), "alert validated");
            }
            RoleOutput::Abstain { reason } => return Ok(self.fail(&reason)),
            _ => return Ok(self.fail("responder returned no acknowledgement")),
        }

        self.transition(IncidentStatus::Acknowledged)?;
        self.acknowledge_alert(&ctx.incident);

        self.transition(IncidentStatus::Investigating)?;
        let issued = self.investigate().await?;

        self.transition(IncidentStatus::Diagnosing)?;
        self.diagnose(issued).await?;

        self.transition(IncidentStatus::Escalating)?;
        let Some(outcome) = self.escalate().await? else {
            return Ok(self.fail("escalation could not reach any human"));
        };

        self.transition(IncidentStatus::AwaitingHuman)?;
        self.await_human(outcome.channel, Instant::now(), None).await
    }

    fn resume_point(&self) -> Result<(Instant, Option<String>), StoreError> {
        let events = self.deps.stores.events.events_for_incident(&self.incident_id)?;
        let idle_for = events
            .last()
            .and_then(|event| (Utc::now() - event.timestamp).to_std().ok())
            .unwrap_or_default();
        let last_activity = Instant::now()
            .checked_sub(idle_for)
            .unwrap_or_else(Instant::now);
        let cursor = events
            .iter()
            .rev()
            .filter(|event| event.event_type == EventType::ThreadMessage)
            .find_map(|event| {
                event
                    .details
                    .as_ref()
                    .and_then(|d| d.get("message_id"))
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
            });
        Ok((last_activity, cursor))
    }

    fn context(&self) -> Result<RoleContext, StoreError> {
        RoleContext::load(&self.deps.stores, &self.incident_id, self.deps.budget())
    }

    fn transition(&self, next: IncidentStatus) -> Result<bool, StoreError> {
        let moved = self.deps.stores.incidents.advance(&self.incident_id, next)?;
        if moved {
            self.deps.stores.events.append(
                &Event::new(
                    &self.incident_id,
                    EventType::StatusChanged,
                    format!("status -> {}", next.as_str()),
                )
                .with_details(serde_json::json!({ "status": next.as_str() })),
            )?;
            info!(incident_id = %self.incident_id, status = next.as_str(), "status changed");
        } else {
            warn!(incident_id = %self.incident_id, status = next.as_str(), "transition refused");
        }
        Ok(moved)
    }

    fn fail(&self, reason: &str) -> IncidentStatus {
        match self.deps.stores.incidents.mark_failed(&self.incident_id, reason) {
            Ok(true) => {
                let _ = self.deps.stores.events.append(
                    &Event::new(
                        &self.incident_id,
                        EventType::StatusChanged,
                        format!("status -> failed: {reason}"),
                    )
                    .with_details(serde_json::json!({ "status": "failed", "reason": reason })),
                );
            }
            Ok(false) => {}
            Err(err) => error!(incident_id = %self.incident_id, error = %err, "could not record failure"),
        }
        error!(incident_id = %self.incident_id, reason, "incident failed");
        self.deps.alert_operator(&self.incident_id, reason);
        IncidentStatus::Failed
    }

    /// Fire-and-forget; the outcome is recorded like any other tool call.
    fn acknowledge_alert(&self, incident: &Incident) {
        if !self.deps.gateway.supports(IntegrationKind::PagerDuty) {
            return;
        }
        let request = ToolRequest::new(
            RoleKind::Responder,
            ToolOperation::PagerdutyAcknowledge {
                incident_id: incident.alert.incident_id.clone(),
            },
        );
        let (done_tx, _done_rx) = mpsc::unbounded_channel();
        executor::spawn_tool_call(
            self.deps.dispatch_context(incident, self.deadline),
            request,
            done_tx,
        );
    }

    /// Runs investigation turns until the Investigator has nothing more to
    /// ask, the budget is spent, or the deadline fires. Returns how many
    /// calls were issued.
    async fn investigate(&self) -> Result<usize, StoreError> {
        let investigator = self.deps.investigator();
        let budget = self.deps.budget();
        let mut spent = 0;

        for turn in 0..budget.max_turns {
            if Instant::now() >= self.deadline {
                break;
            }
            let mut ctx = self.context()?;
            ctx.turn = turn;
            ctx.spent_tool_calls = spent;

            let requests = match investigator.act(&ctx).await {
                RoleOutput::Dispatch(requests) => requests,
                RoleOutput::Abstain { reason } => {
                    debug!(incident_id = %self.incident_id, turn, reason = %reason, "investigator done");
                    break;
                }
                RoleOutput::Artifact(_) => break,
            };
            spent += requests.len();
            info!(incident_id = %self.incident_id, turn, calls = requests.len(), "dispatching evidence queries");

            let dispatch = self.deps.dispatch_context(&ctx.incident, self.deadline);
            let report = executor::dispatch_all(&dispatch, requests).await?;
            if report.deadline_hit {
                warn!(
                    incident_id = %self.incident_id,
                    outstanding = report.outstanding(),
                    "deadline fired; diagnosing with partial evidence"
                );
                break;
            }
        }
        Ok(spent)
    }

    async fn diagnose(&self, issued: usize) -> Result<(), StoreError> {
        let mut ctx = self.context()?;
        let finished = ctx
            .tool_calls
            .iter()
            .filter(|call| call.role == RoleKind::Investigator)
            .count();
        ctx.outstanding_calls = issued.saturating_sub(finished);

        let analyst = Analyst::new(self.deps.llm.clone());
        // Refinement must not hold the incident past its deadline.
        let draft = match tokio::time::timeout_at(self.deadline, analyst.act(&ctx)).await {
            Ok(RoleOutput::Artifact(Artifact::Diagnosis(draft))) => draft,
            _ => analyst::diagnose(&ctx),
        };

        let diagnosis = draft.into_diagnosis(&self.incident_id);
        let id = self.deps.stores.incidents.record_diagnosis(&diagnosis)?;
        self.deps.stores.events.append(
            &Event::new(
                &self.incident_id,
                EventType::DiagnosisRecorded,
                format!("diagnosis: {}", diagnosis.hypothesis),
            )
            .with_details(serde_json::json!({
                "diagnosis_id": id,
                "confidence": diagnosis.confidence,
                "low_confidence": diagnosis.low_confidence,
                "citations": diagnosis.citations,
            })),
        )?;
        info!(
            incident_id = %self.incident_id,
            confidence = diagnosis.confidence,
            low_confidence = diagnosis.low_confidence,
            "diagnosis recorded"
        );
        Ok(())
    }

    async fn escalate(&self) -> Result<Option<EscalationOutcome>, StoreError> {
        let ctx = self.context()?;
        let Some(diagnosis) = ctx.diagnosis.as_ref() else {
            warn!(incident_id = %self.incident_id, "no diagnosis to escalate");
            return Ok(None);
        };
        let plan = match self.deps.manager().act(&ctx).await {
            RoleOutput::Artifact(Artifact::Escalation(plan)) => plan,
            _ => self.deps.manager().plan(&ctx, diagnosis),
        };

        self.deps
            .stores
            .incidents
            .record_candidates(&self.incident_id, diagnosis.id, &plan.candidates)?;
        let teams: Vec<&str> = plan.candidates.iter().map(|c| c.team.as_str()).collect();
        self.deps.stores.events.append(
            &Event::new(
                &self.incident_id,
                EventType::CandidatesRecorded,
                format!("primary owner: {}", plan.primary.display_name),
            )
            .with_details(serde_json::json!({
                "candidates": teams,
                "primary": plan.primary.team,
                "fallback": plan.fallback.team,
            })),
        )?;

        let outcome = escalation::escalate(&self.deps, &ctx.incident, &plan).await?;
        if let Some(outcome) = &outcome {
            if outcome.degraded {
                self.deps.alert_operator(
                    &self.incident_id,
                    &format!("escalation degraded; handed to {}", outcome.owner.display_name),
                );
            }
        }
        Ok(outcome)
    }

    /// Routes thread messages to follow-up answering until the incident is
    /// resolved externally or nobody has spoken for the idle timeout. Without
    /// a channel only HTTP follow-ups and resolution can arrive.
    async fn await_human(
        &self,
        channel: Option<ChannelRef>,
        mut last_activity: Instant,
        mut cursor: Option<String>,
    ) -> Result<IncidentStatus, StoreError> {
        let idle_timeout = self.deps.config.human_idle_timeout();
        let poll = self.deps.config.thread_poll_interval();

        loop {
            if self.deps.stores.events.close_requested(&self.incident_id)? {
                info!(incident_id = %self.incident_id, "resolution requested");
                self.transition(IncidentStatus::Closed)?;
                return Ok(IncidentStatus::Closed);
            }
            if last_activity.elapsed() >= idle_timeout {
                info!(incident_id = %self.incident_id, "no human activity; closing");
                self.transition(IncidentStatus::Closed)?;
                return Ok(IncidentStatus::Closed);
            }

            if let Some(channel) = &channel {
                match self.deps.bridge.read_thread(channel, cursor.as_deref()).await {
                    Ok(messages) => {
                        for message in messages {
                            cursor = Some(message.id.clone());
                            last_activity = Instant::now();
                            followup::answer_thread_message(&self.deps, &self.incident_id, &message)
                                .await?;
                        }
                    }
                    Err(err) => warn!(incident_id = %self.incident_id, error = %err, "thread read failed"),
                }
            }
            tokio::time::sleep(poll).await;
        }
    }
}
