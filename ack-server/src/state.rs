use ack_core::event_log::{Event, EventType};
use ack_core::{Coordinator, IncidentStatus, LaunchError, StoreError, TriageDeps};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, info, warn};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub deps: TriageDeps,
}

impl AppState {
    pub fn new(deps: TriageDeps) -> Self {
        Self { deps }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("incident '{0}' not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LaunchError> for ApiError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::Duplicate(id) => Self::Conflict(format!("incident '{id}' already exists")),
            LaunchError::Store(err) => Self::Store(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Store(err) => {
                error!(error = %err, "store unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Settlement {
    pub failed: usize,
    pub resumed: usize,
}

/// Incidents left open by a previous process have no coordinator any more.
/// Those still in triage are failed and surfaced to the operator; those
/// already handed to a human get a coordinator back so their thread keeps
/// being answered and they still close on resolution or inactivity.
pub fn settle_orphans(deps: &TriageDeps) -> Result<Settlement, StoreError> {
    let mut settled = Settlement::default();
    for incident in deps.stores.incidents.open_incidents()? {
        if incident.status == IncidentStatus::AwaitingHuman {
            info!(incident_id = %incident.incident_id, "resuming hand-off after restart");
            drop(Coordinator::resume(deps.clone(), incident));
            settled.resumed += 1;
            continue;
        }

        let id = &incident.incident_id;
        let reason = format!("triage interrupted by restart while {}", incident.status.as_str());
        if !deps.stores.incidents.mark_failed(id, &reason)? {
            continue;
        }
        deps.stores.events.append(
            &Event::new(id, EventType::StatusChanged, format!("status -> failed: {reason}"))
                .with_details(serde_json::json!({ "status": "failed", "reason": reason })),
        )?;
        warn!(incident_id = %id, "{reason}");
        deps.alert_operator(id, &reason);
        settled.failed += 1;
    }
    Ok(settled)
}
