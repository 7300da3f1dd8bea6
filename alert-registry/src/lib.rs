use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ALERT_SCHEMA_V1: &str = "alert.v1";

/// Source-neutral shape every inbound webhook is parsed into before an
/// incident is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalAlert {
    pub schema: String,
    pub incident_id: String,
    pub service: String,
    pub severity: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// RFC 3339.
    pub triggered_at: String,
    #[serde(default)]
    pub html_url: Option<String>,
    pub source: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("unsupported schema '{0}'")]
    UnsupportedSchema(String),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid severity '{0}'")]
    InvalidSeverity(String),
    #[error("invalid trigger time '{0}'")]
    InvalidTimestamp(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Maps the severity vocabularies we receive (PagerDuty urgency, PagerDuty
/// priorities, Events API v2 severities, plain levels) onto
/// `critical | high | medium | low`.
pub fn normalize_severity(value: &str) -> Option<&'static str> {
    match value.trim().to_lowercase().as_str() {
        "critical" | "p1" | "sev1" | "sev-1" => Some("critical"),
        "high" | "error" | "p2" | "sev2" | "sev-2" => Some("high"),
        "medium" | "warning" | "p3" | "sev3" | "sev-3" => Some("medium"),
        "low" | "info" | "p4" | "p5" | "sev4" | "sev-4" => Some("low"),
        _ => None,
    }
}

pub fn validate_alert(alert: &CanonicalAlert) -> Result<(), AlertError> {
    if alert.schema != ALERT_SCHEMA_V1 {
        return Err(AlertError::UnsupportedSchema(alert.schema.clone()));
    }
    if alert.incident_id.trim().is_empty() {
        return Err(AlertError::Missing("incident id"));
    }
    if alert.service.trim().is_empty() {
        return Err(AlertError::Missing("service"));
    }
    if alert.title.trim().is_empty() {
        return Err(AlertError::Missing("title"));
    }
    if normalize_severity(&alert.severity).is_none() {
        return Err(AlertError::InvalidSeverity(alert.severity.clone()));
    }
    if chrono::DateTime::parse_from_rfc3339(&alert.triggered_at).is_err() {
        return Err(AlertError::InvalidTimestamp(alert.triggered_at.clone()));
    }
    Ok(())
}
