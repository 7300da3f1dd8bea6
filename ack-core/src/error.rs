//! Error taxonomy for the orchestrator.
//!
//! Only [`StoreError`] is allowed to cross from a role or tool call into the
//! coordinator. Tool and bridge failures are absorbed where they happen and
//! turn into lower-confidence output or a degraded escalation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized failure classes for every integration behind the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Unauthorized,
    NotFound,
    RateLimited,
    Timeout,
    Unavailable,
    InvalidRequest,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::Unauthorized => "unauthorized",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::RateLimited => "rate_limited",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Unavailable => "unavailable",
            ToolErrorKind::InvalidRequest => "invalid_request",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unauthorized" => Some(ToolErrorKind::Unauthorized),
            "not_found" => Some(ToolErrorKind::NotFound),
            "rate_limited" => Some(ToolErrorKind::RateLimited),
            "timeout" => Some(ToolErrorKind::Timeout),
            "unavailable" => Some(ToolErrorKind::Unavailable),
            "invalid_request" => Some(ToolErrorKind::InvalidRequest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}: {message}", kind.as_str())]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Maps a vendor HTTP status onto the gateway taxonomy.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ToolErrorKind::Unauthorized,
            404 | 410 => ToolErrorKind::NotFound,
            429 => ToolErrorKind::RateLimited,
            408 | 504 => ToolErrorKind::Timeout,
            500..=599 => ToolErrorKind::Unavailable,
            _ => ToolErrorKind::InvalidRequest,
        };
        Self::new(kind, message)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("incident {0} already exists")]
    Duplicate(String),
    #[error("incident {0} not found")]
    NotFound(String),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("chat surface unavailable: {0}")]
    Unavailable(String),
    #[error("chat surface rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("inconsistent catalog: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("incident {0} is already being handled")]
    Duplicate(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LaunchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => LaunchError::Duplicate(id),
            other => LaunchError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_normalize() {
        assert_eq!(ToolError::from_http_status(403, "x").kind, ToolErrorKind::Unauthorized);
        assert_eq!(ToolError::from_http_status(429, "x").kind, ToolErrorKind::RateLimited);
        assert_eq!(ToolError::from_http_status(503, "x").kind, ToolErrorKind::Unavailable);
        assert_eq!(ToolError::from_http_status(504, "x").kind, ToolErrorKind::Timeout);
        assert_eq!(ToolError::from_http_status(422, "x").kind, ToolErrorKind::InvalidRequest);
    }

    #[test]
    fn duplicate_store_error_becomes_duplicate_launch() {
        let err: LaunchError = StoreError::Duplicate("PD-1".into()).into();
        assert!(matches!(err, LaunchError::Duplicate(id) if id == "PD-1"));
    }
}
