//! Uniform invocation over every external system.
//!
//! Integrations only translate a [`ToolOperation`] into a vendor call and a
//! normalized payload. Timeouts, the single bounded retry and error shaping
//! live here so every integration behaves the same way under failure.

use ack_effects::{Effectful, Recovery};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ToolError, ToolErrorKind};
use crate::model::IntegrationKind;
use crate::tools::ToolOperation;

#[async_trait]
pub trait Integration: Send + Sync {
    fn kind(&self) -> IntegrationKind;

    async fn call(&self, operation: &ToolOperation) -> Result<Value, ToolError>;
}

/// Outcome of one gateway invocation including retries.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub result: Result<Value, ToolError>,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct ToolGateway {
    integrations: HashMap<IntegrationKind, Arc<dyn Integration>>,
    retry_backoff: Duration,
}

impl ToolGateway {
    pub fn new(retry_backoff: Duration) -> Self {
        Self {
            integrations: HashMap::new(),
            retry_backoff,
        }
    }

    pub fn register(&mut self, integration: Arc<dyn Integration>) {
        self.integrations.insert(integration.kind(), integration);
    }

    pub fn with(mut self, integration: Arc<dyn Integration>) -> Self {
        self.register(integration);
        self
    }

    pub fn supports(&self, kind: IntegrationKind) -> bool {
        self.integrations.contains_key(&kind)
    }

    /// Registered integrations in investigation order.
    pub fn kinds(&self) -> Vec<IntegrationKind> {
        IntegrationKind::ALL
            .into_iter()
            .filter(|kind| self.supports(*kind))
            .collect()
    }

    /// Runs `operation` with a hard `timeout` covering every attempt.
    ///
    /// At most one retry is made, after `retry_backoff`, and only when the
    /// operation's recovery policy allows it and the backoff still fits in
    /// the remaining time.
    pub async fn invoke(&self, operation: &ToolOperation, timeout: Duration) -> Invocation {
        let kind = operation.integration();
        let Some(integration) = self.integrations.get(&kind).cloned() else {
            return Invocation {
                result: Err(ToolError::new(
                    ToolErrorKind::Unavailable,
                    format!("no {} integration configured", kind.as_str()),
                )),
                attempts: 0,
            };
        };

        let deadline = Instant::now() + timeout;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let attempt = tokio::time::timeout_at(deadline, integration.call(operation)).await;
            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(ToolError::new(
                    ToolErrorKind::Timeout,
                    format!("{} exceeded {}ms", operation.name(), timeout.as_millis()),
                )),
            };

            let err = match result {
                Ok(value) => {
                    debug!(operation = operation.name(), attempts, "tool call succeeded");
                    return Invocation {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(err) => err,
            };

            let fits = Instant::now() + self.retry_backoff < deadline;
            if attempts > 1 || !fits || !retryable(operation, err.kind) {
                warn!(
                    operation = operation.name(),
                    integration = kind.as_str(),
                    attempts,
                    error = %err,
                    "tool call failed"
                );
                return Invocation {
                    result: Err(err),
                    attempts,
                };
            }

            warn!(
                operation = operation.name(),
                backoff_ms = self.retry_backoff.as_millis() as u64,
                error = %err,
                "retrying tool call"
            );
            tokio::time::sleep(self.retry_backoff).await;
        }
    }
}

fn retryable(operation: &ToolOperation, kind: ToolErrorKind) -> bool {
    match operation.effect().recovery() {
        Recovery::Retry => matches!(kind, ToolErrorKind::RateLimited | ToolErrorKind::Unavailable),
        Recovery::RetryIfRejected => kind == ToolErrorKind::RateLimited,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedIntegration;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn nodes() -> ToolOperation {
        ToolOperation::KubernetesNodes { pod_selector: None }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_integration_times_out_instead_of_hanging() {
        let gateway = ToolGateway::new(Duration::from_millis(500)).with(Arc::new(
            ScriptedIntegration::new(IntegrationKind::Kubernetes, |_| Ok(json!({"items": []})))
                .with_latency(Duration::from_secs(60)),
        ));

        let started = Instant::now();
        let invocation = gateway.invoke(&nodes(), Duration::from_secs(5)).await;
        assert_eq!(invocation.result.expect_err("timeout").kind, ToolErrorKind::Timeout);
        assert_eq!(invocation.attempts, 1);
        assert!(started.elapsed() <= Duration::from_secs(5) + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_read_is_retried_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let gateway = ToolGateway::new(Duration::from_millis(200)).with(Arc::new(
            ScriptedIntegration::new(IntegrationKind::Kubernetes, move |_| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ToolError::new(ToolErrorKind::Unavailable, "503"))
                } else {
                    Ok(json!({"items": []}))
                }
            }),
        ));

        let invocation = gateway.invoke(&nodes(), Duration::from_secs(5)).await;
        assert!(invocation.result.is_ok());
        assert_eq!(invocation.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failure_stops_after_one_retry() {
        let gateway = ToolGateway::new(Duration::from_millis(200)).with(Arc::new(
            ScriptedIntegration::new(IntegrationKind::Kubernetes, |_| {
                Err(ToolError::new(ToolErrorKind::RateLimited, "429"))
            }),
        ));
        let invocation = gateway.invoke(&nodes(), Duration::from_secs(5)).await;
        assert_eq!(invocation.attempts, 2);
        assert_eq!(invocation.result.expect_err("fails").kind, ToolErrorKind::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_reassign_is_not_retried() {
        let gateway = ToolGateway::new(Duration::from_millis(200)).with(Arc::new(
            ScriptedIntegration::new(IntegrationKind::PagerDuty, |_| {
                Err(ToolError::new(ToolErrorKind::Unavailable, "502"))
            }),
        ));
        let reassign = ToolOperation::PagerdutyReassign {
            incident_id: "PD-1".into(),
            assignee: "PINF02".into(),
        };
        let invocation = gateway.invoke(&reassign, Duration::from_secs(5)).await;
        assert_eq!(invocation.attempts, 1);
    }

    #[tokio::test]
    async fn missing_integration_is_unavailable() {
        let gateway = ToolGateway::new(Duration::from_millis(200));
        let invocation = gateway.invoke(&nodes(), Duration::from_secs(1)).await;
        assert_eq!(invocation.attempts, 0);
        assert_eq!(invocation.result.expect_err("missing").kind, ToolErrorKind::Unavailable);
        assert!(gateway.kinds().is_empty());
    }
}
