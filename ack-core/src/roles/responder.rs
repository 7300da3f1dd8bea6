use async_trait::async_trait;
use std::sync::Arc;

use super::{Acknowledgement, Artifact, Role, RoleContext, RoleOutput};
use crate::catalog::ServiceCatalog;
use crate::model::{RoleKind, Severity};

/// Confirms the alert refers to a known service and has a usable severity.
pub struct Responder {
    catalog: Arc<ServiceCatalog>,
}

impl Responder {
    pub fn new(catalog: Arc<ServiceCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Role for Responder {
    fn kind(&self) -> RoleKind {
        RoleKind::Responder
    }

    async fn act(&self, ctx: &RoleContext) -> RoleOutput {
        let alert = &ctx.incident.alert;
        let service = alert.service.trim();
        if self.catalog.service(service).is_none() {
            return RoleOutput::abstain(format!("unknown service '{service}'"));
        }
        let Some(severity) = Severity::parse(&alert.severity) else {
            return RoleOutput::abstain(format!("unparseable severity '{}'", alert.severity));
        };

        RoleOutput::Artifact(Artifact::Acknowledgement(Acknowledgement {
            service: service.to_string(),
            severity,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidents::tests::sample_incident;
    use crate::roles::test_context;

    fn context(service: &str) -> RoleContext {
        let mut incident = sample_incident("PD-1");
        incident.alert.service = service.into();
        test_context(incident)
    }

    #[tokio::test]
    async fn known_service_is_acknowledged() {
        let responder = Responder::new(Arc::new(ServiceCatalog::demo()));
        let output = responder.act(&context("payments-api")).await;
        assert_eq!(
            output,
            RoleOutput::Artifact(Artifact::Acknowledgement(Acknowledgement {
                service: "payments-api".into(),
                severity: Severity::Critical,
            }))
        );
    }

    #[tokio::test]
    async fn unknown_service_abstains() {
        let responder = Responder::new(Arc::new(ServiceCatalog::demo()));
        let output = responder.act(&context("checkout-web")).await;
        assert!(matches!(output, RoleOutput::Abstain { reason } if reason.contains("checkout-web")));
    }
}
