//! Static ownership and capability metadata.
//!
//! The catalog answers three questions for the roles: is this service known,
//! which integrations apply to it (by service category), and which team owns
//! a given component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;
use crate::model::{Component, IntegrationKind, OnCallContact};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardPanel {
    pub dashboard_uid: String,
    pub panel_id: u32,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub category: String,
    pub team: String,
    pub namespace: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub dashboards: Vec<DashboardPanel>,
    /// Backing components the service depends on, e.g. `database`.
    #[serde(default)]
    pub dependencies: Vec<Component>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamEntry {
    pub display_name: String,
    pub oncall: OnCallContact,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCatalog {
    pub services: BTreeMap<String, ServiceEntry>,
    pub teams: BTreeMap<String, TeamEntry>,
    /// Owner of shared infrastructure components (node, database, ...).
    #[serde(default)]
    pub component_owners: BTreeMap<Component, String>,
    /// Service category -> integrations worth querying for it.
    #[serde(default)]
    pub integrations: BTreeMap<String, Vec<IntegrationKind>>,
}

impl ServiceCatalog {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let catalog: ServiceCatalog = serde_json::from_str(&raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Every team reference must resolve so that ownership lookups never
    /// dead-end during escalation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, service) in &self.services {
            if !self.teams.contains_key(&service.team) {
                return Err(ConfigError::Inconsistent(format!(
                    "service {name} is owned by unknown team {}",
                    service.team
                )));
            }
        }
        for (component, team) in &self.component_owners {
            if !self.teams.contains_key(team) {
                return Err(ConfigError::Inconsistent(format!(
                    "component {component:?} is owned by unknown team {team}"
                )));
            }
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn team(&self, id: &str) -> Option<&TeamEntry> {
        self.teams.get(id)
    }

    /// Integrations registered for the service's category, in catalog order.
    /// Unknown categories get every integration.
    pub fn integrations_for(&self, service: &str) -> Vec<IntegrationKind> {
        self.service(service)
            .and_then(|entry| self.integrations.get(&entry.category))
            .cloned()
            .unwrap_or_else(|| IntegrationKind::ALL.to_vec())
    }

    /// Team responsible for `component` when seen while triaging `service`.
    /// Service-local components belong to the service's own team.
    pub fn owner_of(&self, component: Component, service: &str) -> Option<&str> {
        let service_team = self.service(service).map(|s| s.team.as_str());
        match component {
            Component::Service | Component::Pod | Component::CodeChange => service_team,
            shared => self
                .component_owners
                .get(&shared)
                .map(String::as_str)
                .or(service_team),
        }
    }

    /// Built-in catalog used by the demo server and the tests.
    pub fn demo() -> Self {
        let team = |display: &str, name: &str, chat: &str, pd: &str| TeamEntry {
            display_name: display.into(),
            oncall: OnCallContact {
                name: name.into(),
                chat_user: chat.into(),
                pagerduty_user: pd.into(),
            },
        };

        let mut teams = BTreeMap::new();
        teams.insert("payments".into(), team("Payments", "Ana Ruiz", "U01PAY", "PPAY01"));
        teams.insert(
            "container-infra".into(),
            team("Container-Infra", "Kenji Sato", "U02INF", "PINF02"),
        );
        teams.insert("database".into(), team("Database", "Priya Nair", "U03DBA", "PDBA03"));
        teams.insert("sre".into(), team("SRE", "Sam Okafor", "U04SRE", "PSRE04"));

        let mut services = BTreeMap::new();
        services.insert(
            "payments-api".into(),
            ServiceEntry {
                category: "web-api".into(),
                team: "payments".into(),
                namespace: "payments".into(),
                repository: Some("acme/payments-api".into()),
                dashboards: vec![DashboardPanel {
                    dashboard_uid: "payments-overview".into(),
                    panel_id: 4,
                    title: "Payments API latency".into(),
                }],
                dependencies: vec![Component::Database],
            },
        );
        services.insert(
            "ledger-worker".into(),
            ServiceEntry {
                category: "batch".into(),
                team: "payments".into(),
                namespace: "payments".into(),
                repository: Some("acme/ledger-worker".into()),
                dashboards: Vec::new(),
                dependencies: vec![Component::Database],
            },
        );

        let mut component_owners = BTreeMap::new();
        component_owners.insert(Component::Node, "container-infra".to_string());
        component_owners.insert(Component::Network, "container-infra".to_string());
        component_owners.insert(Component::Database, "database".to_string());
        component_owners.insert(Component::Cache, "database".to_string());

        let mut integrations = BTreeMap::new();
        integrations.insert(
            "web-api".to_string(),
            vec![
                IntegrationKind::Kubernetes,
                IntegrationKind::Prometheus,
                IntegrationKind::Splunk,
                IntegrationKind::Github,
                IntegrationKind::Grafana,
                IntegrationKind::PagerDuty,
            ],
        );
        integrations.insert(
            "batch".to_string(),
            vec![
                IntegrationKind::Kubernetes,
                IntegrationKind::Splunk,
                IntegrationKind::Github,
            ],
        );

        Self {
            services,
            teams,
            component_owners,
            integrations,
        }
    }
}
