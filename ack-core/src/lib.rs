//! Incident triage engine: stores, tool gateway, roles and the per-incident
//! coordinator that drives an alert from receipt to a human hand-off.

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod escalation;
pub mod event_log;
pub mod evidence;
pub mod executor;
pub mod followup;
pub mod gateway;
pub mod incidents;
pub mod llm;
pub mod model;
pub mod render;
pub mod roles;
pub mod similarity;
pub mod summary;
pub mod testing;
pub mod tools;

pub use bridge::{ChannelBridge, ThreadMessage};
pub use catalog::ServiceCatalog;
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, OperatorAlert, TriageDeps};
pub use db::Stores;
pub use error::{BridgeError, ConfigError, LaunchError, StoreError, ToolError, ToolErrorKind};
pub use gateway::{Integration, ToolGateway};
pub use model::{Incident, IncidentStatus, IntegrationKind};
pub use tools::ToolOperation;
