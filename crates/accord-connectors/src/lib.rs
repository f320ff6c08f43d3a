//! Accord Connectors - Pluggable connectors to external identity systems
//!
//! This crate provides:
//! - `ConnectorRegistry`: connector-type factories and live instances
//! - `ConnectorService`: connector configuration CRUD kept in step with the registry
//! - Adapters for SCIM 2.0, Azure AD, Google Workspace and LDAP (optional)
//!
//! Every adapter implements the `accord_core::Connector` contract and maps
//! its transport failures onto `AccordError`.

pub mod providers;
pub mod registry;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use providers::azure::AzureAdConnector;
pub use providers::google::GoogleWorkspaceConnector;
pub use providers::register_builtin;
pub use providers::scim::ScimConnector;

#[cfg(feature = "ldap")]
pub use providers::ldap::LdapConnector;

pub use registry::{ConnectorRegistry, Registration};
pub use service::{ConnectorService, ServiceSettings};
