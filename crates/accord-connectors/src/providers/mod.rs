//! Connector implementations for external identity systems

pub mod azure;
pub mod google;
pub mod scim;

#[cfg(feature = "ldap")]
pub mod ldap;

mod common;

pub use common::*;

use accord_core::{connector_types, Connector, ConnectorConfig, Result};

use crate::registry::ConnectorRegistry;

/// Register a factory for every bundled connector type
pub async fn register_builtin(registry: &ConnectorRegistry) {
    registry
        .register(
            connector_types::SCIM,
            |config: &ConnectorConfig| -> Result<Box<dyn Connector>> {
                Ok(Box::new(scim::ScimConnector::new(config)?))
            },
        )
        .await;

    registry
        .register(
            connector_types::AZURE_AD,
            |config: &ConnectorConfig| -> Result<Box<dyn Connector>> {
                Ok(Box::new(azure::AzureAdConnector::new(config)?))
            },
        )
        .await;

    registry
        .register(
            connector_types::GOOGLE,
            |config: &ConnectorConfig| -> Result<Box<dyn Connector>> {
                Ok(Box::new(google::GoogleWorkspaceConnector::new(config)?))
            },
        )
        .await;

    #[cfg(feature = "ldap")]
    registry
        .register(
            connector_types::LDAP,
            |config: &ConnectorConfig| -> Result<Box<dyn Connector>> {
                Ok(Box::new(ldap::LdapConnector::new(config)?))
            },
        )
        .await;
}
