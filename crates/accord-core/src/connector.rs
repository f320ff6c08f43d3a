//! The uniform contract every external identity system adapter implements

use async_trait::async_trait;

use crate::{
    error::Result,
    ids::ConnectorId,
    models::{ConnectorConfig, ConnectorGroup, ConnectorUser, Page, PageRequest},
};

/// A live adapter bound to one [`ConnectorConfig`].
///
/// Mutating calls are not idempotent in general. A duplicate create surfaces
/// as `Conflict` and a delete of something already gone as `NotFound`, which
/// lets callers tell "already applied" apart from a new effect.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> ConnectorId;

    fn name(&self) -> &str;

    fn connector_type(&self) -> &str;

    /// Open sessions, fetch tokens, bind. Runs once before the instance is shared.
    async fn initialize(&mut self, config: &ConnectorConfig) -> Result<()>;

    /// Cheap round-trip proving the external system is reachable and the
    /// credentials are accepted
    async fn health_check(&self) -> Result<bool>;

    /// Release network sessions. Safe to call more than once.
    async fn close(&self) -> Result<()>;

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    /// Create a user, returning it with the external id filled in
    async fn create_user(&self, user: &ConnectorUser) -> Result<ConnectorUser>;

    async fn get_user(&self, user_id: &str) -> Result<ConnectorUser>;

    async fn update_user(&self, user_id: &str, user: &ConnectorUser) -> Result<ConnectorUser>;

    async fn delete_user(&self, user_id: &str) -> Result<()>;

    async fn list_users(&self, page: &PageRequest) -> Result<Page<ConnectorUser>>;

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    async fn create_group(&self, group: &ConnectorGroup) -> Result<ConnectorGroup>;

    async fn get_group(&self, group_id: &str) -> Result<ConnectorGroup>;

    async fn update_group(&self, group_id: &str, group: &ConnectorGroup)
        -> Result<ConnectorGroup>;

    async fn delete_group(&self, group_id: &str) -> Result<()>;

    async fn list_groups(&self, page: &PageRequest) -> Result<Page<ConnectorGroup>>;

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<()>;

    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<()>;

    /// External ids of the group's direct members
    async fn get_group_members(&self, group_id: &str) -> Result<Vec<String>>;
}

/// Builds an uninitialized connector for one connector type
pub trait ConnectorFactory: Send + Sync {
    fn build(&self, config: &ConnectorConfig) -> Result<Box<dyn Connector>>;
}

impl<F> ConnectorFactory for F
where
    F: Fn(&ConnectorConfig) -> Result<Box<dyn Connector>> + Send + Sync,
{
    fn build(&self, config: &ConnectorConfig) -> Result<Box<dyn Connector>> {
        self(config)
    }
}
